mod aggregator;
mod context;
mod events;
mod ring;

pub use aggregator::{AGGREGATOR_TICK, Aggregator, CommandHandler, EventSink, TrackerHub};
pub use context::{WorkerContext, WorkerTable};
pub use events::{AllocationEvent, ArenaSnapshot, BlockMetadata, EventKind};
pub use ring::{RING_CAPACITY, SpscRing};

/// The per-worker ring specialized to allocation events.
pub type EventRing = SpscRing<AllocationEvent>;
