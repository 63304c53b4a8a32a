//! Background drain of per-worker rings into an outbound sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::tracker::context::WorkerTable;
use crate::tracker::events::AllocationEvent;

/// How long the aggregator sleeps between drain cycles.
pub const AGGREGATOR_TICK: Duration = Duration::from_millis(16);

/// Receives event batches. Encoding and transport are entirely the sink's
/// business; the core hands it structured records.
pub trait EventSink: Send + Sync {
    fn emit(&self, batch: &[AllocationEvent]);
}

/// Opaque directive from the outside (UI commands such as `stress_test` or
/// `cleanup`). The core forwards these verbatim.
pub type CommandHandler = Box<dyn Fn(&str) + Send + Sync>;

/// State shared between the façade and the aggregator thread.
///
/// Lock ordering: batch lock before table lock, and neither is ever held
/// together with a shard lock.
pub struct TrackerHub {
    table: WorkerTable,
    batch: Mutex<Vec<AllocationEvent>>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    command_handler: RwLock<Option<CommandHandler>>,
    running: AtomicBool,
}

impl TrackerHub {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        TrackerHub {
            table: WorkerTable::new(),
            batch: Mutex::new(Vec::new()),
            sink: RwLock::new(sink),
            command_handler: RwLock::new(None),
            running: AtomicBool::new(true),
        }
    }

    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn set_sink(&self, sink: Option<Arc<dyn EventSink>>) {
        *self.sink.write() = sink;
    }

    pub fn set_command_handler(&self, handler: CommandHandler) {
        *self.command_handler.write() = Some(handler);
    }

    /// Forward an external command to the installed handler, if any.
    pub fn dispatch_command(&self, command: &str) {
        if let Some(handler) = self.command_handler.read().as_ref() {
            handler(command);
        }
    }

    /// One drain cycle: move everything the workers buffered into the
    /// shared batch, then take the batch if it is non-empty.
    pub fn collect_batch(&self) -> Option<Vec<AllocationEvent>> {
        let mut batch = self.batch.lock();
        self.table.drain_all(&mut batch);
        if batch.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *batch))
    }

    /// One-shot drain for `event_log`: everything buffered right now.
    pub fn take_events(&self) -> Vec<AllocationEvent> {
        self.collect_batch().unwrap_or_default()
    }

    fn emit(&self, batch: &[AllocationEvent]) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink.emit(batch);
        }
    }
}

/// Owns the background thread. Runs from arena start until shutdown; the
/// façade stops and joins it before the shards are released, so no live
/// context outlives its shard.
pub struct Aggregator {
    handle: Option<JoinHandle<()>>,
}

impl Aggregator {
    pub fn start(hub: Arc<TrackerHub>) -> std::io::Result<Aggregator> {
        let handle = thread::Builder::new()
            .name("memviz-aggregator".into())
            .spawn(move || {
                log::debug!("Aggregator: started");
                while hub.is_running() {
                    thread::sleep(AGGREGATOR_TICK);
                    if !hub.is_running() {
                        break;
                    }
                    if let Some(batch) = hub.collect_batch() {
                        hub.emit(&batch);
                    }
                }
                log::debug!("Aggregator: stopped");
            })?;
        Ok(Aggregator {
            handle: Some(handle),
        })
    }

    /// Signal shutdown and wait for the final tick to finish.
    pub fn stop(&mut self, hub: &TrackerHub) {
        hub.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
