use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("Out of memory: no free block satisfies the request")]
    OutOfMemory,

    #[error("Invalid alignment (must be a nonzero power of 2)")]
    InvalidAlignment,

    #[error("Pointer not owned by this allocator or header corrupted")]
    BadPointer,
}
