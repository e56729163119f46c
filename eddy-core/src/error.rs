use thiserror::Error;

/// Allocation failures. None of these are fatal: callers shed load or retry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("Out of memory: {requested} bytes requested")]
    OutOfMemory { requested: usize },

    #[error("Memory limit exceeded: {requested} bytes requested, {total}/{limit} in use")]
    LimitExceeded {
        requested: usize,
        total: usize,
        limit: usize,
    },

    #[error("Zone exhausted: no free block of order {order}")]
    ZoneExhausted { order: u32 },

    #[error("Invalid page order {order} (max order {max_order})")]
    InvalidOrder { order: u32, max_order: u32 },

    #[error("Invalid layout: size {size}, alignment {align}")]
    InvalidLayout { size: usize, align: usize },
}

/// Thread pool lifecycle errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Thread pool must have at least one worker")]
    Empty,

    #[error("Thread pool already started")]
    AlreadyStarted,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
