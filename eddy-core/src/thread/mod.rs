//! ## eddy-core::thread
//! **Fixed worker pools**
//!
//! ### Key Submodules:
//! - `pool/`: `ThreadPool`, the `Worker` trait and the mailbox-driven `TaskWorker`

pub mod pool;

pub use pool::{Job, TaskWorker, ThreadPool, Worker, WorkerContext};
