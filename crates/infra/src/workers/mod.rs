//! Background workers hosting the outbox processor.

pub mod outbox_worker;

pub use outbox_worker::{OutboxWorker, WorkerHandle, WorkerStats};
