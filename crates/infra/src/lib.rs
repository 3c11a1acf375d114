//! Infrastructure layer: outbox storage, processing, config, hosting loop.

pub mod config;
pub mod outbox;
pub mod workers;


pub use config::{ConfigError, OutboxConfig};
pub use outbox::{
    CycleReport, InMemoryOutboxStore, OutboxError, OutboxMessage, OutboxProcessor, OutboxStats,
    OutboxStore, OutboxStoreError, PostgresOutboxStore, RetryPolicy,
};
pub use workers::{OutboxWorker, WorkerHandle, WorkerStats};
