use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sprintforge_events::{Dispatcher, EventSerializer};

use crate::outbox::{CycleReport, OutboxProcessor, OutboxStore};

/// Cumulative counters of a running worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub messages_processed: u64,
    pub messages_duplicated: u64,
    pub messages_retried: u64,
    pub messages_exhausted: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.messages_processed += report.processed as u64;
        self.messages_duplicated += report.duplicates as u64;
        self.messages_retried += report.retried as u64;
        self.messages_exhausted += report.exhausted as u64;
    }
}

/// Handle to control and join a running outbox worker.
///
/// Dropping the handle cancels the worker without waiting for it.
#[derive(Debug)]
pub struct WorkerHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the in-flight cycle to finish.
    ///
    /// Returns the final counters, including that last cycle.
    pub async fn shutdown(mut self) -> WorkerStats {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "outbox worker task panicked");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Hosts an `OutboxProcessor` on a fixed poll interval.
///
/// The first cycle runs immediately. Ticks missed while a cycle is running are
/// skipped, never queued. Store failures are logged and the loop keeps going.
#[derive(Debug)]
pub struct OutboxWorker;

impl OutboxWorker {
    pub fn spawn<S, Z, D>(
        processor: Arc<OutboxProcessor<S, Z, D>>,
        poll_interval: Duration,
    ) -> WorkerHandle
    where
        S: OutboxStore + 'static,
        Z: EventSerializer + 'static,
        D: Dispatcher<Z::Event> + 'static,
    {
        let token = CancellationToken::new();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(worker_loop(
            processor,
            poll_interval,
            token.clone(),
            stats.clone(),
        ));

        WorkerHandle {
            token,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop<S, Z, D>(
    processor: Arc<OutboxProcessor<S, Z, D>>,
    poll_interval: Duration,
    token: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: OutboxStore,
    Z: EventSerializer,
    D: Dispatcher<Z::Event>,
{
    let name = processor.name().to_string();
    info!(worker = %name, ?poll_interval, "outbox worker started");
    let started = Instant::now();

    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let outcome = processor.run_once(&token).await;

                let mut s = lock(&stats);
                s.cycles += 1;
                s.uptime_secs = started.elapsed().as_secs();
                match outcome {
                    Ok(report) => s.absorb(&report),
                    Err(err) => {
                        s.failed_cycles += 1;
                        error!(
                            worker = %name,
                            error = %err,
                            store_failure = err.is_store_failure(),
                            "outbox cycle failed"
                        );
                    }
                }
            }
        }
    }

    info!(worker = %name, "outbox worker stopped");
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
