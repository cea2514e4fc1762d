//! Consumer statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use microman_observability::metrics::WORKER_MESSAGES;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Handled and acknowledged
    Ack,
    /// Failed, answered with an error and acknowledged
    Failed,
    /// Failed and requeued for one more attempt
    Requeue,
    /// Unreadable and discarded
    Drop,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Failed => "failed",
            Settlement::Requeue => "requeue",
            Settlement::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub handled: u64,
    pub ack: u64,
    pub nack: u64,
    pub requeue: u64,
    pub drop: u64,
    pub failed: u64,
    pub busy_ms: u64,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    handled: AtomicU64,
    ack: AtomicU64,
    nack: AtomicU64,
    requeue: AtomicU64,
    drop: AtomicU64,
    failed: AtomicU64,
    busy_ms: AtomicU64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, settlement: Settlement, busy: Duration) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.busy_ms
            .fetch_add(busy.as_millis() as u64, Ordering::Relaxed);
        match settlement {
            Settlement::Ack => {
                self.ack.fetch_add(1, Ordering::Relaxed);
            }
            Settlement::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.ack.fetch_add(1, Ordering::Relaxed);
            }
            Settlement::Requeue => {
                self.requeue.fetch_add(1, Ordering::Relaxed);
                self.nack.fetch_add(1, Ordering::Relaxed);
            }
            Settlement::Drop => {
                self.drop.fetch_add(1, Ordering::Relaxed);
                self.nack.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::counter!(WORKER_MESSAGES, "outcome" => settlement.as_str()).increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            handled: self.handled.load(Ordering::Relaxed),
            ack: self.ack.load(Ordering::Relaxed),
            nack: self.nack.load(Ordering::Relaxed),
            requeue: self.requeue.load(Ordering::Relaxed),
            drop: self.drop.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            busy_ms: self.busy_ms.load(Ordering::Relaxed),
        }
    }

    /// Log the counters every `interval`, only when they changed
    pub fn spawn_reporter(
        self: &Arc<Self>,
        worker_id: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut last = StatsSnapshot::default();
            let mut last_at = Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let current = stats.snapshot();
                if current == last {
                    continue;
                }
                let elapsed = last_at.elapsed().as_secs_f64();
                let mps = if elapsed > 0.0 {
                    (current.handled - last.handled) as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    worker_id = %worker_id,
                    handled = current.handled,
                    ack = current.ack,
                    nack = current.nack,
                    requeue = current.requeue,
                    drop = current.drop,
                    failed = current.failed,
                    busy_ms = current.busy_ms,
                    mps = %format!("{:.2}", mps),
                    "Consumer stats"
                );
                last = current;
                last_at = Instant::now();
            }
        })
    }
}
