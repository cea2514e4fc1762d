//! Admission control
//!
//! Counts in-flight calls per connection and across the whole gateway
//! within a fixed window. A reply returns headroom through
//! [`Throttle::release`]; entries that are never released reset once their
//! window has elapsed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use microman_config::ThrottleConfig;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Key of the gateway-wide counter
pub const TOTAL_KEY: &str = "total";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("API too busy")]
    TooBusy,

    #[error("API socket max calls exceeded")]
    ConnectionLimit,
}

impl ThrottleError {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            ThrottleError::TooBusy => "throttle_total",
            ThrottleError::ConnectionLimit => "throttle_connection",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ThrottleEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Debug)]
pub struct Throttle {
    period: Duration,
    per_connection: u32,
    total: u32,
    entries: Mutex<HashMap<String, ThrottleEntry>>,
    calls: AtomicU64,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            period: config.period(),
            per_connection: config.per_connection,
            total: config.total,
            entries: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    fn limit(&self, key: &str) -> u32 {
        if key == TOTAL_KEY {
            self.total
        } else {
            self.per_connection
        }
    }

    fn error(key: &str) -> ThrottleError {
        if key == TOTAL_KEY {
            ThrottleError::TooBusy
        } else {
            ThrottleError::ConnectionLimit
        }
    }

    fn increment_locked(&self, entries: &mut HashMap<String, ThrottleEntry>, key: &str, now: Instant) {
        let fresh = ThrottleEntry {
            count: 0,
            window_start: now,
        };
        let entry = entries.entry(key.to_string()).or_insert(fresh);
        if now.saturating_duration_since(entry.window_start) >= self.period {
            *entry = fresh;
        }
        entry.count += 1;
    }

    fn check_locked(
        &self,
        entries: &mut HashMap<String, ThrottleEntry>,
        key: &str,
        now: Instant,
    ) -> Result<(), ThrottleError> {
        let Some(entry) = entries.get(key) else {
            return Ok(());
        };
        if now.saturating_duration_since(entry.window_start) >= self.period {
            entries.remove(key);
            return Ok(());
        }
        if entry.count > self.limit(key) {
            return Err(Self::error(key));
        }
        Ok(())
    }

    pub fn increment(&self, key: &str) {
        self.increment_at(key, Instant::now());
    }

    pub fn increment_at(&self, key: &str, now: Instant) {
        let mut entries = self.entries.lock();
        self.increment_locked(&mut entries, key, now);
    }

    /// Fail when the key is over its limit within the current window
    pub fn check(&self, key: &str) -> Result<(), ThrottleError> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), ThrottleError> {
        let mut entries = self.entries.lock();
        self.check_locked(&mut entries, key, now)
    }

    /// Lower a count, never below zero
    pub fn decrement(&self, key: &str) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    /// Count one call for the connection and the gateway, then check both.
    ///
    /// The global limit is checked first. A rejected call stays counted
    /// until its window ends.
    pub fn admit(&self, connection_id: &str) -> Result<(), ThrottleError> {
        self.admit_at(connection_id, Instant::now())
    }

    pub fn admit_at(&self, connection_id: &str, now: Instant) -> Result<(), ThrottleError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        self.increment_locked(&mut entries, connection_id, now);
        self.increment_locked(&mut entries, TOTAL_KEY, now);
        self.check_locked(&mut entries, TOTAL_KEY, now)?;
        self.check_locked(&mut entries, connection_id, now)
    }

    /// Return the headroom taken by one admitted call
    pub fn release(&self, connection_id: &str) {
        let mut entries = self.entries.lock();
        for key in [connection_id, TOTAL_KEY] {
            if let Some(entry) = entries.get_mut(key) {
                entry.count = entry.count.saturating_sub(1);
            }
        }
    }

    /// Drop a closed connection's entry
    pub fn forget(&self, connection_id: &str) {
        self.entries.lock().remove(connection_id);
    }

    /// Current count of a key, zero when it has no entry
    pub fn count(&self, key: &str) -> u32 {
        self.entries.lock().get(key).map_or(0, |entry| entry.count)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Calls seen since the last call to this method
    pub fn take_calls(&self) -> u64 {
        self.calls.swap(0, Ordering::Relaxed)
    }

    /// Log calls per second once per window while traffic flows
    pub fn spawn_reporter(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let throttle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(throttle.period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                let calls = throttle.take_calls();
                if calls > 0 {
                    let cps = calls as f64 / throttle.period.as_secs_f64();
                    info!(
                        calls,
                        cps = %format!("{:.1}", cps),
                        in_flight = throttle.count(TOTAL_KEY),
                        "Gateway calls"
                    );
                }
            }
        })
    }
}
