//! Per-adapter degradation tracking: consecutive failures trip the adapter
//! dark for a cooldown instead of hammering a failing vendor.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

pub struct AdapterHealth {
    name: String,
    consecutive_failures: AtomicU32,
    trip_threshold: u32,
    cooldown: Duration,
    tripped_until: Mutex<Option<Instant>>,
}

impl AdapterHealth {
    pub fn new(name: impl Into<String>, trip_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            consecutive_failures: AtomicU32::new(0),
            trip_threshold: trip_threshold.max(1),
            cooldown,
            tripped_until: Mutex::new(None),
        }
    }

    /// False while the adapter is tripped and the cooldown has not elapsed.
    pub fn available(&self) -> bool {
        let mut tripped = self.tripped_until.lock();
        match *tripped {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cooldown elapsed; allow one probe.
                *tripped = None;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.trip_threshold {
            let mut tripped = self.tripped_until.lock();
            if tripped.is_none() {
                warn!(
                    source = %self.name,
                    failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    reason,
                    "adapter tripped"
                );
                *tripped = Some(Instant::now() + self.cooldown);
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}
