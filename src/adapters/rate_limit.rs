//! Windowed request gate so each adapter self-polices its vendor quota.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

struct GateState {
    window_start: Instant,
    count: u32,
}

/// Fixed-window rate gate: at most `capacity` acquisitions per `window`.
pub struct RateGate {
    capacity: u32,
    window: Duration,
    state: Mutex<GateState>,
}

impl RateGate {
    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            state: Mutex::new(GateState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Ok when a slot is available; Err carries the wait until the window
    /// rolls over.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }
        if state.count < self.capacity {
            state.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(state.window_start);
            Err(self.window.saturating_sub(elapsed))
        }
    }

    /// Local backoff: wait for a slot, but never longer than `max_wait`.
    /// False means the caller should skip this cycle.
    pub async fn acquire_within(&self, max_wait: Duration) -> bool {
        match self.try_acquire() {
            Ok(()) => true,
            Err(retry_after) => {
                if retry_after > max_wait {
                    debug!(
                        retry_after_ms = retry_after.as_millis() as u64,
                        "rate gate saturated, skipping cycle"
                    );
                    return false;
                }
                tokio::time::sleep(retry_after).await;
                self.try_acquire().is_ok()
            }
        }
    }
}
