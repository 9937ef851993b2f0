// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cooperative cancellation shared by the long-running tasks. A task checks it at every
/// loop boundary: a stopped task finishes its current iteration and does not start another.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` in short slices, returning early once a stop is requested.
    /// Returns `true` if the task should keep running.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        while !self.is_stop_requested() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(STOP_POLL_SLICE)).await;
        }
        false
    }

    /// Blocking counterpart of [`StopSignal::sleep`] for tasks on dedicated threads.
    pub fn sleep_blocking(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        while !self.is_stop_requested() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
        false
    }
}

const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

#[cfg(test)]
mod tests {
    use super::StopSignal;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn sleep_returns_early_when_stopped() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.request_stop();
        });

        let started = Instant::now();
        let keep_running = stop.sleep(Duration::from_secs(10)).await;
        assert!(!keep_running);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn blocking_sleep_completes_when_not_stopped() {
        let stop = StopSignal::new();
        assert!(stop.sleep_blocking(Duration::from_millis(5)));
        stop.request_stop();
        assert!(!stop.sleep_blocking(Duration::from_secs(10)));
    }
}
