use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Failure streaks at or past this length are logged loudly.
const STREAK_WARN_THRESHOLD: u32 = 5;

/// Sliding-window admission control for reasoning-service calls.
///
/// `acquire` suspends (no busy wait) until fewer than `max_calls` calls have
/// occurred within the trailing window, then records the call. The queue is
/// bounded by `max_calls`; expired entries are evicted lazily on each check.
/// `record_success` / `record_failure` are advisory bookkeeping only - they
/// never block admission.
pub struct RateGovernor {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
    failure_streak: AtomicU32,
}

impl RateGovernor {
    pub fn new(max_calls: usize, window_secs: u64) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window: Duration::from_secs(window_secs.max(1)),
            calls: Mutex::new(VecDeque::new()),
            failure_streak: AtomicU32::new(0),
        }
    }

    /// Suspend until a call slot is free, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    calls.pop_front();
                }

                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }

                // Oldest entry ages out first; sleep exactly until then.
                let oldest = *calls.front().expect("non-empty at capacity");
                self.window.saturating_sub(now.duration_since(oldest))
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Advisory hook after a call completed successfully.
    pub fn record_success(&self) {
        let streak = self.failure_streak.swap(0, Ordering::Relaxed);
        if streak >= STREAK_WARN_THRESHOLD {
            tracing::info!(streak, "reasoning service recovered after failure streak");
        }
    }

    /// Advisory hook after a call failed.
    pub fn record_failure(&self, error: &dyn fmt::Display) {
        let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= STREAK_WARN_THRESHOLD {
            tracing::warn!(streak, "reasoning service failing repeatedly: {error}");
        } else {
            tracing::debug!(streak, "reasoning service call failed: {error}");
        }
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak.load(Ordering::Relaxed)
    }
}
