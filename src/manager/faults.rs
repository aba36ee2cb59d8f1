//! Pauses claiming when the engine keeps failing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
struct FaultState {
    recent: VecDeque<Instant>,
    paused_until: Option<Instant>,
}

/// Sliding-window count of internal faults.
///
/// `threshold` faults within `window` pause claiming for `pause`. A
/// threshold of zero disables pausing.
#[derive(Debug)]
pub struct FaultTracker {
    threshold: u32,
    window: Duration,
    pause: Duration,
    total: AtomicU64,
    state: Mutex<FaultState>,
}

impl FaultTracker {
    pub fn new(threshold: u32, window: Duration, pause: Duration) -> Self {
        Self {
            threshold,
            window,
            pause,
            total: AtomicU64::new(0),
            state: Mutex::new(FaultState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Records a fault. Returns true if it started a pause.
    pub fn record_fault(&self) -> bool {
        self.total.fetch_add(1, Ordering::SeqCst);
        if self.threshold == 0 {
            return false;
        }

        let now = Instant::now();
        let mut state = self.state();
        state.recent.push_back(now);
        while let Some(oldest) = state.recent.front() {
            if now.duration_since(*oldest) > self.window {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        if state.recent.len() >= self.threshold as usize {
            state.recent.clear();
            state.paused_until = Some(now + self.pause);
            return true;
        }
        false
    }

    /// Time left in the current pause, if any.
    pub fn pause_remaining(&self) -> Option<Duration> {
        let mut state = self.state();
        let until = state.paused_until?;
        let now = Instant::now();
        if now >= until {
            state.paused_until = None;
            return None;
        }
        Some(until - now)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}
