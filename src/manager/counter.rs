//! Capacity counter shared by the scheduling loop and its pipelines.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Number of running pipelines, observable by waiters.
#[derive(Debug)]
pub struct TaskCounter {
    value: watch::Sender<usize>,
    idle_since: Mutex<Option<Instant>>,
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCounter {
    pub fn new() -> Self {
        Self {
            value: watch::channel(0).0,
            idle_since: Mutex::new(Some(Instant::now())),
        }
    }

    /// Takes one unit of capacity until the returned slot is dropped.
    pub fn acquire(self: &Arc<Self>) -> CapacitySlot {
        self.value.send_modify(|value| *value += 1);
        *self.idle_since.lock().unwrap_or_else(|p| p.into_inner()) = None;
        CapacitySlot {
            counter: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut now_idle = false;
        self.value.send_modify(|value| {
            *value = value.saturating_sub(1);
            now_idle = *value == 0;
        });
        if now_idle {
            *self.idle_since.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        }
    }

    pub fn value(&self) -> usize {
        *self.value.borrow()
    }

    /// Resolves once fewer than `limit` slots are taken.
    pub async fn wait_for_less_than(&self, limit: usize) {
        let mut rx = self.value.subscribe();
        let _ = rx.wait_for(|value| *value < limit).await;
    }

    /// Resolves once no slot is taken.
    pub async fn wait_for_idle(&self) {
        self.wait_for_less_than(1).await;
    }

    /// How long the counter has been at zero, if it is.
    pub fn idle_time(&self) -> Option<Duration> {
        self.idle_since
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map(|since| since.elapsed())
    }
}

/// One unit of capacity. Released on drop.
#[derive(Debug)]
pub struct CapacitySlot {
    counter: Arc<TaskCounter>,
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.counter.release();
    }
}
