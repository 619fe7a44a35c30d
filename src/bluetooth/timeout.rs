//! Cancellable one-shot timers owned by a single peripheral
//!
//! A fired timer does not run a closure. It posts its [`TimerId`] to the
//! owner's channel, and the owner asks [`TimeoutScheduler::take_fired`] whether
//! the fire still counts. Because the owner processes its inbox serially, a
//! timer cancelled before its notification is processed is never acted upon,
//! even if the notification was already queued.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Handle of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Arms timers on the tokio clock and reports fires to one owner
pub struct TimeoutScheduler {
    next_id: u64,
    armed: HashMap<TimerId, JoinHandle<()>>,
    fired: UnboundedSender<TimerId>,
}

impl TimeoutScheduler {
    /// Create a scheduler that reports fires on `fired`
    pub fn new(fired: UnboundedSender<TimerId>) -> Self {
        Self {
            next_id: 0,
            armed: HashMap::new(),
            fired,
        }
    }

    /// Schedule a single fire after `duration`
    pub fn arm(&mut self, duration: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = fired.send(id);
        });
        debug!("Armed {} for {:?}", id, duration);
        self.armed.insert(id, task);
        id
    }

    /// Cancel a timer. No-op if it already fired or was already cancelled.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(task) = self.armed.remove(&id) {
            task.abort();
            debug!("Cancelled {}", id);
        }
    }

    /// Consume a fire notification
    ///
    /// Returns `true` the first time it is called for a timer that was not
    /// cancelled, `false` otherwise.
    pub fn take_fired(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        if self.pending() > 0 {
            debug!("Aborting {} pending timers", self.pending());
        }
        for (_, task) in self.armed.drain() {
            task.abort();
        }
    }
}
