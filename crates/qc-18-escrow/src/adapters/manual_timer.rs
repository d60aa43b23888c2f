//! Manual Timer Adapter
//!
//! Implements `TimerService` with a clock that only moves when told to.
//! Used by tests and by deployments that drive time from block height.

use crate::domain::Timestamp;
use crate::ports::outbound::{TimerService, TimerWaker};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

struct TimerState {
    ticks: Timestamp,
    schedule: BTreeMap<Timestamp, Vec<Arc<dyn TimerWaker>>>,
}

/// Manually advanced timer.
pub struct ManualTimer {
    state: Mutex<TimerState>,
    time_step: Timestamp,
}

impl ManualTimer {
    /// Create a timer starting at `start` that advances by `time_step` per tick.
    pub fn new(start: Timestamp, time_step: Timestamp) -> Self {
        Self {
            state: Mutex::new(TimerState {
                ticks: start,
                schedule: BTreeMap::new(),
            }),
            time_step: time_step.max(1),
        }
    }

    /// Advance one step and deliver every wakeup now due.
    pub fn tick(&self) -> Timestamp {
        let (now, due) = {
            let mut state = self.state.lock();
            state.ticks += self.time_step;
            let now = state.ticks;
            let later = state.schedule.split_off(&(now + 1));
            let due = std::mem::replace(&mut state.schedule, later);
            (now, due)
        };

        debug!(ticks = now, "[qc-18] Manual timer tick");

        // Wakers run outside the lock; they may schedule again.
        for (_, wakers) in due {
            for waker in wakers {
                waker.wake(now);
            }
        }
        now
    }

    /// Tick until the clock reaches `target`.
    pub fn advance_to(&self, target: Timestamp) {
        while self.current_timestamp() < target {
            self.tick();
        }
    }

    /// Number of wakeups still pending.
    pub fn pending_wakeups(&self) -> usize {
        self.state.lock().schedule.values().map(Vec::len).sum()
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl TimerService for ManualTimer {
    fn current_timestamp(&self) -> Timestamp {
        self.state.lock().ticks
    }

    fn set_wakeup(&self, deadline: Timestamp, waker: Arc<dyn TimerWaker>) -> Timestamp {
        let now = {
            let mut state = self.state.lock();
            if deadline > state.ticks {
                debug!(deadline, now = state.ticks, "[qc-18] Scheduled wakeup");
                state.schedule.entry(deadline).or_default().push(waker);
                return deadline;
            }
            state.ticks
        };

        debug!(deadline, now, "[qc-18] Wakeup already past its deadline");
        waker.wake(now);
        deadline
    }

    fn remove_wakeup(&self, waker: &Arc<dyn TimerWaker>) -> Vec<Timestamp> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        state.schedule.retain(|at, wakers| {
            let before = wakers.len();
            wakers.retain(|w| !Arc::ptr_eq(w, waker));
            if wakers.len() != before {
                removed.push(*at);
            }
            !wakers.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingWaker {
        calls: PlMutex<Vec<Timestamp>>,
    }

    impl TimerWaker for RecordingWaker {
        fn wake(&self, timestamp: Timestamp) {
            self.calls.lock().push(timestamp);
        }
    }

    #[test]
    fn test_wakeup_fires_at_deadline() {
        let timer = ManualTimer::default();
        let waker = Arc::new(RecordingWaker::default());
        timer.set_wakeup(3, waker.clone());

        timer.tick();
        timer.tick();
        assert!(waker.calls.lock().is_empty());

        timer.tick();
        assert_eq!(*waker.calls.lock(), vec![3]);
        assert_eq!(timer.pending_wakeups(), 0);
    }

    #[test]
    fn test_past_deadline_fires_immediately() {
        let timer = ManualTimer::new(10, 1);
        let waker = Arc::new(RecordingWaker::default());
        assert_eq!(timer.set_wakeup(5, waker.clone()), 5);
        assert_eq!(*waker.calls.lock(), vec![10]);
    }

    #[test]
    fn test_remove_wakeup() {
        let timer = ManualTimer::default();
        let waker = Arc::new(RecordingWaker::default());
        let as_dyn: Arc<dyn TimerWaker> = waker.clone();
        timer.set_wakeup(2, as_dyn.clone());
        timer.set_wakeup(4, as_dyn.clone());

        assert_eq!(timer.remove_wakeup(&as_dyn), vec![2, 4]);
        timer.advance_to(5);
        assert!(waker.calls.lock().is_empty());
    }

    #[test]
    fn test_time_step() {
        let timer = ManualTimer::new(0, 5);
        assert_eq!(timer.tick(), 5);
        timer.advance_to(12);
        assert_eq!(timer.current_timestamp(), 15);
    }
}
