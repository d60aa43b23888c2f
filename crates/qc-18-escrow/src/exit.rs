//! # Exit Rules
//!
//! Decides when a seat leaves escrow.
//!
//! | Rule | Holder `exit()` | Contract exit | Timer |
//! |------|-----------------|---------------|-------|
//! | `onDemand` | allowed | allowed | - |
//! | `waived` | `ExitNotAllowed` | allowed | - |
//! | `afterDeadline` | `ExitNotAllowed` | allowed | forced exit at deadline |
//!
//! Deadline wakeups are not acted on inside the timer callback. The waker
//! only queues a `Wakeup`; the instance applies it on its own turn.

use crate::domain::{
    invariant_holder_may_exit, EscrowError, ExitCause, ExitRule, Seat, SeatId, TimerRef, Timestamp,
};
use crate::ports::outbound::{TimerService, TimerWaker};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Deadline notification queued for the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wakeup {
    /// Seat whose deadline passed
    pub seat: SeatId,
    /// Timestamp the timer delivered
    pub at: Timestamp,
}

struct DeadlineWaker {
    seat: SeatId,
    queue: mpsc::UnboundedSender<Wakeup>,
}

impl TimerWaker for DeadlineWaker {
    fn wake(&self, timestamp: Timestamp) {
        let wakeup = Wakeup {
            seat: self.seat,
            at: timestamp,
        };
        if self.queue.send(wakeup).is_err() {
            debug!(seat = %self.seat, "[qc-18] Wakeup for a closed instance dropped");
        }
    }
}

struct ArmedDeadline {
    timer: Arc<dyn TimerService>,
    waker: Arc<dyn TimerWaker>,
    deadline: Timestamp,
}

/// Per-instance exit rule state machine.
pub struct ExitRuleStateMachine {
    timers: HashMap<TimerRef, Arc<dyn TimerService>>,
    armed: HashMap<SeatId, ArmedDeadline>,
    queue: mpsc::UnboundedSender<Wakeup>,
}

impl ExitRuleStateMachine {
    /// Create a state machine and the queue its wakeups arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Wakeup>) {
        let (queue, receiver) = mpsc::unbounded_channel();
        let machine = Self {
            timers: HashMap::new(),
            armed: HashMap::new(),
            queue,
        };
        (machine, receiver)
    }

    /// Make a timer available to `afterDeadline` proposals.
    pub fn register_timer(&mut self, name: TimerRef, timer: Arc<dyn TimerService>) {
        self.timers.insert(name, timer);
    }

    /// Reject exit rules naming a timer this instance does not know.
    pub fn validate(&self, rule: &ExitRule) -> Result<(), EscrowError> {
        if let ExitRule::AfterDeadline { timer, .. } = rule {
            if !self.timers.contains_key(timer) {
                return Err(EscrowError::UnknownTimer(timer.to_string()));
            }
        }
        Ok(())
    }

    /// Register the deadline wakeup of a new seat.
    ///
    /// A deadline already in the past is queued immediately.
    pub fn arm(&mut self, seat: SeatId, rule: &ExitRule) -> Result<(), EscrowError> {
        let ExitRule::AfterDeadline { timer, deadline } = rule else {
            return Ok(());
        };
        let service = self
            .timers
            .get(timer)
            .cloned()
            .ok_or_else(|| EscrowError::UnknownTimer(timer.to_string()))?;

        let waker: Arc<dyn TimerWaker> = Arc::new(DeadlineWaker {
            seat,
            queue: self.queue.clone(),
        });
        self.armed.insert(
            seat,
            ArmedDeadline {
                timer: service.clone(),
                waker: waker.clone(),
                deadline: *deadline,
            },
        );
        service.set_wakeup(*deadline, waker);

        debug!(seat = %seat, timer = %timer, deadline, "[qc-18] Deadline armed");
        Ok(())
    }

    /// Cancel a seat's pending deadline. Returns the timestamps removed.
    pub fn disarm(&mut self, seat: SeatId) -> Vec<Timestamp> {
        match self.armed.remove(&seat) {
            Some(armed) => {
                let removed = armed.timer.remove_wakeup(&armed.waker);
                debug!(seat = %seat, removed = removed.len(), "[qc-18] Deadline disarmed");
                removed
            }
            None => Vec::new(),
        }
    }

    /// Check if a seat has a pending deadline.
    pub fn is_armed(&self, seat: SeatId) -> bool {
        self.armed.contains_key(&seat)
    }

    /// Check a holder's `exit()` request against the seat's rule.
    pub fn check_holder_exit(&self, seat: &Seat) -> Result<(), EscrowError> {
        invariant_holder_may_exit(seat)
    }

    /// Decide whether a delivered wakeup forces the seat out.
    ///
    /// Duplicate, stale and early wakeups yield `None`.
    pub fn on_wakeup(&mut self, wakeup: Wakeup, seat: &Seat) -> Option<ExitCause> {
        if !seat.is_active() {
            debug!(seat = %wakeup.seat, "[qc-18] Wakeup for exited seat ignored");
            return None;
        }
        let deadline = self.armed.get(&wakeup.seat)?.deadline;
        if wakeup.at < deadline {
            warn!(
                seat = %wakeup.seat,
                at = wakeup.at,
                deadline,
                "[qc-18] Early wakeup ignored"
            );
            return None;
        }
        self.armed.remove(&wakeup.seat);
        info!(seat = %wakeup.seat, at = wakeup.at, "[qc-18] Deadline reached, forcing exit");
        Some(ExitCause::Deadline { at: wakeup.at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ManualTimer;
    use crate::domain::{Allocation, Proposal};

    fn deadline_rule(deadline: Timestamp) -> ExitRule {
        ExitRule::AfterDeadline {
            timer: TimerRef::new("chain"),
            deadline,
        }
    }

    fn create_test_seat(id: u64, exit: ExitRule) -> Seat {
        let proposal = Proposal {
            exit,
            ..Default::default()
        };
        Seat::new(SeatId(id), proposal, Allocation::new())
    }

    fn create_machine() -> (
        ExitRuleStateMachine,
        mpsc::UnboundedReceiver<Wakeup>,
        Arc<ManualTimer>,
    ) {
        let timer = Arc::new(ManualTimer::default());
        let (mut machine, rx) = ExitRuleStateMachine::new();
        machine.register_timer(TimerRef::new("chain"), timer.clone());
        (machine, rx, timer)
    }

    #[test]
    fn test_unknown_timer_rejected() {
        let (machine, _rx, _) = create_machine();
        let rule = ExitRule::AfterDeadline {
            timer: TimerRef::new("other"),
            deadline: 5,
        };
        assert_eq!(
            machine.validate(&rule),
            Err(EscrowError::UnknownTimer("other".into()))
        );
        assert!(machine.validate(&ExitRule::Waived).is_ok());
    }

    #[test]
    fn test_deadline_wakeup_forces_exit() {
        let (mut machine, mut rx, timer) = create_machine();
        let seat = create_test_seat(1, deadline_rule(3));
        machine.arm(seat.id, &seat.proposal.exit).unwrap();

        timer.advance_to(2);
        assert!(rx.try_recv().is_err());

        timer.tick();
        let wakeup = rx.try_recv().unwrap();
        assert_eq!(wakeup, Wakeup { seat: seat.id, at: 3 });
        assert_eq!(
            machine.on_wakeup(wakeup, &seat),
            Some(ExitCause::Deadline { at: 3 })
        );
        assert!(!machine.is_armed(seat.id));

        // At-least-once delivery: a repeat is ignored.
        assert_eq!(machine.on_wakeup(wakeup, &seat), None);
    }

    #[test]
    fn test_past_deadline_queued_immediately() {
        let (mut machine, mut rx, timer) = create_machine();
        timer.advance_to(10);
        let seat = create_test_seat(1, deadline_rule(4));
        machine.arm(seat.id, &seat.proposal.exit).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Wakeup { seat: seat.id, at: 10 });
    }

    #[test]
    fn test_disarm_cancels() {
        let (mut machine, mut rx, timer) = create_machine();
        let seat = create_test_seat(1, deadline_rule(5));
        machine.arm(seat.id, &seat.proposal.exit).unwrap();

        assert_eq!(machine.disarm(seat.id), vec![5]);
        timer.advance_to(6);
        assert!(rx.try_recv().is_err());
        assert!(machine.disarm(seat.id).is_empty());
    }

    #[test]
    fn test_early_wakeup_ignored() {
        let (mut machine, _rx, _) = create_machine();
        let seat = create_test_seat(1, deadline_rule(5));
        machine.arm(seat.id, &seat.proposal.exit).unwrap();
        assert_eq!(machine.on_wakeup(Wakeup { seat: seat.id, at: 4 }, &seat), None);
        assert!(machine.is_armed(seat.id));
    }

    #[test]
    fn test_holder_exit_rules() {
        let (machine, _rx, _) = create_machine();
        assert!(machine
            .check_holder_exit(&create_test_seat(1, ExitRule::OnDemand))
            .is_ok());
        assert!(matches!(
            machine.check_holder_exit(&create_test_seat(2, ExitRule::Waived)),
            Err(EscrowError::ExitNotAllowed { .. })
        ));
        assert!(matches!(
            machine.check_holder_exit(&create_test_seat(3, deadline_rule(9))),
            Err(EscrowError::ExitNotAllowed { .. })
        ));
    }

    #[test]
    fn test_on_demand_not_armed() {
        let (mut machine, _rx, _) = create_machine();
        machine.arm(SeatId(1), &ExitRule::OnDemand).unwrap();
        assert!(!machine.is_armed(SeatId(1)));
    }
}
