//! Pure task lifecycle state machine.
//!
//! Deliberately factored out as a standalone type rather than transition methods
//! on the `Task` aggregate: it takes only `(status, retries, max_retries)`, never
//! touches the store, and returns the next `(status, retries)` plus a small
//! [`Effects`] descriptor naming which timestamp/worker-id fields the caller
//! should clear or set. The service layer persists the result; this module never
//! sees a clock, a queue, or a worker id.

use crate::domain::TaskStatus;

/// Which auxiliary task fields a transition touches, beyond `status`/`retries`/
/// `last_modified` (which every transition bumps).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    /// `start_time` and `last_heartbeat` are set to now; `worker_id` is stamped
    /// to the caller-supplied value (the FSM itself is agnostic to who).
    pub set_started: bool,
    /// `worker_id` is cleared.
    pub clear_worker_id: bool,
    /// `start_time` and `last_heartbeat` are cleared.
    pub clear_started: bool,
    /// `retries` is forced to zero (overrides any increment from this event).
    pub reset_retries: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition: {event} is not valid from {from:?}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub event: &'static str,
}

/// A task's FSM state: current status plus the retry counters needed to decide
/// whether a `fail` event re-enters `Pending` or terminates at `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFsm {
    pub status: TaskStatus,
    pub retries: i64,
    pub max_retries: i64,
}

/// The next FSM state plus the effects the caller must apply when persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transitioned {
    pub fsm: TaskFsm,
    pub effects: Effects,
}

impl TaskFsm {
    pub fn new(status: TaskStatus, retries: i64, max_retries: i64) -> Self {
        Self {
            status,
            retries,
            max_retries,
        }
    }

    fn reject(&self, event: &'static str) -> InvalidTransition {
        InvalidTransition {
            from: self.status,
            event,
        }
    }

    /// `Pending -> Running`. Sets `start_time`, `last_heartbeat`, `worker_id`.
    pub fn fetch(&self) -> Result<Transitioned, InvalidTransition> {
        if self.status != TaskStatus::Pending {
            return Err(self.reject("fetch"));
        }
        Ok(Transitioned {
            fsm: TaskFsm { status: TaskStatus::Running, ..*self },
            effects: Effects { set_started: true, ..Default::default() },
        })
    }

    /// `Running -> Success`. Clears `worker_id`: the invariant `worker_id.is_some()
    /// => status == Running` must hold after every transition, not just `fail`.
    pub fn complete(&self) -> Result<Transitioned, InvalidTransition> {
        if self.status != TaskStatus::Running {
            return Err(self.reject("complete"));
        }
        Ok(Transitioned {
            fsm: TaskFsm { status: TaskStatus::Success, ..*self },
            effects: Effects { clear_worker_id: true, ..Default::default() },
        })
    }

    /// `Running -> Pending` (if retries remain) or `Running -> Failed` (terminal).
    /// Always increments `retries`. Used by both `ReportTaskStatus(failed)` and
    /// the timeout sweeper.
    pub fn fail(&self) -> Result<Transitioned, InvalidTransition> {
        if self.status != TaskStatus::Running {
            return Err(self.reject("fail"));
        }
        let retries = self.retries + 1;
        if retries < self.max_retries {
            Ok(Transitioned {
                fsm: TaskFsm { status: TaskStatus::Pending, retries, max_retries: self.max_retries },
                effects: Effects { clear_worker_id: true, ..Default::default() },
            })
        } else {
            Ok(Transitioned {
                fsm: TaskFsm { status: TaskStatus::Failed, retries, max_retries: self.max_retries },
                effects: Effects { clear_worker_id: true, ..Default::default() },
            })
        }
    }

    /// `Pending|Running -> Cancelled`, rejecting from a terminal state. This is
    /// the FSM-checked cancel used by `ReportTaskStatus(cancelled)`; the
    /// administrative `CancelTask` operation bypasses the FSM entirely and sets
    /// `Cancelled` unconditionally (see `TaskService::cancel_task`).
    pub fn cancel(&self) -> Result<Transitioned, InvalidTransition> {
        if self.status.is_terminal() {
            return Err(self.reject("cancel"));
        }
        Ok(Transitioned {
            fsm: TaskFsm { status: TaskStatus::Cancelled, ..*self },
            effects: Effects { clear_worker_id: true, ..Default::default() },
        })
    }

    /// Administrative: `* -> Pending`, `retries := 0`, always succeeds. Clears
    /// `worker_id`, `start_time`, `last_heartbeat`.
    pub fn reset(&self) -> Transitioned {
        Transitioned {
            fsm: TaskFsm { status: TaskStatus::Pending, retries: 0, max_retries: self.max_retries },
            effects: Effects {
                clear_worker_id: true,
                clear_started: true,
                reset_retries: true,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm(status: TaskStatus, retries: i64, max_retries: i64) -> TaskFsm {
        TaskFsm::new(status, retries, max_retries)
    }

    #[test]
    fn fetch_from_pending_sets_started() {
        let t = fsm(TaskStatus::Pending, 0, 3).fetch().unwrap();
        assert_eq!(t.fsm.status, TaskStatus::Running);
        assert!(t.effects.set_started);
    }

    #[test]
    fn fetch_from_running_is_rejected() {
        assert!(fsm(TaskStatus::Running, 0, 3).fetch().is_err());
    }

    #[test]
    fn complete_requires_running() {
        assert!(fsm(TaskStatus::Pending, 0, 3).complete().is_err());
        let t = fsm(TaskStatus::Running, 0, 3).complete().unwrap();
        assert_eq!(t.fsm.status, TaskStatus::Success);
        assert!(t.effects.clear_worker_id);
    }

    #[test]
    fn fail_retries_until_max_then_terminates() {
        // max_retries=3: fail -> Pending(1), fail -> Pending(2), fail -> Failed(3)
        let t1 = fsm(TaskStatus::Running, 0, 3).fail().unwrap();
        assert_eq!(t1.fsm.status, TaskStatus::Pending);
        assert_eq!(t1.fsm.retries, 1);
        assert!(t1.effects.clear_worker_id);

        let t2 = fsm(TaskStatus::Running, 1, 3).fail().unwrap();
        assert_eq!(t2.fsm.status, TaskStatus::Pending);
        assert_eq!(t2.fsm.retries, 2);

        let t3 = fsm(TaskStatus::Running, 2, 3).fail().unwrap();
        assert_eq!(t3.fsm.status, TaskStatus::Failed);
        assert_eq!(t3.fsm.retries, 3);
        // worker_id invariant: non-null worker_id implies Running, so a terminal
        // Failed transition must clear it too, not just the retry-to-Pending case.
        assert!(t3.effects.clear_worker_id);
    }

    #[test]
    fn fail_with_zero_max_retries_terminates_immediately() {
        let t = fsm(TaskStatus::Running, 0, 0).fail().unwrap();
        assert_eq!(t.fsm.status, TaskStatus::Failed);
        assert_eq!(t.fsm.retries, 1);
    }

    #[test]
    fn cancel_rejected_from_terminal_states() {
        for status in [TaskStatus::Success, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(fsm(status, 0, 3).cancel().is_err());
        }
    }

    #[test]
    fn cancel_allowed_from_pending_or_running() {
        assert!(fsm(TaskStatus::Pending, 0, 3).cancel().is_ok());
        let t = fsm(TaskStatus::Running, 0, 3).cancel().unwrap();
        assert!(t.effects.clear_worker_id);
    }

    #[test]
    fn reset_always_succeeds_and_clears_everything() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let t = fsm(status, 2, 3).reset();
            assert_eq!(t.fsm.status, TaskStatus::Pending);
            assert_eq!(t.fsm.retries, 0);
            assert!(t.effects.clear_worker_id);
            assert!(t.effects.clear_started);
            assert!(t.effects.reset_retries);
        }
    }

    #[test]
    fn terminal_events_fail_without_a_panic_for_every_terminal_state() {
        for status in [TaskStatus::Success, TaskStatus::Failed, TaskStatus::Cancelled] {
            let f = fsm(status, 0, 3);
            assert!(f.fetch().is_err());
            assert!(f.complete().is_err());
            assert!(f.fail().is_err());
            assert!(f.cancel().is_err());
        }
    }
}
