//! Job state machine: transitions and guards (spec §4.4).

use crate::error::BatchError;
use crate::types::{JobState, JobSubstate, QsFlags};

/// The operation requested against a job, driving which guard runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOp {
    Queue,
    Hold,
    Release,
    Run,
    Rerun,
    Exit,
    EpilogueDone,
    Move,
    Expire,
    DeferToExecutionTime,
    ExecutionTimeReached,
    SuspendUser,
    ResumeUser,
}

/// Facts about a job a guard needs that aren't carried in `JobState` alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFacts {
    pub queue_enabled: bool,
    pub hold_count: u32,
    pub has_scheduler_assignment: bool,
    pub unfulfilled_dependencies: bool,
    pub rerunable: bool,
    pub checkpointable: bool,
    pub execution_time_future: bool,
}

/// Result of a successful guard: the new state/substate and any
/// side-effecting note the caller (request processor) must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: JobState,
    pub substate: JobSubstate,
}

/// Evaluate one job-state transition (spec §4.4's legal-transition table
/// and their guards). Returns the destination `(state, substate)` or the
/// `BatchError` that blocks it.
pub fn guard(
    current: JobState,
    current_sub: JobSubstate,
    op: JobOp,
    facts: JobFacts,
) -> Result<Transition, BatchError> {
    use JobState::*;
    match op {
        JobOp::Queue => match current {
            Transit => Ok(Transition { state: Queued, substate: JobSubstate::Queued }),
            _ => Err(stale(current, op)),
        },
        JobOp::Hold => match current {
            Queued | Held | Waiting => Ok(Transition { state: Held, substate: JobSubstate::Held }),
            Running => {
                // A hold arriving while Running triggers a checkpoint attempt;
                // the state doesn't change until the daemon replies (spec §4.4).
                Ok(Transition { state: Running, substate: current_sub })
            }
            _ => Err(stale(current, op)),
        },
        JobOp::Release => match current {
            Held if facts.hold_count == 0 => Ok(Transition { state: Queued, substate: JobSubstate::Queued }),
            Held => Err(BatchError::StaleState("job still has outstanding holds".into())),
            _ => Err(stale(current, op)),
        },
        JobOp::Run => match current {
            Queued | Held if current == Queued || facts.hold_count == 0 => {
                if !facts.queue_enabled {
                    return Err(BatchError::BadValue {
                        attr: "queue".into(),
                        detail: "queue is not enabled".into(),
                    });
                }
                if !facts.has_scheduler_assignment {
                    return Err(BatchError::BadValue {
                        attr: "exec_vnode".into(),
                        detail: "no scheduler placement assignment".into(),
                    });
                }
                if facts.unfulfilled_dependencies {
                    return Err(BatchError::BadValue {
                        attr: "depend".into(),
                        detail: "unfulfilled job dependency".into(),
                    });
                }
                Ok(Transition { state: Running, substate: JobSubstate::Starting })
            }
            _ => Err(stale(current, op)),
        },
        JobOp::Rerun => match current {
            Running | Exiting => {
                if !facts.rerunable {
                    return Err(BatchError::BadValue {
                        attr: "rerunable".into(),
                        detail: "job is not rerunable; falling through to abort".into(),
                    });
                }
                Ok(Transition { state: Queued, substate: JobSubstate::RerunQueued })
            }
            _ => Err(stale(current, op)),
        },
        JobOp::Exit => match current {
            Running => Ok(Transition { state: Exiting, substate: JobSubstate::Exiting }),
            _ => Err(stale(current, op)),
        },
        JobOp::EpilogueDone => match current {
            Exiting => Ok(Transition { state: Finished, substate: JobSubstate::Finished }),
            _ => Err(stale(current, op)),
        },
        JobOp::Move => Ok(Transition { state: Moved, substate: JobSubstate::Moved }),
        JobOp::Expire => Ok(Transition { state: Expired, substate: JobSubstate::Finished }),
        JobOp::DeferToExecutionTime => match current {
            Queued if facts.execution_time_future => {
                Ok(Transition { state: Waiting, substate: JobSubstate::WaitingTime })
            }
            _ => Err(stale(current, op)),
        },
        JobOp::ExecutionTimeReached => match current {
            Waiting => Ok(Transition { state: Queued, substate: JobSubstate::Queued }),
            _ => Err(stale(current, op)),
        },
        JobOp::SuspendUser => match current {
            Running => Ok(Transition { state: UserSuspended, substate: JobSubstate::UserSuspended }),
            _ => Err(stale(current, op)),
        },
        JobOp::ResumeUser => match current {
            UserSuspended => Ok(Transition { state: Running, substate: JobSubstate::Running }),
            _ => Err(stale(current, op)),
        },
    }
}

fn stale(current: JobState, op: JobOp) -> BatchError {
    BatchError::StaleState(format!("cannot apply {op:?} to job in state {current}"))
}

/// Result of a checkpoint attempt on a Running job being held (spec §4.4):
/// on success, the job's flags gain `ChkptMig` and it remains Running; on
/// failure with a non-busy code, it is rerun if allowed, else aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    MigratableSuccess,
    Busy,
    Failed,
}

pub fn apply_checkpoint_outcome(
    outcome: CheckpointOutcome,
    facts: JobFacts,
) -> Result<(Transition, QsFlags), BatchError> {
    match outcome {
        CheckpointOutcome::MigratableSuccess => Ok((
            Transition { state: JobState::Running, substate: JobSubstate::Running },
            QsFlags::CHKPTMIG,
        )),
        CheckpointOutcome::Busy => Err(BatchError::CheckpointBusy),
        CheckpointOutcome::Failed => {
            let t = guard(JobState::Running, JobSubstate::Running, JobOp::Rerun, facts)
                .unwrap_or(Transition { state: JobState::Exiting, substate: JobSubstate::Aborted });
            Ok((t, QsFlags::empty()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_to_running_requires_assignment() {
        let facts = JobFacts { queue_enabled: true, ..Default::default() };
        let err = guard(JobState::Queued, JobSubstate::Queued, JobOp::Run, facts).unwrap_err();
        assert!(matches!(err, BatchError::BadValue { .. }));
    }

    #[test]
    fn queued_to_running_succeeds_with_assignment() {
        let facts = JobFacts {
            queue_enabled: true,
            has_scheduler_assignment: true,
            ..Default::default()
        };
        let t = guard(JobState::Queued, JobSubstate::Queued, JobOp::Run, facts).unwrap();
        assert_eq!(t.state, JobState::Running);
    }

    #[test]
    fn non_rerunable_job_falls_through_to_abort_on_checkpoint_failure() {
        let facts = JobFacts { rerunable: false, ..Default::default() };
        let (t, _) = apply_checkpoint_outcome(CheckpointOutcome::Failed, facts).unwrap();
        assert_eq!(t.state, JobState::Exiting);
        assert_eq!(t.substate, JobSubstate::Aborted);
    }

    #[test]
    fn rerunable_job_reruns_on_checkpoint_failure() {
        let facts = JobFacts { rerunable: true, ..Default::default() };
        let (t, _) = apply_checkpoint_outcome(CheckpointOutcome::Failed, facts).unwrap();
        assert_eq!(t.state, JobState::Queued);
    }

    #[test]
    fn checkpoint_migratable_success_sets_chkptmig() {
        let (t, flags) = apply_checkpoint_outcome(CheckpointOutcome::MigratableSuccess, JobFacts::default()).unwrap();
        assert_eq!(t.state, JobState::Running);
        assert!(flags.contains(QsFlags::CHKPTMIG));
    }
}
