//! Reservation state machine, including standing-reservation recycling
//! (spec §4.4).

use crate::error::BatchError;
use crate::types::ReservationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOp {
    Confirm,
    DenyConfirmation,
    EnterWaiting,
    TimeToRun,
    Start,
    Finish,
    Delete,
    Degrade,
    RecoverFromDegraded,
    /// A standing reservation's occurrence finished and another remains.
    RecycleToWaiting,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReservationFacts {
    pub is_standing: bool,
    pub occurrences_remaining: bool,
}

pub fn guard(
    current: ReservationState,
    op: ReservationOp,
    facts: ReservationFacts,
) -> Result<ReservationState, BatchError> {
    use ReservationState::*;
    match op {
        ReservationOp::Confirm => match current {
            Unconfirmed => Ok(Confirmed),
            _ => Err(stale(current, op)),
        },
        ReservationOp::DenyConfirmation => match current {
            Unconfirmed => Ok(BeingDeleted),
            _ => Err(stale(current, op)),
        },
        ReservationOp::EnterWaiting => match current {
            Confirmed => Ok(Waiting),
            _ => Err(stale(current, op)),
        },
        ReservationOp::TimeToRun => match current {
            Waiting => Ok(TimeToRun),
            _ => Err(stale(current, op)),
        },
        ReservationOp::Start => match current {
            TimeToRun => Ok(Running),
            _ => Err(stale(current, op)),
        },
        ReservationOp::Finish => match current {
            Running => Ok(Finished),
            _ => Err(stale(current, op)),
        },
        ReservationOp::Delete => Ok(BeingDeleted),
        ReservationOp::Degrade => match current {
            Confirmed | Running => Ok(Degraded),
            _ => Err(stale(current, op)),
        },
        ReservationOp::RecoverFromDegraded => match current {
            Degraded => Ok(Confirmed),
            _ => Err(stale(current, op)),
        },
        ReservationOp::RecycleToWaiting => match current {
            Finished if facts.is_standing && facts.occurrences_remaining => Ok(Waiting),
            Finished => Ok(Finished),
            _ => Err(stale(current, op)),
        },
    }
}

fn stale(current: ReservationState, op: ReservationOp) -> BatchError {
    BatchError::StaleState(format!("cannot apply {op:?} to reservation in state {current}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standing_reservation_recycles_to_waiting() {
        let facts = ReservationFacts { is_standing: true, occurrences_remaining: true };
        let s = guard(ReservationState::Finished, ReservationOp::RecycleToWaiting, facts).unwrap();
        assert_eq!(s, ReservationState::Waiting);
    }

    #[test]
    fn exhausted_standing_reservation_stays_finished() {
        let facts = ReservationFacts { is_standing: true, occurrences_remaining: false };
        let s = guard(ReservationState::Finished, ReservationOp::RecycleToWaiting, facts).unwrap();
        assert_eq!(s, ReservationState::Finished);
    }

    #[test]
    fn advance_reservation_lifecycle() {
        let f = ReservationFacts::default();
        let s = guard(ReservationState::Unconfirmed, ReservationOp::Confirm, f).unwrap();
        let s = guard(s, ReservationOp::EnterWaiting, f).unwrap();
        let s = guard(s, ReservationOp::TimeToRun, f).unwrap();
        let s = guard(s, ReservationOp::Start, f).unwrap();
        let s = guard(s, ReservationOp::Finish, f).unwrap();
        assert_eq!(s, ReservationState::Finished);
    }
}
