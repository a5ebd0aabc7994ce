//! The accounting/event log: the durable, append-only audit trail of every
//! job and reservation lifecycle transition (spec §8 scenario 1: "Accounting
//! records {Q, S, E} are emitted in that order").
//!
//! Grounded in the teacher's `RuntimeEvent` log — a closed, serializable
//! enum appended through the persistence bridge and replayable per entity —
//! generalized from BPMN-Lite's fiber/VM events to the batch core's
//! job/reservation/server events.

use serde::{Deserialize, Serialize};

use crate::types::{EntityKind, JobState, ReservationState};

/// One accounting record. The single-character `record_kind()` matches the
/// classic batch-accounting record types (Q queued, S started, E ended, D
/// deleted, R rerun, C checkpoint/hold).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum AccountingRecord {
    /// Job accepted into a queue.
    JobQueued { job_id: String, queue: String },
    /// Job transitioned to Running (`S` record).
    JobStarted { job_id: String, exec_vnode: String },
    /// Job finished, whether by normal exit or abort (`E` record).
    JobEnded { job_id: String, exit_status: i32 },
    /// Job deleted before completion (`D` record).
    JobDeleted { job_id: String, requestor: String },
    /// Job requeued for rerun (`R` record).
    JobRerun { job_id: String, reason: String },
    /// A checkpoint/hold round trip against the execution daemon completed.
    CheckpointOutcome { job_id: String, migratable: bool },
    /// A job or reservation's quick-save state changed (catch-all, used for
    /// states `AccountingRecord` doesn't dedicate a variant to).
    StateChanged {
        entity: EntityKind,
        identity: String,
        job_state: Option<JobState>,
        reservation_state: Option<ReservationState>,
    },
    /// A standing reservation produced its next occurrence.
    ReservationOccurrence { reservation_id: String, occurrence_index: usize },
    /// The server changed overall run state (shutdown/startup).
    ServerStateChanged { state: String },
}

impl AccountingRecord {
    /// The single-letter record type, as batch accounting logs traditionally
    /// key on (spec §8 scenario 1).
    pub fn record_kind(&self) -> char {
        match self {
            AccountingRecord::JobQueued { .. } => 'Q',
            AccountingRecord::JobStarted { .. } => 'S',
            AccountingRecord::JobEnded { .. } => 'E',
            AccountingRecord::JobDeleted { .. } => 'D',
            AccountingRecord::JobRerun { .. } => 'R',
            AccountingRecord::CheckpointOutcome { .. } => 'C',
            AccountingRecord::StateChanged { .. } => 'T',
            AccountingRecord::ReservationOccurrence { .. } => 'O',
            AccountingRecord::ServerStateChanged { .. } => 'Y',
        }
    }

    /// The identity of the entity this record concerns, used as the
    /// per-entity event log key.
    pub fn subject(&self) -> &str {
        match self {
            AccountingRecord::JobQueued { job_id, .. }
            | AccountingRecord::JobStarted { job_id, .. }
            | AccountingRecord::JobEnded { job_id, .. }
            | AccountingRecord::JobDeleted { job_id, .. }
            | AccountingRecord::JobRerun { job_id, .. }
            | AccountingRecord::CheckpointOutcome { job_id, .. } => job_id,
            AccountingRecord::StateChanged { identity, .. } => identity,
            AccountingRecord::ReservationOccurrence { reservation_id, .. } => reservation_id,
            AccountingRecord::ServerStateChanged { .. } => "server",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_run_exit_emits_q_s_e_in_order() {
        let records = vec![
            AccountingRecord::JobQueued { job_id: "1.server".into(), queue: "batch".into() },
            AccountingRecord::JobStarted { job_id: "1.server".into(), exec_vnode: "node1".into() },
            AccountingRecord::JobEnded { job_id: "1.server".into(), exit_status: 0 },
        ];
        let kinds: Vec<char> = records.iter().map(|r| r.record_kind()).collect();
        assert_eq!(kinds, vec!['Q', 'S', 'E']);
    }
}
