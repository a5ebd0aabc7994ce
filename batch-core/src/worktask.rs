//! Work-Task Dispatcher (spec §4.3), grounded in `work_task.c`.
//!
//! The original keeps four intrusive lists with per-struct link fields;
//! per spec §9 this becomes indexed arena storage: a `TaskId` handle, a
//! `BTreeMap` keyed by `(event_time, TaskId)` for the Timed list (so ties
//! in event time fall back to insertion-order `TaskId`), and plain
//! `VecDeque`s for the other three.

use std::collections::{BTreeMap, VecDeque};

use crate::types::now_s;

/// Matches `work_task.c`'s `enum work_type` plus the deferred-completion
/// variant used by reply bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Immediate,
    Interleave,
    Timed,
    DeferredEvent,
    DeferredComplete,
}

/// A tagged, opaque first parameter a task was registered with — used by
/// `find`/`delete_task_by_parm1_func` for pointer-identity-style lookups
/// without unsafe raw pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parm1 {
    Job(String),
    Reservation(String),
    Queue(String),
    Request(uuid::Uuid),
    None,
}

/// The closed set of actions a dispatched task performs. A sealed enum
/// stands in for the original's function pointer (spec §9): the engine
/// matches on this when draining a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Wake up and re-evaluate a standing reservation's next occurrence.
    ReservationOccurrence { reservation: String },
    /// A hold-to-daemon round trip is outstanding; fires on daemon reply.
    CheckpointReply { job: String },
    /// A run request is waiting on the scheduler's placement decision.
    RunReply { job: String },
    /// Execution-time (`execution_time`) reached: move a job Waiting -> Queued.
    JobExecutionTime { job: String },
    /// A deferred request's final reply is ready to send.
    RequestCompletion { request: uuid::Uuid },
    /// Generic chained action used by tests and smaller internal hops.
    Generic { label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone)]
pub struct WorkTask {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Event time for `Timed` tasks (epoch seconds); ignored otherwise.
    pub event_time: i64,
    pub parm1: Parm1,
    pub action: TaskAction,
}

/// The dispatcher's four lists plus a monotonic id counter, mirroring
/// `task_list_immed`/`_interleave`/`_timed`/`_event` and `svr_delay_entry`.
#[derive(Default)]
pub struct Dispatcher {
    next_id: u64,
    immediate: VecDeque<WorkTask>,
    interleave: VecDeque<WorkTask>,
    /// Sorted by `(event_time, TaskId)` — ties preserve insertion order
    /// because `TaskId` is monotonically increasing.
    timed: BTreeMap<(i64, TaskId), WorkTask>,
    event: VecDeque<WorkTask>,
    /// Set when code expects a reply; `default_next_task` sweeps
    /// `DeferredComplete` tasks off the event list exactly once per cycle.
    pub delay_entry: bool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// `set_task`: insert at the tail of its list (sorted position for
    /// `Timed`). Returns the handle.
    pub fn set_task(&mut self, kind: TaskKind, event_time: i64, parm1: Parm1, action: TaskAction) -> TaskId {
        let id = self.alloc_id();
        let task = WorkTask {
            id,
            kind,
            event_time,
            parm1,
            action,
        };
        match kind {
            TaskKind::Immediate => self.immediate.push_back(task),
            TaskKind::Interleave => self.interleave.push_back(task),
            TaskKind::Timed => {
                self.timed.insert((event_time, id), task);
            }
            TaskKind::DeferredEvent | TaskKind::DeferredComplete => self.event.push_back(task),
        }
        id
    }

    fn list_mut(&mut self, kind: TaskKind) -> Option<&mut VecDeque<WorkTask>> {
        match kind {
            TaskKind::Immediate => Some(&mut self.immediate),
            TaskKind::Interleave => Some(&mut self.interleave),
            TaskKind::DeferredEvent | TaskKind::DeferredComplete => Some(&mut self.event),
            TaskKind::Timed => None,
        }
    }

    /// `delete_task`: unlink and free, wherever it lives.
    pub fn delete_task(&mut self, id: TaskId) -> bool {
        for kind in [TaskKind::Immediate, TaskKind::Interleave, TaskKind::DeferredEvent] {
            if let Some(list) = self.list_mut(kind) {
                if let Some(pos) = list.iter().position(|t| t.id == id) {
                    list.remove(pos);
                    return true;
                }
            }
        }
        let key = self.timed.iter().find(|(_, t)| t.id == id).map(|(k, _)| *k);
        if let Some(k) = key {
            self.timed.remove(&k);
            return true;
        }
        false
    }

    /// `convert_work_task`: move a pending task to a different list.
    pub fn convert_work_task(&mut self, id: TaskId, new_kind: TaskKind) -> bool {
        let task = self.take_task(id);
        match task {
            Some(mut t) => {
                t.kind = new_kind;
                match new_kind {
                    TaskKind::Immediate => self.immediate.push_back(t),
                    TaskKind::Interleave => self.interleave.push_back(t),
                    TaskKind::Timed => {
                        self.timed.insert((t.event_time, t.id), t);
                    }
                    TaskKind::DeferredEvent | TaskKind::DeferredComplete => self.event.push_back(t),
                }
                true
            }
            None => false,
        }
    }

    fn take_task(&mut self, id: TaskId) -> Option<WorkTask> {
        for kind in [TaskKind::Immediate, TaskKind::Interleave, TaskKind::DeferredEvent] {
            if let Some(list) = self.list_mut(kind) {
                if let Some(pos) = list.iter().position(|t| t.id == id) {
                    return list.remove(pos);
                }
            }
        }
        let key = self.timed.iter().find(|(_, t)| t.id == id).map(|(k, _)| *k);
        key.and_then(|k| self.timed.remove(&k))
    }

    /// `find_work_task`/`has_task_by_parm1`: match by `parm1` across all
    /// lists. `kind = None` matches any list, per `find_work_task(-1, ...)`.
    pub fn find_by_parm1(&self, parm1: &Parm1, kind: Option<TaskKind>) -> Option<TaskId> {
        let lists: Vec<&VecDeque<WorkTask>> = match kind {
            Some(TaskKind::Immediate) => vec![&self.immediate],
            Some(TaskKind::Interleave) => vec![&self.interleave],
            Some(TaskKind::DeferredEvent) | Some(TaskKind::DeferredComplete) => vec![&self.event],
            Some(TaskKind::Timed) => vec![],
            None => vec![&self.immediate, &self.interleave, &self.event],
        };
        for list in lists {
            if let Some(t) = list.iter().find(|t| &t.parm1 == parm1) {
                return Some(t.id);
            }
        }
        if kind.is_none() || kind == Some(TaskKind::Timed) {
            if let Some((_, t)) = self.timed.iter().find(|(_, t)| &t.parm1 == parm1) {
                return Some(t.id);
            }
        }
        None
    }

    pub fn has_task_by_parm1(&self, parm1: &Parm1) -> bool {
        self.find_by_parm1(parm1, None).is_some()
    }

    /// `delete_task_by_parm1_func`: delete every task (or just the first,
    /// per `option`) matching `parm1`, searching event, then timed, then
    /// immediate lists, in that order exactly as the original iterates.
    pub fn delete_by_parm1(&mut self, parm1: &Parm1, delete_all: bool) -> usize {
        let mut removed = 0;
        loop {
            if let Some(idx) = self.event.iter().position(|t| &t.parm1 == parm1) {
                self.event.remove(idx);
                removed += 1;
            } else if let Some(key) = self.timed.iter().find(|(_, t)| &t.parm1 == parm1).map(|(k, _)| *k) {
                self.timed.remove(&key);
                removed += 1;
            } else if let Some(idx) = self.immediate.iter().position(|t| &t.parm1 == parm1) {
                self.immediate.remove(idx);
                removed += 1;
            } else {
                break;
            }
            if !delete_all {
                break;
            }
        }
        removed
    }

    /// `default_next_task`: drain Immediate fully, drain Interleave up to
    /// the cycle-start tail snapshot, drain expired Timed entries in
    /// order, and — if `delay_entry` was raised — sweep `DeferredComplete`
    /// tasks off the event list. Returns (dispatched tasks, idle seconds
    /// until the next timed task, clipped to the 2-second basic cycle).
    pub fn drain_cycle(&mut self) -> (Vec<WorkTask>, i64) {
        let mut dispatched = Vec::new();
        let now = now_s();

        if self.delay_entry {
            let mut remaining = VecDeque::new();
            while let Some(t) = self.event.pop_front() {
                if t.kind == TaskKind::DeferredComplete {
                    dispatched.push(t);
                } else {
                    remaining.push_back(t);
                }
            }
            self.event = remaining;
            self.delay_entry = false;
        }

        while let Some(t) = self.immediate.pop_front() {
            dispatched.push(t);
        }

        // Snapshot the tail at cycle start: only tasks already queued when
        // this cycle began are drained, so freshly appended interleaved
        // work waits one cycle (prevents starvation of timed/IO).
        let snapshot_len = self.interleave.len();
        for _ in 0..snapshot_len {
            if let Some(t) = self.interleave.pop_front() {
                dispatched.push(t);
            }
        }

        let mut tilwhen: i64 = 2;
        if !self.interleave.is_empty() {
            tilwhen = 0;
        }

        loop {
            let next_key = self.timed.keys().next().copied();
            match next_key {
                Some((event_time, _)) if event_time <= now => {
                    if let Some((_, t)) = self.timed.pop_first() {
                        dispatched.push(t);
                    }
                }
                Some((event_time, _)) => {
                    let delay = event_time - now;
                    if tilwhen > delay {
                        tilwhen = delay;
                    }
                    break;
                }
                None => break,
            }
        }

        (dispatched, tilwhen)
    }

    pub fn timed_len(&self) -> usize {
        self.timed.len()
    }

    /// Asserts the timed list is sorted non-decreasing by event time —
    /// true by construction (`BTreeMap` key order) but exposed for tests
    /// exercising the invariant from spec §8.
    pub fn timed_is_sorted(&self) -> bool {
        self.timed.keys().zip(self.timed.keys().skip(1)).all(|(a, b)| a <= b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_list_sorted_and_ties_preserve_insertion_order() {
        let mut d = Dispatcher::new();
        let base = now_s() + 1000;
        let mut ids = Vec::new();
        for i in 0..20 {
            let t = base + (i % 5);
            ids.push(d.set_task(TaskKind::Timed, t, Parm1::None, TaskAction::Generic { label: i.to_string() }));
        }
        assert!(d.timed_is_sorted());
        assert_eq!(d.timed_len(), 20);
    }

    #[test]
    fn immediate_drains_before_interleave_and_timed() {
        let mut d = Dispatcher::new();
        d.set_task(TaskKind::Interleave, 0, Parm1::None, TaskAction::Generic { label: "i".into() });
        d.set_task(TaskKind::Immediate, 0, Parm1::None, TaskAction::Generic { label: "m".into() });
        let (dispatched, _) = d.drain_cycle();
        assert_eq!(dispatched.len(), 2);
        assert_eq!(dispatched[0].action, TaskAction::Generic { label: "m".into() });
    }

    #[test]
    fn freshly_appended_interleave_waits_one_cycle() {
        let mut d = Dispatcher::new();
        d.set_task(TaskKind::Interleave, 0, Parm1::None, TaskAction::Generic { label: "first".into() });
        // Simulate appending more interleaved work mid-cycle by calling
        // drain_cycle once (drains "first"), then appending "second" and
        // draining again alone: only "second" comes out, once.
        let (first_batch, _) = d.drain_cycle();
        assert_eq!(first_batch.len(), 1);
        d.set_task(TaskKind::Interleave, 0, Parm1::None, TaskAction::Generic { label: "second".into() });
        let (second_batch, _) = d.drain_cycle();
        assert_eq!(second_batch.len(), 1);
    }

    #[test]
    fn delete_by_parm1_removes_matching_task() {
        let mut d = Dispatcher::new();
        let job = Parm1::Job("123.server".into());
        d.set_task(TaskKind::Timed, now_s() + 5, job.clone(), TaskAction::JobExecutionTime { job: "123.server".into() });
        assert!(d.has_task_by_parm1(&job));
        assert_eq!(d.delete_by_parm1(&job, true), 1);
        assert!(!d.has_task_by_parm1(&job));
    }
}
