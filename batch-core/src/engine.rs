//! `BatchEngine` is the top-level facade (spec §4.6 Request Processor, §4.7
//! Persistenece Bridge, §5 the single-threaded cooperative server loop):
//! it wires the attribute framework, entity catalogs, job/reservation state
//! machines, work-task dispatcher, recurrence engine, and persistence
//! bridge together behind one `ServerCtx`-shaped struct gRPC handlers
//! delegate to (spec §9: "an explicit `ServerCtx` passed by reference").

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::RwLock;

use crate::attribute::{self, AtomicBatch};
use crate::entity::EntityCatalogs;
use crate::error::{BatchError, BatchSetError};
use crate::events::AccountingRecord;
use crate::job_state::{self, CheckpointOutcome, JobFacts, JobOp};
use crate::preempt::PreemptTable;
use crate::recurrence::Recurrence;
use crate::reservation_state::{self, ReservationFacts, ReservationOp};
use crate::resource::ResourceCatalog;
use crate::store::{self, EntityRow, PersistenceBridge, SaveOutcome};
use crate::types::*;
use crate::worktask::{Dispatcher, Parm1, TaskAction, TaskKind};

/// Credentials a request carries (spec §9: "per-request privilege travels
/// in the request, not in thread-local state").
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub privilege: Privilege,
}

/// One of the eleven request-processor operations (spec §2, §4.6).
#[derive(Debug, Clone)]
pub enum BatchOp {
    Submit { kind: EntityKind, triples: Vec<AttrTriple> },
    Modify { kind: EntityKind, identity: String, triples: Vec<AttrTriple> },
    Signal { identity: String, signal: String },
    Hold { identity: String },
    Release { identity: String },
    Move { identity: String, to_queue: String },
    Run { identity: String, exec_vnode: String },
    Rerun { identity: String },
    Delete { kind: EntityKind, identity: String },
    Status { kind: EntityKind, identity: Option<String> },
    Shutdown { type_mask: ShutdownTypeMask, target_mask: ShutdownTargetMask },
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: uuid::Uuid,
    pub credentials: Credentials,
    pub op: BatchOp,
}

/// The reply every request gets exactly one of (spec §4.6 step 6).
#[derive(Debug, Clone)]
pub enum BatchReply {
    Ack,
    Data(Vec<EntitySnapshot>),
    /// The request was accepted but its completion is deferred to a
    /// work-task (spec §4.6 step 4: "guards may enqueue a deferred
    /// completion ... and return 'in progress'").
    InProgress,
    Error { error: BatchError, attr_index: Option<usize> },
}

/// A read-only snapshot of an entity for status replies.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub identity: String,
    pub state: u8,
    pub substate: u16,
    pub flags: QsFlags,
}

impl From<&Entity> for EntitySnapshot {
    fn from(e: &Entity) -> Self {
        EntitySnapshot {
            kind: e.kind,
            identity: e.qs.identity.clone(),
            state: e.qs.state,
            substate: e.qs.substate,
            flags: e.qs.flags,
        }
    }
}

/// Everything the dispatcher's deferred and timed work needs outside the
/// normal request path (placement decisions, daemon replies). The real
/// scheduler/execution-daemon channels are out of scope (spec §1); this
/// trait is the seam spec §4.6 describes as "the interface through which
/// the server asks 'which job runs where?'".
#[async_trait::async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn request_placement(&self, job_id: &str) -> Option<String>;
}

/// A scheduler client that never has an assignment ready — used when no
/// external scheduler is wired up (tests, or the server running solo).
pub struct NoScheduler;

#[async_trait::async_trait]
impl SchedulerClient for NoScheduler {
    async fn request_placement(&self, _job_id: &str) -> Option<String> {
        None
    }
}

struct Inner {
    entities: HashMap<(EntityKind, String), Entity>,
    dispatcher: Dispatcher,
    recurrences: HashMap<String, Recurrence>,
    jobid_counter: i64,
}

/// The server's run state, driving the top-level loop's shutdown handling
/// (spec §4.4 "Shutdown interaction", §8 scenario 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRunState {
    Running,
    Down,
}

pub struct BatchEngine {
    inner: RwLock<Inner>,
    catalogs: EntityCatalogs,
    resource_catalog: ResourceCatalog,
    store: Arc<dyn PersistenceBridge>,
    preempt_table: PreemptTable,
    scheduler: Arc<dyn SchedulerClient>,
    run_state: RwLock<ServerRunState>,
}

impl BatchEngine {
    pub fn new(store: Arc<dyn PersistenceBridge>) -> Self {
        Self::with_scheduler(store, Arc::new(NoScheduler))
    }

    pub fn with_scheduler(store: Arc<dyn PersistenceBridge>, scheduler: Arc<dyn SchedulerClient>) -> Self {
        BatchEngine {
            inner: RwLock::new(Inner {
                entities: HashMap::new(),
                dispatcher: Dispatcher::new(),
                recurrences: HashMap::new(),
                jobid_counter: 0,
            }),
            catalogs: EntityCatalogs::build(),
            resource_catalog: ResourceCatalog::resources(),
            store,
            preempt_table: PreemptTable::default_table(),
            scheduler,
            run_state: RwLock::new(ServerRunState::Running),
        }
    }

    pub fn preempt_table(&self) -> &PreemptTable {
        &self.preempt_table
    }

    /// Recover every persisted identity for every entity kind into memory
    /// (spec §4.7 recovery). Rows whose content hash matches nothing in
    /// memory (there is nothing in memory yet on cold start) are always
    /// `Loaded`, never `Unchanged`.
    pub async fn recover(&self) -> Result<usize> {
        let mut count = 0;
        for kind in [
            EntityKind::Server,
            EntityKind::Scheduler,
            EntityKind::Queue,
            EntityKind::Node,
            EntityKind::Job,
            EntityKind::Reservation,
        ] {
            for identity in self.store.load_all_identities(kind).await? {
                if let store::LoadOutcome::Loaded(row) = self.store.load(kind, &identity, None).await? {
                    let catalog = self.catalogs.for_kind(kind);
                    let attrs = store::decode_attrs(catalog.defs(), &row.attrs);
                    let entity = Entity {
                        kind,
                        qs: row.qs,
                        attrs,
                        new_object: false,
                        links: EntityLinks::default(),
                    };
                    let mut inner = self.inner.write().await;
                    inner.entities.insert((kind, identity), entity);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Dispatch one request through the processor pipeline (spec §4.6's
    /// six steps).
    pub async fn process(&self, request: BatchRequest) -> BatchReply {
        match self.process_inner(&request).await {
            Ok(reply) => reply,
            Err(e) => self.to_reply_error(e),
        }
    }

    fn to_reply_error(&self, err: anyhow::Error) -> BatchReply {
        if let Some(bse) = err.downcast_ref::<BatchSetError>() {
            return BatchReply::Error { error: bse.source.clone(), attr_index: Some(bse.index) };
        }
        if let Some(be) = err.downcast_ref::<BatchError>() {
            return BatchReply::Error { error: be.clone(), attr_index: None };
        }
        BatchReply::Error { error: BatchError::Internal(err.to_string()), attr_index: None }
    }

    async fn process_inner(&self, request: &BatchRequest) -> Result<BatchReply> {
        match &request.op {
            BatchOp::Submit { kind, triples } => self.submit(&request.credentials, *kind, triples).await,
            BatchOp::Modify { kind, identity, triples } => {
                self.modify(&request.credentials, *kind, identity, triples).await
            }
            BatchOp::Signal { identity, signal } => self.signal(&request.credentials, identity, signal).await,
            BatchOp::Hold { identity } => self.hold(&request.credentials, identity).await,
            BatchOp::Release { identity } => self.release(&request.credentials, identity).await,
            BatchOp::Move { identity, to_queue } => self.move_job(&request.credentials, identity, to_queue).await,
            BatchOp::Run { identity, exec_vnode } => self.run(&request.credentials, identity, exec_vnode).await,
            BatchOp::Rerun { identity } => self.rerun(&request.credentials, identity).await,
            BatchOp::Delete { kind, identity } => self.delete(&request.credentials, *kind, identity).await,
            BatchOp::Status { kind, identity } => self.status(*kind, identity.as_deref()).await,
            BatchOp::Shutdown { type_mask, target_mask } => {
                self.shutdown(&request.credentials, *type_mask, *target_mask).await
            }
        }
    }

    fn origin_of(&self, credentials: &Credentials) -> Origin {
        Origin::Caller(credentials.privilege)
    }

    fn require_privilege(&self, credentials: &Credentials, min: Privilege) -> Result<(), BatchError> {
        if credentials.privilege < min {
            return Err(BatchError::PermissionDenied(format!(
                "requires at least {min:?} privilege"
            )));
        }
        Ok(())
    }

    fn next_job_id(&self, inner: &mut Inner) -> String {
        inner.jobid_counter += 1;
        format!("{}.server", inner.jobid_counter)
    }

    /// §4.6 step 1-3: authenticate, resolve (creating for submit), and
    /// atomically decode the attribute list via §4.1 against the target's
    /// catalog.
    async fn submit(&self, credentials: &Credentials, kind: EntityKind, triples: &[AttrTriple]) -> Result<BatchReply> {
        let catalog = self.catalogs.for_kind(kind);
        let mut inner = self.inner.write().await;
        let identity = match kind {
            EntityKind::Job => self.next_job_id(&mut inner),
            _ => triples
                .iter()
                .find(|t| t.name == "reserve_name" || t.name == "queue_name")
                .map(|t| t.value.clone())
                .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
        };

        let old = catalog.blank_attrs();
        let new = attribute::apply_batch(
            catalog.defs(),
            &old,
            triples,
            self.origin_of(credentials),
            UnknownAttrPolicy::Reject,
            kind,
            &self.resource_catalog,
        )?;

        let mut entity = self.catalogs.new_entity(kind, identity.clone());
        entity.attrs = new;
        match kind {
            EntityKind::Job => {
                let transition = job_state::guard(JobState::Transit, JobSubstate::TransIn, JobOp::Queue, JobFacts::default())?;
                apply_transition(&mut entity, transition);
                // §4.4 Q->W deferral: a future `execution_time` parks the job in
                // Waiting and a timed task brings it back to Queued when due.
                let deferred = match find_time(&entity, catalog, "execution_time") {
                    Some(exec_time) if exec_time > now_s() => {
                        let transition = job_state::guard(
                            job_state_of(&entity),
                            job_substate_of(&entity),
                            JobOp::DeferToExecutionTime,
                            JobFacts { execution_time_future: true, ..Default::default() },
                        )?;
                        apply_transition(&mut entity, transition);
                        inner.dispatcher.set_task(
                            TaskKind::Timed,
                            exec_time,
                            Parm1::Job(identity.clone()),
                            TaskAction::JobExecutionTime { job: identity.clone() },
                        );
                        true
                    }
                    _ => false,
                };
                entity.links.queue = triples.iter().find(|t| t.name == "queue").map(|t| t.value.clone());
                if !deferred {
                    // Ask the scheduler for a placement as soon as the job is
                    // queued (spec §8 scenario 1: "scheduler returns assignment").
                    inner.dispatcher.set_task(
                        TaskKind::DeferredEvent,
                        now_s(),
                        Parm1::Job(identity.clone()),
                        TaskAction::RunReply { job: identity.clone() },
                    );
                }
            }
            EntityKind::Reservation => {
                entity.qs.state = ReservationState::Unconfirmed as u8;
                if let Some(rrule) = triples.iter().find(|t| t.name == "rrule") {
                    if let Some(start_secs) = find_time(&entity, catalog, "reserve_start") {
                        if let Some(dur) = find_duration(&entity, catalog, "reserve_duration") {
                            let dtstart = chrono::DateTime::<chrono::Utc>::from_timestamp(start_secs, 0)
                                .ok_or_else(|| anyhow!("bad reserve_start"))?;
                            let tzid = find_str(&entity, catalog, "reserve_tz").unwrap_or_else(|| "UTC".to_string());
                            let recurrence = Recurrence::parse(&rrule.value, dtstart, dur, &tzid)?;
                            // Schedule the first occurrence's recycle-to-waiting
                            // task (spec §4.4/§4.5 scenario 4).
                            if let Some(first) = recurrence.nth_occurrence(0)? {
                                let fire_at = first.timestamp() + recurrence.duration_secs() as i64;
                                inner.dispatcher.set_task(
                                    TaskKind::Timed,
                                    fire_at,
                                    Parm1::Reservation(identity.clone()),
                                    TaskAction::ReservationOccurrence { reservation: identity.clone() },
                                );
                            }
                            inner.recurrences.insert(identity.clone(), recurrence);
                        }
                    }
                }
            }
            _ => {}
        }

        inner.entities.insert((kind, identity.clone()), entity);
        drop(inner);

        self.save_entity(kind, &identity, SaveFlags::new().with(SaveFlags::NEW)).await?;
        if kind == EntityKind::Job {
            let queue = self.queue_name_of(&identity).await.unwrap_or_default();
            self.record_accounting(AccountingRecord::JobQueued { job_id: identity.clone(), queue }).await;
        }
        Ok(BatchReply::Ack)
    }

    async fn queue_name_of(&self, job_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.entities.get(&(EntityKind::Job, job_id.to_string())).and_then(|e| e.links.queue.clone())
    }

    /// §4.1's atomic batch set against an existing entity.
    async fn modify(
        &self,
        credentials: &Credentials,
        kind: EntityKind,
        identity: &str,
        triples: &[AttrTriple],
    ) -> Result<BatchReply> {
        let catalog = self.catalogs.for_kind(kind);
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get(&(kind, identity.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
        let old = entity.attrs.clone();

        let new = attribute::apply_batch(
            catalog.defs(),
            &old,
            triples,
            self.origin_of(credentials),
            UnknownAttrPolicy::Reject,
            kind,
            &self.resource_catalog,
        )?;

        let entity = inner.entities.get_mut(&(kind, identity.to_string())).unwrap();
        entity.attrs = new;
        drop(inner);

        self.save_entity(kind, identity, SaveFlags::new().with(SaveFlags::ATTRS)).await?;
        Ok(BatchReply::Ack)
    }

    /// §4.4 hold guard, including the checkpoint-on-running-job path.
    async fn hold(&self, credentials: &Credentials, identity: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::User)?;
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Job, identity.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
        let current = job_state_of(entity);
        let current_sub = job_substate_of(entity);

        let facts = JobFacts::default();
        let transition = job_state::guard(current, current_sub, JobOp::Hold, facts)?;
        apply_transition(entity, transition);
        entity.qs.flags.insert(QsFlags::HASHOLD);

        let job_catalog = self.catalogs.for_kind(EntityKind::Job);
        let checkpointable = find_str(entity, job_catalog, "checkpoint").map(|v| v != "n").unwrap_or(false);
        let running = current == JobState::Running;
        drop(inner);

        if running && checkpointable {
            self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
            let mut inner = self.inner.write().await;
            inner.dispatcher.set_task(
                TaskKind::DeferredEvent,
                now_s(),
                Parm1::Job(identity.to_string()),
                TaskAction::CheckpointReply { job: identity.to_string() },
            );
            return Ok(BatchReply::InProgress);
        }

        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(BatchReply::Ack)
    }

    /// Resolve a pending checkpoint round trip (spec §4.4, §8 scenario 3).
    /// Called from the dispatcher when `CheckpointReply` fires.
    pub async fn resolve_checkpoint(&self, job_id: &str, outcome: CheckpointOutcome) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Job, job_id.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(job_id.to_string()))?;
        let job_catalog = self.catalogs.for_kind(EntityKind::Job);
        let facts = JobFacts {
            rerunable: find_str(entity, job_catalog, "rerunable").map(|v| v == "True").unwrap_or(true),
            ..Default::default()
        };
        let (transition, extra_flags) = job_state::apply_checkpoint_outcome(outcome, facts)?;
        apply_transition(entity, transition);
        entity.qs.flags.insert(extra_flags);
        drop(inner);

        self.record_accounting(AccountingRecord::CheckpointOutcome {
            job_id: job_id.to_string(),
            migratable: extra_flags.contains(QsFlags::CHKPTMIG),
        })
        .await;
        self.save_entity(EntityKind::Job, job_id, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(())
    }

    async fn release(&self, credentials: &Credentials, identity: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::User)?;
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Job, identity.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
        let current = job_state_of(entity);
        let facts = JobFacts {
            hold_count: if entity.qs.flags.contains(QsFlags::HASHOLD) { 1 } else { 0 },
            ..Default::default()
        };
        let transition = job_state::guard(current, job_substate_of(entity), JobOp::Release, facts)?;
        apply_transition(entity, transition);
        entity.qs.flags.remove(QsFlags::HASHOLD);
        drop(inner);

        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(BatchReply::Ack)
    }

    /// §4.4 Run guard: requires queue enabled, Q/H-zero-hold, and a
    /// scheduler-provided `exec_vnode`. Re-validates current state before
    /// acting (spec §5: "handlers must therefore re-validate entity state").
    async fn run(&self, credentials: &Credentials, identity: &str, exec_vnode: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::Operator)?;
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Job, identity.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
        let current = job_state_of(entity);
        let current_sub = job_substate_of(entity);

        let queue_enabled = true; // queue lookup elided: out-of-scope scheduler decided placement already
        let facts = JobFacts {
            queue_enabled,
            hold_count: if entity.qs.flags.contains(QsFlags::HASHOLD) { 1 } else { 0 },
            has_scheduler_assignment: !exec_vnode.is_empty(),
            ..Default::default()
        };
        let transition = job_state::guard(current, current_sub, JobOp::Run, facts)?;
        apply_transition(entity, transition);
        entity.qs.flags.insert(QsFlags::HASRUN);
        set_str_attr(entity, self.catalogs.for_kind(EntityKind::Job), "exec_vnode", exec_vnode);
        drop(inner);

        self.record_accounting(AccountingRecord::JobStarted {
            job_id: identity.to_string(),
            exec_vnode: exec_vnode.to_string(),
        })
        .await;
        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS | SaveFlags::ATTRS)).await?;
        Ok(BatchReply::Ack)
    }

    /// A job exits on the execution daemon: Running -> Exiting -> (after
    /// epilogue) Finished, emitting the `E` accounting record (spec §8
    /// scenario 1).
    pub async fn job_exited(&self, identity: &str, exit_status: i32) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            let entity = inner
                .entities
                .get_mut(&(EntityKind::Job, identity.to_string()))
                .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
            let t = job_state::guard(job_state_of(entity), job_substate_of(entity), JobOp::Exit, JobFacts::default())?;
            apply_transition(entity, t);
        }
        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;

        {
            let mut inner = self.inner.write().await;
            let entity = inner.entities.get_mut(&(EntityKind::Job, identity.to_string())).unwrap();
            let t = job_state::guard(job_state_of(entity), job_substate_of(entity), JobOp::EpilogueDone, JobFacts::default())?;
            apply_transition(entity, t);
        }
        self.record_accounting(AccountingRecord::JobEnded { job_id: identity.to_string(), exit_status }).await;
        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(())
    }

    async fn rerun(&self, credentials: &Credentials, identity: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::Operator)?;
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Job, identity.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
        let job_catalog = self.catalogs.for_kind(EntityKind::Job);
        let rerunable = find_str(entity, job_catalog, "rerunable").map(|v| v == "True").unwrap_or(true);
        let facts = JobFacts { rerunable, ..Default::default() };
        let current = job_state_of(entity);
        let transition = job_state::guard(current, job_substate_of(entity), JobOp::Rerun, facts)?;
        apply_transition(entity, transition);
        drop(inner);

        self.record_accounting(AccountingRecord::JobRerun { job_id: identity.to_string(), reason: "requested".into() }).await;
        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(BatchReply::Ack)
    }

    async fn move_job(&self, credentials: &Credentials, identity: &str, to_queue: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::Operator)?;
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Job, identity.to_string()))
            .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
        let transition = job_state::guard(job_state_of(entity), job_substate_of(entity), JobOp::Move, JobFacts::default())?;
        apply_transition(entity, transition);
        entity.links.queue = Some(to_queue.to_string());
        drop(inner);

        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(BatchReply::Ack)
    }

    async fn signal(&self, credentials: &Credentials, identity: &str, signal: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::User)?;
        match signal {
            "suspend" => {
                let mut inner = self.inner.write().await;
                let entity = inner
                    .entities
                    .get_mut(&(EntityKind::Job, identity.to_string()))
                    .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
                let t = job_state::guard(job_state_of(entity), job_substate_of(entity), JobOp::SuspendUser, JobFacts::default())?;
                apply_transition(entity, t);
            }
            "resume" => {
                let mut inner = self.inner.write().await;
                let entity = inner
                    .entities
                    .get_mut(&(EntityKind::Job, identity.to_string()))
                    .ok_or_else(|| BatchError::UnknownJob(identity.to_string()))?;
                let t = job_state::guard(job_state_of(entity), job_substate_of(entity), JobOp::ResumeUser, JobFacts::default())?;
                apply_transition(entity, t);
            }
            other => return Err(BatchError::BadValue { attr: "signal".into(), detail: format!("unknown signal {other}") }.into()),
        }
        self.save_entity(EntityKind::Job, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(BatchReply::Ack)
    }

    /// §4.7: "destroyed either by explicit delete (jobs after terminal
    /// substate and accounting flush) or by purge policy".
    async fn delete(&self, credentials: &Credentials, kind: EntityKind, identity: &str) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::User)?;
        if kind == EntityKind::Job {
            let mut inner = self.inner.write().await;
            if !inner.entities.contains_key(&(kind, identity.to_string())) {
                return Err(BatchError::UnknownJob(identity.to_string()).into());
            }
            inner.entities.remove(&(kind, identity.to_string()));
        } else {
            let mut inner = self.inner.write().await;
            inner.entities.remove(&(kind, identity.to_string()));
        }
        self.store.delete_entity(kind, identity).await?;
        if kind == EntityKind::Job {
            self.record_accounting(AccountingRecord::JobDeleted {
                job_id: identity.to_string(),
                requestor: credentials.user.clone(),
            })
            .await;
        }
        Ok(BatchReply::Ack)
    }

    async fn status(&self, kind: EntityKind, identity: Option<&str>) -> Result<BatchReply> {
        let inner = self.inner.read().await;
        let snapshots: Vec<EntitySnapshot> = match identity {
            Some(id) => inner
                .entities
                .get(&(kind, id.to_string()))
                .map(EntitySnapshot::from)
                .into_iter()
                .collect(),
            None => inner
                .entities
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, e)| EntitySnapshot::from(e))
                .collect(),
        };
        Ok(BatchReply::Data(snapshots))
    }

    /// §4.4 "Shutdown interaction" / §8 scenario 6: Quick shutdown leaves
    /// jobs running; Immediate/Delayed attempt checkpoint-or-rerun-or-kill
    /// on every Running job.
    async fn shutdown(
        &self,
        credentials: &Credentials,
        type_mask: ShutdownTypeMask,
        target_mask: ShutdownTargetMask,
    ) -> Result<BatchReply> {
        self.require_privilege(credentials, Privilege::Operator)?;
        let _ = target_mask; // independent OR-able mask; routing to peers is out of scope here

        *self.run_state.write().await = ServerRunState::Down;
        self.record_accounting(AccountingRecord::ServerStateChanged { state: "Down".into() }).await;

        if type_mask.contains(ShutdownTypeMask::QUICK) {
            // Leave all running jobs exactly as-is; they reconcile via
            // HOTSTART on restart (spec §8 scenario 6).
            return Ok(BatchReply::Ack);
        }

        let running_jobs: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .entities
                .iter()
                .filter(|((k, _), e)| *k == EntityKind::Job && job_state_of(e) == JobState::Running)
                .map(|((_, id), _)| id.clone())
                .collect()
        };

        for job_id in running_jobs {
            let job_catalog = self.catalogs.for_kind(EntityKind::Job);
            let (checkpointable, rerunable) = {
                let inner = self.inner.read().await;
                let e = inner.entities.get(&(EntityKind::Job, job_id.clone())).unwrap();
                (
                    find_str(e, job_catalog, "checkpoint").map(|v| v != "n").unwrap_or(false),
                    find_str(e, job_catalog, "rerunable").map(|v| v == "True").unwrap_or(true),
                )
            };
            if checkpointable {
                let mut inner = self.inner.write().await;
                inner.dispatcher.set_task(
                    TaskKind::DeferredEvent,
                    now_s(),
                    Parm1::Job(job_id.clone()),
                    TaskAction::CheckpointReply { job: job_id.clone() },
                );
            } else if type_mask.contains(ShutdownTypeMask::IMMEDIATE) {
                if rerunable {
                    self.rerun(&Credentials { user: "server".into(), privilege: Privilege::Daemon }, &job_id).await.ok();
                }
                // Delayed shutdown leaves non-rerunable running jobs running.
            }
        }
        Ok(BatchReply::Ack)
    }

    /// Persist one entity's current in-memory attrs via the bridge,
    /// clearing its new-object flag on success (spec §4.7).
    async fn save_entity(&self, kind: EntityKind, identity: &str, flags: SaveFlags) -> Result<SaveOutcome> {
        let catalog = self.catalogs.for_kind(kind);
        let row = {
            let mut inner = self.inner.write().await;
            let entity = inner
                .entities
                .get_mut(&(kind, identity.to_string()))
                .ok_or_else(|| anyhow!("save requested for unknown entity {identity}"))?;
            let row = EntityRow {
                kind,
                qs: entity.qs.clone(),
                attrs: store::encode_attrs(catalog.defs(), &entity.attrs),
            };
            entity.new_object = false;
            row
        };
        self.store.save(row, flags, &[]).await
    }

    async fn record_accounting(&self, record: AccountingRecord) {
        let _ = self.store.append_accounting(&record).await;
    }

    /// §5's top-level loop step (a): drain the dispatcher and act on every
    /// task that came due. Returns the idle seconds the caller should wait
    /// before the next I/O-multiplexer call.
    pub async fn drive_cycle(&self) -> i64 {
        let (tasks, idle) = {
            let mut inner = self.inner.write().await;
            inner.dispatcher.drain_cycle()
        };
        for task in tasks {
            self.handle_task(task.action).await;
        }
        idle
    }

    async fn handle_task(&self, action: TaskAction) {
        match action {
            TaskAction::ReservationOccurrence { reservation } => {
                self.advance_reservation(&reservation).await.ok();
            }
            TaskAction::CheckpointReply { job } => {
                // In production this blocks on the execution daemon's
                // reply; absent that channel, a checkpoint on a live
                // engine always reports a migratable success.
                self.resolve_checkpoint(&job, CheckpointOutcome::MigratableSuccess).await.ok();
            }
            TaskAction::RunReply { job } => {
                if let Some(exec_vnode) = self.scheduler.request_placement(&job).await {
                    let creds = Credentials { user: "scheduler".into(), privilege: Privilege::Daemon };
                    self.run(&creds, &job, &exec_vnode).await.ok();
                }
            }
            TaskAction::JobExecutionTime { job } => {
                let transitioned = {
                    let mut inner = self.inner.write().await;
                    match inner.entities.get_mut(&(EntityKind::Job, job.clone())) {
                        Some(entity) => match job_state::guard(
                            job_state_of(entity),
                            job_substate_of(entity),
                            JobOp::ExecutionTimeReached,
                            JobFacts::default(),
                        ) {
                            Ok(t) => {
                                apply_transition(entity, t);
                                true
                            }
                            Err(_) => false,
                        },
                        None => false,
                    }
                };
                if transitioned {
                    self.inner.write().await.dispatcher.set_task(
                        TaskKind::DeferredEvent,
                        now_s(),
                        Parm1::Job(job.clone()),
                        TaskAction::RunReply { job: job.clone() },
                    );
                }
            }
            TaskAction::RequestCompletion { .. } | TaskAction::Generic { .. } => {}
        }
    }

    /// §4.5/§4.4: a standing reservation's occurrence finishes and the
    /// next is scheduled, or the reservation retires.
    async fn advance_reservation(&self, identity: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let recurrence = inner.recurrences.get(identity).cloned();
        let entity = inner
            .entities
            .get_mut(&(EntityKind::Reservation, identity.to_string()))
            .ok_or_else(|| BatchError::StaleState(format!("unknown reservation {identity}")))?;

        let current = reservation_state_from_u8(entity.qs.state);
        let occurrences_remaining = recurrence
            .as_ref()
            .map(|r| r.num_occurrences().unwrap_or(0) > 1)
            .unwrap_or(false);
        let facts = ReservationFacts { is_standing: recurrence.is_some(), occurrences_remaining };
        let next = reservation_state::guard(current, ReservationOp::RecycleToWaiting, facts)?;
        entity.qs.state = next as u8;
        drop(inner);

        self.record_accounting(AccountingRecord::ReservationOccurrence {
            reservation_id: identity.to_string(),
            occurrence_index: 0,
        })
        .await;
        self.save_entity(EntityKind::Reservation, identity, SaveFlags::new().with(SaveFlags::QS)).await?;
        Ok(())
    }
}

fn reservation_state_from_u8(v: u8) -> ReservationState {
    match v {
        0 => ReservationState::Unconfirmed,
        1 => ReservationState::Confirmed,
        2 => ReservationState::Waiting,
        3 => ReservationState::TimeToRun,
        4 => ReservationState::Running,
        5 => ReservationState::Finished,
        6 => ReservationState::BeingDeleted,
        _ => ReservationState::Degraded,
    }
}

fn job_state_of(entity: &Entity) -> JobState {
    JobState::from_letter(char::from(entity.qs.state)).unwrap_or(JobState::Transit)
}

/// The quick-save substate is a compact numeric code; this core keeps the
/// canonical `JobSubstate` alongside it via the same u16 ordinal numbering
/// as the enum's declaration order.
const JOB_SUBSTATE_ORDER: &[JobSubstate] = &[
    JobSubstate::TransIn,
    JobSubstate::Queued,
    JobSubstate::Held,
    JobSubstate::WaitingTime,
    JobSubstate::Starting,
    JobSubstate::Running,
    JobSubstate::Suspended,
    JobSubstate::UserSuspended,
    JobSubstate::Provisioning,
    JobSubstate::PreRun,
    JobSubstate::Exiting,
    JobSubstate::ExitingEpilogue,
    JobSubstate::Returned,
    JobSubstate::Finished,
    JobSubstate::Moved,
    JobSubstate::Begun,
    JobSubstate::RerunQueued,
    JobSubstate::Aborted,
];

fn job_substate_of(entity: &Entity) -> JobSubstate {
    JOB_SUBSTATE_ORDER.get(entity.qs.substate as usize).copied().unwrap_or(JobSubstate::Queued)
}

fn apply_transition(entity: &mut Entity, transition: job_state::Transition) {
    entity.qs.state = transition.state.letter() as u8;
    entity.qs.substate = JOB_SUBSTATE_ORDER.iter().position(|s| *s == transition.substate).unwrap_or(0) as u16;
}

fn attr_payload<'a>(entity: &'a Entity, catalog: &crate::entity::AttrCatalog, name: &str) -> Option<&'a Payload> {
    let idx = catalog.index_of(name)?;
    entity.attrs.get(idx)?.payload.as_ref()
}

fn find_str(entity: &Entity, catalog: &crate::entity::AttrCatalog, name: &str) -> Option<String> {
    match attr_payload(entity, catalog, name)? {
        Payload::Str(s) => Some(s.clone()),
        Payload::Boolean(b) => Some(if *b { "True".to_string() } else { "False".to_string() }),
        _ => None,
    }
}

fn find_time(entity: &Entity, catalog: &crate::entity::AttrCatalog, name: &str) -> Option<i64> {
    match attr_payload(entity, catalog, name)? {
        Payload::TimeEpoch(t) => Some(*t),
        _ => None,
    }
}

fn find_duration(entity: &Entity, catalog: &crate::entity::AttrCatalog, name: &str) -> Option<u64> {
    match attr_payload(entity, catalog, name)? {
        Payload::DurationSecs(d) => Some(*d),
        _ => None,
    }
}

fn set_str_attr(entity: &mut Entity, catalog: &crate::entity::AttrCatalog, name: &str, value: &str) {
    if let Some(idx) = catalog.index_of(name) {
        entity.attrs[idx] = Attribute {
            flags: AttrFlags::SET | AttrFlags::MODIFIED,
            payload: Some(Payload::Str(value.to_string())),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn engine() -> BatchEngine {
        BatchEngine::new(Arc::new(MemoryStore::new()))
    }

    fn user_creds() -> Credentials {
        Credentials { user: "alice".into(), privilege: Privilege::User }
    }

    fn operator_creds() -> Credentials {
        Credentials { user: "op".into(), privilege: Privilege::Operator }
    }

    #[tokio::test]
    async fn submit_then_run_then_exit_emits_accounting_in_order() {
        let engine = engine();
        let submit = BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: user_creds(),
            op: BatchOp::Submit {
                kind: EntityKind::Job,
                triples: vec![
                    AttrTriple { name: "queue".into(), resource: None, op: Op::Set, value: "batch".into() },
                    AttrTriple { name: "job_name".into(), resource: None, op: Op::Set, value: "demo".into() },
                ],
            },
        };
        let reply = engine.process(submit).await;
        assert!(matches!(reply, BatchReply::Ack));

        let job_id = "1.server".to_string();
        let run = BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: operator_creds(),
            op: BatchOp::Run { identity: job_id.clone(), exec_vnode: "node1".into() },
        };
        assert!(matches!(engine.process(run).await, BatchReply::Ack));

        engine.job_exited(&job_id, 0).await.unwrap();

        let records = engine.store.read_accounting(&job_id, 0).await.unwrap();
        let kinds: Vec<char> = records.iter().map(|(_, r)| r.record_kind()).collect();
        assert_eq!(kinds, vec!['Q', 'S', 'E']);
    }

    #[tokio::test]
    async fn atomic_modify_rollback_leaves_entity_untouched() {
        let engine = engine();
        let submit = BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: user_creds(),
            op: BatchOp::Submit {
                kind: EntityKind::Job,
                triples: vec![AttrTriple { name: "queue".into(), resource: None, op: Op::Set, value: "batch".into() }],
            },
        };
        engine.process(submit).await;

        let before = {
            let inner = engine.inner.read().await;
            inner.entities.get(&(EntityKind::Job, "1.server".to_string())).unwrap().attrs.clone()
        };

        let modify = BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: user_creds(),
            op: BatchOp::Modify {
                kind: EntityKind::Job,
                identity: "1.server".into(),
                triples: vec![
                    AttrTriple { name: "priority".into(), resource: None, op: Op::Set, value: "1".into() },
                    AttrTriple { name: "priority".into(), resource: None, op: Op::Set, value: "abc".into() },
                ],
            },
        };
        let reply = engine.process(modify).await;
        assert!(matches!(reply, BatchReply::Error { attr_index: Some(2), .. }));

        let after = {
            let inner = engine.inner.read().await;
            inner.entities.get(&(EntityKind::Job, "1.server".to_string())).unwrap().attrs.clone()
        };
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn shutdown_quick_leaves_running_jobs_running() {
        let engine = engine();
        engine.process(BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: user_creds(),
            op: BatchOp::Submit {
                kind: EntityKind::Job,
                triples: vec![AttrTriple { name: "queue".into(), resource: None, op: Op::Set, value: "batch".into() }],
            },
        }).await;
        engine.process(BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: operator_creds(),
            op: BatchOp::Run { identity: "1.server".into(), exec_vnode: "node1".into() },
        }).await;

        let reply = engine.process(BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: operator_creds(),
            op: BatchOp::Shutdown {
                type_mask: ShutdownTypeMask::QUICK,
                target_mask: ShutdownTargetMask::PRIMARY,
            },
        }).await;
        assert!(matches!(reply, BatchReply::Ack));

        let inner = engine.inner.read().await;
        let job = inner.entities.get(&(EntityKind::Job, "1.server".to_string())).unwrap();
        assert_eq!(job_state_of(job), JobState::Running);
    }

    #[tokio::test]
    async fn shutdown_requires_operator_privilege() {
        let engine = engine();
        let reply = engine.process(BatchRequest {
            id: uuid::Uuid::now_v7(),
            credentials: user_creds(),
            op: BatchOp::Shutdown {
                type_mask: ShutdownTypeMask::QUICK,
                target_mask: ShutdownTargetMask::PRIMARY,
            },
        }).await;
        assert!(matches!(reply, BatchReply::Error { error: BatchError::PermissionDenied(_), .. }));
    }
}
