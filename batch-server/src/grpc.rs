use std::sync::Arc;

use tonic::{Request, Response, Status};

use batch_core::engine::{BatchEngine, BatchOp, BatchReply as EngineReply, BatchRequest, Credentials, EntitySnapshot};
use batch_core::error::BatchError;
use batch_core::types::{AttrTriple, EntityKind, Op, Privilege, ShutdownTargetMask, ShutdownTypeMask};

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("batch.v1");
}

use proto::batch_service_server::BatchService;
use proto::*;

pub struct BatchGrpcService {
    pub engine: Arc<BatchEngine>,
}

// --- Proto <-> core conversions ---

fn kind_from_proto(kind: i32) -> EntityKind {
    match proto::EntityKind::try_from(kind).unwrap_or(proto::EntityKind::Job) {
        proto::EntityKind::Server => EntityKind::Server,
        proto::EntityKind::Scheduler => EntityKind::Scheduler,
        proto::EntityKind::Queue => EntityKind::Queue,
        proto::EntityKind::Node => EntityKind::Node,
        proto::EntityKind::Job => EntityKind::Job,
        proto::EntityKind::Reservation => EntityKind::Reservation,
    }
}

fn kind_to_proto(kind: EntityKind) -> proto::EntityKind {
    match kind {
        EntityKind::Server => proto::EntityKind::Server,
        EntityKind::Scheduler => proto::EntityKind::Scheduler,
        EntityKind::Queue => proto::EntityKind::Queue,
        EntityKind::Node => proto::EntityKind::Node,
        EntityKind::Job => proto::EntityKind::Job,
        EntityKind::Reservation => proto::EntityKind::Reservation,
    }
}

fn op_from_proto(op: i32) -> Op {
    match proto::AttrOp::try_from(op).unwrap_or(proto::AttrOp::Set) {
        proto::AttrOp::Set => Op::Set,
        proto::AttrOp::Incr => Op::Incr,
        proto::AttrOp::Decr => Op::Decr,
    }
}

fn privilege_from_proto(privilege: i32) -> Privilege {
    match proto::Privilege::try_from(privilege).unwrap_or(proto::Privilege::User) {
        proto::Privilege::User => Privilege::User,
        proto::Privilege::Operator => Privilege::Operator,
        proto::Privilege::Manager => Privilege::Manager,
        proto::Privilege::Daemon => Privilege::Daemon,
    }
}

fn credentials_from_proto(creds: Option<proto::Credentials>) -> Credentials {
    match creds {
        Some(c) => Credentials { user: c.user, privilege: privilege_from_proto(c.privilege) },
        None => Credentials { user: String::new(), privilege: Privilege::User },
    }
}

fn triple_from_proto(t: proto::AttrTriple) -> AttrTriple {
    AttrTriple {
        name: t.name,
        resource: if t.resource.is_empty() { None } else { Some(t.resource) },
        op: op_from_proto(t.op),
        value: t.value,
    }
}

fn snapshot_to_proto(s: EntitySnapshot) -> proto::EntitySnapshot {
    proto::EntitySnapshot {
        kind: kind_to_proto(s.kind) as i32,
        identity: s.identity,
        state: s.state as u32,
        substate: s.substate as u32,
        flags: s.flags.bits() as u32,
    }
}

fn reply_to_proto(reply: EngineReply) -> proto::BatchReply {
    let outcome = match reply {
        EngineReply::Ack => proto::batch_reply::Outcome::Ack(true),
        EngineReply::InProgress => proto::batch_reply::Outcome::InProgress(true),
        EngineReply::Data(snapshots) => proto::batch_reply::Outcome::Data(proto::EntitySnapshotList {
            snapshots: snapshots.into_iter().map(snapshot_to_proto).collect(),
        }),
        EngineReply::Error { error, attr_index } => {
            proto::batch_reply::Outcome::Error(proto::BatchErrorReply {
                code: error.code(),
                message: error.to_string(),
                attr_index: attr_index.map(|i| i as u32),
            })
        }
    };
    proto::BatchReply { outcome: Some(outcome) }
}

/// A closed-set `BatchError` never surfaces as a gRPC transport failure —
/// every reply carries one `BatchReply` outcome (spec §4.6 step 6), so the
/// handlers below never return `Err` except via tonic's own plumbing.
async fn dispatch(engine: &BatchEngine, credentials: Credentials, op: BatchOp) -> proto::BatchReply {
    let request = BatchRequest { id: uuid::Uuid::now_v7(), credentials, op };
    reply_to_proto(engine.process(request).await)
}

#[tonic::async_trait]
impl BatchService for BatchGrpcService {
    async fn submit(&self, request: Request<SubmitRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        let kind = kind_from_proto(req.kind);
        let triples = req.triples.into_iter().map(triple_from_proto).collect();
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Submit { kind, triples }).await))
    }

    async fn modify(&self, request: Request<ModifyRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        let kind = kind_from_proto(req.kind);
        let triples = req.triples.into_iter().map(triple_from_proto).collect();
        Ok(Response::new(
            dispatch(&self.engine, credentials, BatchOp::Modify { kind, identity: req.identity, triples }).await,
        ))
    }

    async fn signal(&self, request: Request<SignalRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        Ok(Response::new(
            dispatch(&self.engine, credentials, BatchOp::Signal { identity: req.identity, signal: req.signal }).await,
        ))
    }

    async fn hold(&self, request: Request<IdentityRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Hold { identity: req.identity }).await))
    }

    async fn release(&self, request: Request<IdentityRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Release { identity: req.identity }).await))
    }

    async fn r#move(&self, request: Request<MoveRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        Ok(Response::new(
            dispatch(&self.engine, credentials, BatchOp::Move { identity: req.identity, to_queue: req.to_queue }).await,
        ))
    }

    async fn run(&self, request: Request<RunRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        Ok(Response::new(
            dispatch(&self.engine, credentials, BatchOp::Run { identity: req.identity, exec_vnode: req.exec_vnode }).await,
        ))
    }

    async fn rerun(&self, request: Request<IdentityRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Rerun { identity: req.identity }).await))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        let kind = kind_from_proto(req.kind);
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Delete { kind, identity: req.identity }).await))
    }

    async fn status(&self, request: Request<StatusRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        let kind = kind_from_proto(req.kind);
        let identity = if req.identity.is_empty() { None } else { Some(req.identity) };
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Status { kind, identity }).await))
    }

    async fn shutdown(&self, request: Request<ShutdownRequest>) -> Result<Response<proto::BatchReply>, Status> {
        let req = request.into_inner();
        let credentials = credentials_from_proto(req.credentials);
        let type_mask = ShutdownTypeMask::from_bits_truncate(req.type_mask as u8);
        let target_mask = ShutdownTargetMask::from_bits_truncate(req.target_mask as u8);
        Ok(Response::new(dispatch(&self.engine, credentials, BatchOp::Shutdown { type_mask, target_mask }).await))
    }
}

/// Map a `BatchError` to a gRPC status for callers outside the generated
/// server trait (the handlers above always reply in-band per spec §4.6
/// step 6, so this is unused by `BatchGrpcService` itself).
#[allow(dead_code)]
fn engine_err(e: BatchError) -> Status {
    Status::internal(e.to_string())
}
