//! The batch workload management core: the typed attribute/resource model,
//! entity model, job/reservation state machines, work-task dispatcher,
//! recurrence engine, request processor, and persistence bridge.
//!
//! `engine::BatchEngine` is the facade gRPC handlers delegate to.

pub mod attribute;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod job_state;
pub mod preempt;
pub mod recurrence;
pub mod reservation_state;
pub mod resource;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;
pub mod worktask;
