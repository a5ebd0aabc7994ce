//! Shared value types for the attribute/resource model (spec §3, §4.1).

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// The type tag carried by every attribute and resource (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Long,
    Boolean,
    Char,
    Size,
    Duration,
    Time,
    Str,
    StrArray,
    ResourceList,
    EntitySet,
    Float,
    Array,
}

bitflags! {
    /// Per-attribute state flags (spec §3: set, modified, default, hook-origin,
    /// modify-cache).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AttrFlags: u16 {
        /// Payload is semantically present.
        const SET          = 0b0000_0001;
        /// Effective value differs from the last-saved value.
        const MODIFIED     = 0b0000_0010;
        /// Value came from a default, not an explicit set.
        const DEFAULT      = 0b0000_0100;
        /// Set was performed by a hook, which bypasses normal privilege checks.
        const HOOK_ORIGIN  = 0b0000_1000;
        /// Internal: a nested resource's modify bit needs clearing on next touch.
        const MODIFY_CACHE = 0b0001_0000;
    }
}

bitflags! {
    /// Access-control mask on an `AttributeDef` (spec §6 flag vocabulary).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AccessFlags: u16 {
        const USER_RD   = 0b0000_0000_0001;
        const USER_WR   = 0b0000_0000_0010;
        const OPER_RD   = 0b0000_0000_0100;
        const OPER_WR   = 0b0000_0000_1000;
        const MGR_RD    = 0b0000_0001_0000;
        const MGR_WR    = 0b0000_0010_0000;
        const DAEMON_WR = 0b0000_0100_0000;
        const NO_SAVE   = 0b0000_1000_0000;
        const HIDDEN    = 0b0001_0000_0000;

        const READONLY_MGR = Self::USER_RD.bits() | Self::OPER_RD.bits() | Self::MGR_RD.bits();
        const READWRITE_MGR = Self::READONLY_MGR.bits() | Self::MGR_WR.bits();
        const READWRITE_ALL = Self::READWRITE_MGR.bits() | Self::OPER_WR.bits() | Self::USER_WR.bits();
    }
}

bitflags! {
    /// Shutdown type mask (spec §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownTypeMask: u8 {
        const IMMEDIATE = 1;
        const DELAYED   = 2;
        const QUICK     = 4;
        const SIGNAL    = 8;
    }
}

bitflags! {
    /// Shutdown target mask (spec §6, supplemented from `req_shutdown.c`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownTargetMask: u8 {
        const PRIMARY        = 1;
        const SECONDARY      = 2;
        const IDLE_SECONDARY = 4;
        const SCHEDULER      = 8;
    }
}

bitflags! {
    /// QuickSave header flags (spec §3: HASRUN, HOTSTART, CHKPT, HASHOLD, ChkptMig).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QsFlags: u16 {
        const HASRUN   = 0b0_0001;
        const HOTSTART = 0b0_0010;
        const CHKPT    = 0b0_0100;
        const HASHOLD  = 0b0_1000;
        const CHKPTMIG = 0b1_0000;
    }
}

/// The six entity kinds of spec §3's Entity Model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Server,
    Scheduler,
    Queue,
    Node,
    Job,
    Reservation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Server => "server",
            EntityKind::Scheduler => "scheduler",
            EntityKind::Queue => "queue",
            EntityKind::Node => "node",
            EntityKind::Job => "job",
            EntityKind::Reservation => "reservation",
        };
        write!(f, "{s}")
    }
}

/// The caller's privilege level for an attribute batch or request (spec §9:
/// "privilege must be an explicit parameter", not thread-local state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    User,
    Operator,
    Manager,
    Daemon,
}

/// Where a mutation originated — plain privilege, or a hook, which escalates
/// to full read/write regardless of `Privilege` (`attr_atomic.c`, carried
/// into `SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Caller(Privilege),
    Hook,
}

/// `set()` operator semantics (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Incr,
    Decr,
}

/// Mode passed to an attribute/resource action after a successful set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMode {
    New,
    Alter,
    Recov,
    Free,
}

/// A decoded resource value nested inside a `ResourceList` attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceValue {
    pub rtype: AttrType,
    pub payload: Payload,
}

/// The union of possible decoded payloads. `Size`/`Duration` are both
/// stored as their base unit (kilobytes, seconds) per spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Long(i64),
    Boolean(bool),
    Char(char),
    SizeKb(u64),
    DurationSecs(u64),
    TimeEpoch(i64),
    Str(String),
    StrArray(Vec<String>),
    ResourceList(BTreeMap<String, ResourceValue>),
    EntitySet(Vec<String>),
    Float(f64),
    Array(Vec<Payload>),
}

impl Payload {
    pub fn attr_type(&self) -> AttrType {
        match self {
            Payload::Long(_) => AttrType::Long,
            Payload::Boolean(_) => AttrType::Boolean,
            Payload::Char(_) => AttrType::Char,
            Payload::SizeKb(_) => AttrType::Size,
            Payload::DurationSecs(_) => AttrType::Duration,
            Payload::TimeEpoch(_) => AttrType::Time,
            Payload::Str(_) => AttrType::Str,
            Payload::StrArray(_) => AttrType::StrArray,
            Payload::ResourceList(_) => AttrType::ResourceList,
            Payload::EntitySet(_) => AttrType::EntitySet,
            Payload::Float(_) => AttrType::Float,
            Payload::Array(_) => AttrType::Array,
        }
    }
}

/// A single attribute slot: flags plus an optional payload. Per spec §3's
/// invariant, `flags.contains(SET)` must agree with `payload.is_some()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub flags: AttrFlags,
    pub payload: Option<Payload>,
}

impl Attribute {
    pub fn unset() -> Self {
        Attribute {
            flags: AttrFlags::empty(),
            payload: None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.flags.contains(AttrFlags::SET) && self.payload.is_some()
    }

    /// Release the payload, clear `SET`, leave the rest zeroed (spec §4.1 `free`).
    pub fn free(&mut self) {
        self.flags = AttrFlags::empty();
        self.payload = None;
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrType::Long => "long",
            AttrType::Boolean => "boolean",
            AttrType::Char => "char",
            AttrType::Size => "size",
            AttrType::Duration => "duration",
            AttrType::Time => "time",
            AttrType::Str => "string",
            AttrType::StrArray => "string_array",
            AttrType::ResourceList => "resource_list",
            AttrType::EntitySet => "entity_set",
            AttrType::Float => "float",
            AttrType::Array => "array",
        };
        write!(f, "{s}")
    }
}

/// A stable, compile-time-known slot index into an entity kind's attribute
/// vector (spec §9: "a sealed trait/interface ... plus a small registry
/// indexed by entity-kind and attribute id"). Shared across entity kinds —
/// a catalog only defines the slots a given `EntityKind` actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrId(pub u16);

/// Job states (spec §4.4): Transit, Queued, Held, Waiting, Running, Exiting,
/// Expired, Finished, Moved, Begun, Suspended, User-suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Transit,
    Queued,
    Held,
    Waiting,
    Running,
    Exiting,
    Expired,
    Finished,
    Moved,
    Begun,
    Suspended,
    UserSuspended,
}

impl JobState {
    /// The single-letter code used in quick-save headers and wire replies.
    pub fn letter(self) -> char {
        match self {
            JobState::Transit => 'T',
            JobState::Queued => 'Q',
            JobState::Held => 'H',
            JobState::Waiting => 'W',
            JobState::Running => 'R',
            JobState::Exiting => 'E',
            JobState::Expired => 'X',
            JobState::Finished => 'F',
            JobState::Moved => 'M',
            JobState::Begun => 'B',
            JobState::Suspended => 'S',
            JobState::UserSuspended => 'U',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        Some(match c {
            'T' => JobState::Transit,
            'Q' => JobState::Queued,
            'H' => JobState::Held,
            'W' => JobState::Waiting,
            'R' => JobState::Running,
            'E' => JobState::Exiting,
            'X' => JobState::Expired,
            'F' => JobState::Finished,
            'M' => JobState::Moved,
            'B' => JobState::Begun,
            'S' => JobState::Suspended,
            'U' => JobState::UserSuspended,
            _ => return None,
        })
    }

    /// True once the job no longer participates in scheduling or running.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Moved | JobState::Expired)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Substates refining a `JobState` (spec §4.4). Not exhaustive of every
/// OpenPBS numeric substate, but covers every substate a guard in this
/// core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobSubstate {
    TransIn,
    Queued,
    Held,
    WaitingTime,
    Starting,
    Running,
    Suspended,
    UserSuspended,
    Provisioning,
    PreRun,
    Exiting,
    ExitingEpilogue,
    Returned,
    Finished,
    Moved,
    Begun,
    RerunQueued,
    Aborted,
}

/// Reservation states (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Unconfirmed,
    Confirmed,
    Waiting,
    TimeToRun,
    Running,
    Finished,
    BeingDeleted,
    Degraded,
}

impl ReservationState {
    pub fn letter(self) -> char {
        match self {
            ReservationState::Unconfirmed => 'U',
            ReservationState::Confirmed => 'C',
            ReservationState::Waiting => 'W',
            ReservationState::TimeToRun => 'T',
            ReservationState::Running => 'R',
            ReservationState::Finished => 'F',
            ReservationState::BeingDeleted => 'D',
            ReservationState::Degraded => 'G',
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// The quick-save header every entity carries (spec §3): identity, integral
/// state/substate, and crash-safe bit-flags. Persisted even when no
/// attribute has changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickSave {
    pub identity: String,
    pub state: u8,
    pub substate: u16,
    pub flags: QsFlags,
}

impl QuickSave {
    pub fn new(identity: impl Into<String>) -> Self {
        QuickSave {
            identity: identity.into(),
            state: 0,
            substate: 0,
            flags: QsFlags::empty(),
        }
    }
}

/// A single entity record (spec §3): quick-save header plus a fixed vector
/// of attribute slots, indexed by `AttrId` via the entity kind's
/// `AttrCatalog` (see `entity.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub qs: QuickSave,
    pub attrs: Vec<Attribute>,
    /// True until first persisted; determines insert-vs-update at save time.
    pub new_object: bool,
    pub links: EntityLinks,
}

/// Cross-entity, non-owning back-references (spec §9: "owning containers...
/// non-owning back-references; all lookups go through the server context").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityLinks {
    /// Job: the queue it currently sits in.
    pub queue: Option<String>,
    /// Job: the reservation it was submitted into, if any.
    pub reservation: Option<String>,
    /// Queue/Reservation: the job ids it owns.
    pub jobs: Vec<String>,
}

/// Save-type bitset driving the persistence bridge (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFlags(pub u8);

impl SaveFlags {
    pub const NEW: u8 = 0b001;
    pub const QS: u8 = 0b010;
    pub const ATTRS: u8 = 0b100;

    pub fn new() -> Self {
        SaveFlags(0)
    }
    pub fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }
    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

impl Default for SaveFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// A named `(name, resource?, op, text value)` triple from a decoded batch
/// request (spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct AttrTriple {
    pub name: String,
    pub resource: Option<String>,
    pub op: Op,
    pub value: String,
}

/// Policy for an unrecognised attribute name during batch decode (spec §4.1
/// step 1: "error, are ignored, or routed to a catch-all resource slot").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownAttrPolicy {
    Reject,
    Ignore,
    CatchAll(AttrId),
}

fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time in epoch seconds — the server's single notion of
/// "now" for work-task scheduling and attribute defaults.
pub fn now_s() -> i64 {
    now_epoch()
}
