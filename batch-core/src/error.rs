//! The closed error-kind set for the batch core (spec §7).
//!
//! Every reply the server sends carries one of these as a numeric code plus
//! a textual description, and — for attribute errors — the 1-based index of
//! the offending entry in the request's attribute list.

use thiserror::Error;

/// A closed set of error kinds. New variants are never added silently —
/// the wire reply's numeric code is derived from the discriminant, so
/// reordering would break compatibility.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("bad value for {attr}: {detail}")]
    BadValue { attr: String, detail: String },

    #[error("bad type for {attr}")]
    BadType { attr: String },

    #[error("bad time spec: {0}")]
    BadTimeSpec(String),

    #[error("bad rrule syntax: {0}")]
    BadRruleSyntax(String),

    #[error("bad rrule frequency ({freq}): duration {duration_s}s exceeds granularity")]
    BadRruleFrequency { freq: RruleFrequency, duration_s: u64 },

    #[error("aoe mismatch across chunks: {0}")]
    AoeChunkMismatch(String),

    #[error("attribute is read-only: {0}")]
    ReadOnly(String),

    #[error("entity is in a stale state: {0}")]
    StaleState(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("execution daemon reports checkpoint busy")]
    CheckpointBusy,

    #[error("system error: {0}")]
    System(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The seven frequencies distinguished by `BadRruleFrequency` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RruleFrequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl std::fmt::Display for RruleFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RruleFrequency::Secondly => "SECONDLY",
            RruleFrequency::Minutely => "MINUTELY",
            RruleFrequency::Hourly => "HOURLY",
            RruleFrequency::Daily => "DAILY",
            RruleFrequency::Weekly => "WEEKLY",
            RruleFrequency::Monthly => "MONTHLY",
            RruleFrequency::Yearly => "YEARLY",
        };
        write!(f, "{s}")
    }
}

impl BatchError {
    /// Numeric wire code. Stable across variants — callers match on this,
    /// not on `Debug` output.
    pub fn code(&self) -> u32 {
        match self {
            BatchError::PermissionDenied(_) => 1,
            BatchError::UnknownAttribute(_) => 2,
            BatchError::UnknownResource(_) => 3,
            BatchError::BadValue { .. } => 4,
            BatchError::BadType { .. } => 5,
            BatchError::BadTimeSpec(_) => 6,
            BatchError::BadRruleSyntax(_) => 7,
            BatchError::BadRruleFrequency { .. } => 8,
            BatchError::AoeChunkMismatch(_) => 9,
            BatchError::ReadOnly(_) => 10,
            BatchError::StaleState(_) => 11,
            BatchError::UnknownQueue(_) => 12,
            BatchError::UnknownJob(_) => 13,
            BatchError::CheckpointBusy => 14,
            BatchError::System(_) => 15,
            BatchError::Internal(_) => 16,
        }
    }
}

/// The result of an atomic attribute batch (spec §4.1): either every slot
/// was applied, or the whole batch was rolled back and the 1-based index
/// of the offending entry is reported alongside the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSetError {
    /// 1-based index of the triple that failed.
    pub index: usize,
    pub source: BatchError,
}

impl std::fmt::Display for BatchSetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry {}: {}", self.index, self.source)
    }
}

impl std::error::Error for BatchSetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
