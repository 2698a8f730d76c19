//! Error types for imgplane
//!
//! Every failure carries a condition kind (see [`Error::condition`]) that is
//! independent of the inputs, so callers and bindings can branch on it
//! without parsing messages.

use crate::types::PoolId;
use thiserror::Error;

/// Common result type for imgplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for imgplane
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // Absent entities. Usually an expected outcome, not a fault.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("no lock held on {0}")]
    LockNotFound(String),

    #[error("mirror peer not found: {0}")]
    PeerNotFound(String),

    #[error("pool not found: {0}")]
    PoolNotFound(PoolId),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Precondition violations. Returned to the caller, never retried.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("image has snapshots")]
    HasSnapshots,

    #[error("snapshot has clone children")]
    HasChildren,

    #[error("snapshot limit reached: {limit}")]
    SnapshotLimit { limit: u64 },

    #[error("read-only: {0}")]
    ReadOnly(String),

    #[error("client is blacklisted")]
    Blacklisted,

    // Conflicts where state changed between check and act
    #[error("lost race: {0}")]
    LostRace(String),

    #[error("lock owner changed: expected {expected}, found {actual}")]
    OwnerMismatch { expected: String, actual: String },

    // Store reachability
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    // Refresh failures surfaced through read-only projections
    #[error("stale handle: {0}")]
    StaleHandle(Box<Error>),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create a lost race error
    pub fn lost_race(msg: impl Into<String>) -> Self {
        Self::LostRace(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Wrap a refresh failure. Already-wrapped errors are not nested twice.
    #[must_use]
    pub fn stale(source: Self) -> Self {
        match source {
            Self::StaleHandle(_) => source,
            other => Self::StaleHandle(Box::new(other)),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ImageNotFound(_)
                | Self::SnapshotNotFound(_)
                | Self::LockNotFound(_)
                | Self::PeerNotFound(_)
                | Self::PoolNotFound(_)
                | Self::ObjectNotFound(_)
                | Self::NotFound(_)
        )
    }

    /// Check if the state changed between check and act
    #[must_use]
    pub const fn is_lost_race(&self) -> bool {
        matches!(self, Self::LostRace(_) | Self::OwnerMismatch { .. })
    }

    /// Input-independent condition kind for user-visible reporting
    #[must_use]
    pub fn condition(&self) -> &'static str {
        match self {
            Self::ImageNotFound(_)
            | Self::SnapshotNotFound(_)
            | Self::LockNotFound(_)
            | Self::PeerNotFound(_)
            | Self::PoolNotFound(_)
            | Self::ObjectNotFound(_)
            | Self::NotFound(_) => "not-found",
            Self::AlreadyExists(_) => "exists",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::NotSupported(_) => "not-supported",
            Self::Busy(_) => "busy",
            Self::HasSnapshots => "not-empty",
            Self::HasChildren => "has-children",
            Self::SnapshotLimit { .. } => "limit-exceeded",
            Self::ReadOnly(_) => "read-only",
            Self::Blacklisted => "blacklisted",
            Self::LostRace(_) => "lost-race",
            Self::OwnerMismatch { .. } => "owner-mismatch",
            Self::Transport(_) | Self::Timeout => "transport",
            Self::StaleHandle(_) => "stale-handle",
            Self::Internal(_) => "internal",
            Self::Configuration(_) => "configuration",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Underlying store diagnostic, when the failure came from the store
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Transport(msg) | Self::Internal(msg) | Self::Serialization(msg) => Some(msg),
            Self::StaleHandle(inner) => inner.diagnostic(),
            _ => None,
        }
    }
}

/// Abort the process after observing a broken state machine invariant
pub fn consistency_fault(what: &str) -> ! {
    tracing::error!("internal consistency fault: {what}");
    std::process::abort()
}
