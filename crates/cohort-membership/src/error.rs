//! Error types for membership operations.

use std::io;

use crate::member::MemberStatus;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MembershipError>;

/// Errors that can occur while operating the membership protocol.
///
/// Partitions, duplicate administrative requests and conflicting gossip
/// are not errors: they surface as events or are resolved by the merge
/// rules. What remains are local failures the caller can act on.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// The cluster daemon has stopped; no further requests are accepted.
    #[error("cluster daemon is terminated")]
    Terminated,

    /// A member status change that the lifecycle does not allow.
    #[error("illegal member status transition from {from} to {to}")]
    IllegalTransition { from: MemberStatus, to: MemberStatus },

    /// Invalid configuration value or file.
    #[error("invalid membership configuration: {0}")]
    Config(String),

    /// A cluster message could not be encoded or decoded.
    #[error("cluster message codec error: {0}")]
    Codec(#[from] io::Error),

    /// The transport failed to bind or deliver.
    #[error("cluster transport error: {0}")]
    Transport(String),
}

impl MembershipError {
    /// Returns true if the error means the daemon is gone for good.
    pub fn is_terminated(&self) -> bool {
        matches!(self, MembershipError::Terminated)
    }

    /// Creates an illegal-transition error.
    pub fn illegal(from: MemberStatus, to: MemberStatus) -> Self {
        MembershipError::IllegalTransition { from, to }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MembershipError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MembershipError::Terminated
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MembershipError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MembershipError::Terminated
    }
}
