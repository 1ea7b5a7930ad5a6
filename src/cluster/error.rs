//! Cluster error kinds and their propagation policy.

use thiserror::Error;

use super::key::NodeId;
use super::storage::StorageError;

/// Errors surfaced by channels, replicas and the reactor.
///
/// `Timeout`, `NotLeader`, `Stopped` and `QueueFull` are returned to callers
/// of the propose and step APIs, which are expected to retry or redirect.
/// Storage append failures never appear here: a partial append compromises
/// the log, so the process aborts instead of continuing with a divergent
/// replica.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterError {
    /// The channel was shut down while the caller was waiting.
    #[error("channel stopped")]
    Stopped,

    /// The reactor was shut down before or while the request was in flight.
    #[error("reactor stopped")]
    ReactorStopped,

    /// The channel is destroyed; no further operations will succeed.
    #[error("channel destroyed")]
    Destroyed,

    /// A wait exceeded its deadline. The registered waiter stays behind and
    /// a later commit signal to it is a no-op.
    #[error("wait timed out")]
    Timeout,

    /// Proposals are accepted only on the leader.
    #[error("not the leader (current leader {leader_id})")]
    NotLeader { leader_id: NodeId },

    /// The bounded inbound message queue is at capacity.
    #[error("inbound message queue full")]
    QueueFull,

    /// A non-fatal storage read or metadata operation failed.
    #[error("storage failure: {reason}")]
    StorageFailure { reason: String },

    /// The message was malformed or arrived in a state that cannot accept
    /// it. Dropped and logged, never fatal.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArg { reason: String },
}

impl ClusterError {
    /// Whether retrying the same call, unchanged, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Timeout | ClusterError::QueueFull)
    }

    pub(crate) fn invalid_message(reason: impl Into<String>) -> Self {
        ClusterError::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_arg(reason: impl Into<String>) -> Self {
        ClusterError::InvalidArg {
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for ClusterError {
    fn from(err: StorageError) -> Self {
        ClusterError::StorageFailure {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_policy() {
        assert!(ClusterError::Timeout.is_retryable());
        assert!(ClusterError::QueueFull.is_retryable());
        assert!(!ClusterError::NotLeader { leader_id: 2 }.is_retryable());
        assert!(!ClusterError::Destroyed.is_retryable());
    }
}
