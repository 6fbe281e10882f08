//! Error types exposed by this crate.

use crate::NodeId;

/// A result type where the error variant is always a `ReplicateError`.
pub type ReplicateResult<T> = std::result::Result<T, ReplicateError>;

/// Error variants surfaced by a replication round.
///
/// Per-peer dispatch failures never propagate to the caller: they are converted into
/// synthetic error replies and routed back into the consensus layer, which owns the
/// fate of the follower (progress rollback, recovery). Only the leader's own append,
/// the leader's flush slot and the commit wait determine the caller's result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ReplicateError {
    /// The append to the leader's own log failed; nothing was replicated.
    #[error("appending entries to the leader log failed")]
    LeaderAppendFailed,

    /// The leader could not flush its log for a quorum-ack round.
    ///
    /// Treated like a failed remote reply for the leader's own peer slot.
    #[error("flushing the leader log failed")]
    LeaderFlushFailed,

    /// An AppendEntries RPC could not be issued, timed out, or failed in transport.
    #[error("dispatching an append entries request failed")]
    AppendEntriesDispatchError,

    /// A reply arrived from a different node than the request was sent to.
    #[error("reply target mismatch: expected {expected}, got {got}")]
    TargetNodeMismatch { expected: NodeId, got: NodeId },

    /// The commit wait observed that the entry's term at its offset no longer matches
    /// the term at which it was appended: a newer leader truncated it away.
    #[error("replicated entry has been truncated by a newer leader")]
    ReplicatedEntryTruncated,

    /// The commit-index watch was broken while waiting: the node is shutting down.
    #[error("replication aborted, node is shutting down")]
    ShuttingDown,
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The replicate append timeout must be non-zero.
    #[error("replicate_append_timeout must be greater than zero")]
    ReplicateAppendTimeoutTooSmall,

    /// A heartbeat interval at or above the replicate timeout starves liveness accounting.
    #[error("heartbeat_interval must be less than replicate_append_timeout")]
    HeartbeatIntervalNotLessThanReplicateTimeout,

    /// The given value for max_inflight_appends_per_follower is too small, must be > 0.
    #[error("the given value for max_inflight_appends_per_follower is too small, must be > 0")]
    MaxInflightAppendsTooSmall,
}
