#![cfg_attr(feature = "docinclude", feature(external_doc))]
#![cfg_attr(feature = "docinclude", doc(include = "../README.md"))]

pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod replication;
pub mod storage;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::Consensus;
pub use crate::core::ConsensusBuilder;
pub use crate::core::FollowerState;
pub use crate::core::HeartbeatGuard;
pub use crate::error::ConfigError;
pub use crate::error::ReplicateError;
pub use crate::network::RaftNetwork;
pub use crate::raft::Consistency;
pub use crate::raft::ReplicateOutcome;
pub use crate::replication::ReplicateUnits;
pub use crate::replication::ReplicationRound;
pub use crate::replication::ResourceUnits;
pub use crate::storage::RaftLog;

/// A Raft node's ID.
pub type NodeId = u64;

/// The ID of a Raft group (one replicated log).
pub type GroupId = u64;

/// A per-follower monotonic request sequence number.
///
/// The consensus layer uses these to discard out-of-order replies. The value `0`
/// is reserved to mean "no request has been sent to this follower yet".
pub type FollowerReqSeq = u64;

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through replication. Instead, applications can present their
/// data models as-is; the replication pipeline shares one batch across all outbound requests
/// without copying the payload.
pub trait AppData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait for producing a compact, human readable summary of a message, for tracing fields.
pub trait MessageSummary {
    /// Build the summary string.
    fn summary(&self) -> String;
}
