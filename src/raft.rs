//! Public replication interface and data types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::AppData;
use crate::GroupId;
use crate::MessageSummary;
use crate::NodeId;

/// The identity of a raft log entry.
/// A term and an index identifies a log entry globally.
#[derive(Debug, Default, Clone, Copy, PartialOrd, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal log entry.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(_n) => "normal".to_string(),
        }
    }
}

/// A normal log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A shareable handle to one batch of log entries.
///
/// The entries are Arc'd so that the same batch may be dispatched to every follower
/// without duplicating the payload. Cloning the handle is cheap and safe across tasks;
/// the underlying entries are dropped when the last handle goes away.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryBatch<D: AppData> {
    #[serde(bound = "D: AppData")]
    entries: Arc<Vec<Entry<D>>>,
}

impl<D: AppData> EntryBatch<D> {
    /// Create a batch from a vector of entries.
    pub fn new(entries: Vec<Entry<D>>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    /// The entries carried by this batch.
    pub fn entries(&self) -> &[Entry<D>] {
        &self.entries
    }

    /// The number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the batch carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The log id of the last entry in the batch, if any.
    pub fn last_log_id(&self) -> Option<LogId> {
        self.entries.last().map(|e| e.log_id)
    }
}

impl<D: AppData> MessageSummary for EntryBatch<D> {
    fn summary(&self) -> String {
        match self.last_log_id() {
            Some(last) => format!("{} entries, last: {}", self.len(), last),
            None => "empty".to_string(),
        }
    }
}

/// The AppendEntries header describing where one replicated batch attaches to the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    /// The Raft group this batch belongs to.
    pub group: GroupId,
    /// The leader's term at the time the batch was accepted.
    pub term: u64,
    /// The index of the log entry immediately preceding the batch.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The leader's commit index at the time the batch was accepted.
    pub commit_index: u64,
}

impl MessageSummary for ProtocolMetadata {
    fn summary(&self) -> String {
        format!(
            "group={}, term={}, prev_log_index={}, prev_log_term={}, commit_index={}",
            self.group, self.term, self.prev_log_index, self.prev_log_term, self.commit_index
        )
    }
}

/// An RPC sent by the leader to replicate one batch of log entries (§5.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The sending leader's ID.
    pub from: NodeId,

    /// The target node's ID.
    pub to: NodeId,

    /// Where the batch attaches to the log.
    pub meta: ProtocolMetadata,

    /// The batch of entries to store.
    #[serde(bound = "D: AppData")]
    pub batch: EntryBatch<D>,

    /// Whether the receiver must flush the entries to durable storage before replying.
    pub flush_required: bool,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "from={}, to={}, {}, flush_required={}, batch: {}",
            self.from,
            self.to,
            self.meta.summary(),
            self.flush_required,
            self.batch.summary()
        )
    }
}

/// The result carried by an `AppendEntriesReply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyResult {
    /// The entries were accepted.
    Success,
    /// The receiver's log does not contain an entry matching `prev_log_index`/`prev_log_term`.
    LogMismatch,
    /// The receiver is not serving the group.
    GroupUnavailable,
    /// The receiver could not process the request in time.
    Timeout,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// The responding node's ID.
    pub node_id: NodeId,
    /// The node the reply is addressed to.
    pub target_node_id: NodeId,
    /// The Raft group.
    pub group: GroupId,
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// The last offset appended to the responder's log, flushed or not.
    pub last_dirty_log_index: u64,
    /// The last offset the responder has flushed to durable storage.
    pub last_flushed_log_index: u64,
    /// The outcome of the append.
    pub result: ReplyResult,
}

impl MessageSummary for AppendEntriesReply {
    fn summary(&self) -> String {
        format!(
            "node={}, target={}, group={}, term={}, last_dirty={}, last_flushed={}, result={:?}",
            self.node_id,
            self.target_node_id,
            self.group,
            self.term,
            self.last_dirty_log_index,
            self.last_flushed_log_index,
            self.result
        )
    }
}

/// The write consistency level requested for one replication round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// The round resolves once a majority of voters have flushed the batch.
    #[default]
    QuorumAck,
    /// The round resolves once the leader has appended the batch; followers
    /// acknowledge without flushing.
    LeaderAck,
}

impl Consistency {
    /// Whether this consistency level demands a durable flush.
    pub fn requires_flush(&self) -> bool {
        matches!(self, Consistency::QuorumAck)
    }
}

/// The value returned to the caller when a replication round succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateOutcome {
    /// The offset of the last entry written by the round.
    pub last_offset: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership configuration of the cluster.
///
/// This crate only reads the configuration: voters participate in quorum and receive
/// replicated appends; learners receive appends but never count towards a quorum.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// The voting members of the Raft cluster.
    pub voters: BTreeSet<NodeId>,
    /// The non-voting members, receiving replication but not counted in any quorum.
    pub learners: BTreeSet<NodeId>,
}

impl MembershipConfig {
    /// Create a new config with the given voter set and no learners.
    pub fn new(voters: BTreeSet<NodeId>) -> Self {
        Self {
            voters,
            learners: BTreeSet::new(),
        }
    }

    /// Get an iterator over all nodes in the current config.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.voters.clone();
        all.extend(&self.learners);
        all
    }

    /// Check if the given node is a voting member.
    pub fn is_voter(&self, x: &NodeId) -> bool {
        self.voters.contains(x)
    }

    /// Check if the given NodeId exists in this membership config.
    pub fn contains(&self, x: &NodeId) -> bool {
        self.voters.contains(x) || self.learners.contains(x)
    }

    /// The number of voters required for a majority.
    pub fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
