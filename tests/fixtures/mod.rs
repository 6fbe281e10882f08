//! Fixtures for testing the replication pipeline.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use raft_replication::async_trait::async_trait;
use raft_replication::network::RpcOptions;
use raft_replication::raft::{
    AppendEntriesReply, AppendEntriesRequest, Entry, EntryBatch, EntryNormal, EntryPayload, LogId, MembershipConfig,
    ReplyResult,
};
use raft_replication::storage::LogAppendResult;
use raft_replication::{AppData, Config, Consensus, ConsensusBuilder, NodeId, RaftLog, RaftNetwork};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;

/// The node id of the leader in every test cluster.
pub const LEADER: NodeId = 0;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let _ = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer)
        .try_init();
}

/// The application data type the test log works with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TestPayload {
    /// A simple string payload.
    pub data: String,
    /// An optional token for observing when all copies of an entry are dropped.
    #[serde(skip)]
    pub token: Option<Arc<()>>,
}

impl AppData for TestPayload {}

/// Build a batch of normal entries covering the given inclusive offset range.
pub fn batch(term: u64, offsets: std::ops::RangeInclusive<u64>) -> EntryBatch<TestPayload> {
    batch_with_token(term, offsets, None)
}

/// Like [`batch`], but embeds `token` into the first entry's payload.
pub fn batch_with_token(
    term: u64,
    offsets: std::ops::RangeInclusive<u64>,
    token: Option<Arc<()>>,
) -> EntryBatch<TestPayload> {
    let mut token = token;
    let entries = offsets
        .map(|index| Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Normal(EntryNormal {
                data: TestPayload {
                    data: format!("entry-{}", index),
                    token: token.take(),
                },
            }),
        })
        .collect();
    EntryBatch::new(entries)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory log for testing the leader's storage seam.
#[derive(Default)]
pub struct MemLog {
    inner: Mutex<MemLogInner>,
}

#[derive(Default)]
struct MemLogInner {
    log: BTreeMap<u64, Entry<TestPayload>>,
    flushed: u64,
    fail_append: bool,
    fail_flush: bool,
}

impl MemLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent append fail.
    pub fn set_fail_append(&self, fail: bool) {
        self.inner.lock().unwrap().fail_append = fail;
    }

    /// Make every subsequent flush fail.
    pub fn set_fail_flush(&self, fail: bool) {
        self.inner.lock().unwrap().fail_flush = fail;
    }

    /// The last offset flushed to "durable" storage.
    pub fn flushed_offset(&self) -> u64 {
        self.inner.lock().unwrap().flushed
    }

    /// The last offset present in the log.
    pub fn last_offset(&self) -> u64 {
        self.inner.lock().unwrap().log.keys().next_back().copied().unwrap_or(0)
    }

    /// Overwrite the terms of all entries at and above `offset`, simulating the
    /// truncate-and-rewrite a newer leader performs.
    pub fn rewrite_terms_from(&self, offset: u64, term: u64) {
        let mut inner = self.inner.lock().unwrap();
        for (index, entry) in inner.log.range_mut(offset..) {
            entry.log_id = LogId { term, index: *index };
        }
    }
}

#[async_trait]
impl RaftLog<TestPayload> for MemLog {
    async fn append(&self, batch: EntryBatch<TestPayload>) -> Result<LogAppendResult> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_append {
            return Err(anyhow!("simulated append failure"));
        }
        let first = batch.entries().first().ok_or_else(|| anyhow!("empty batch"))?.log_id;
        let last = batch.last_log_id().expect("non-empty batch has a last entry");
        for entry in batch.entries() {
            inner.log.insert(entry.log_id.index, entry.clone());
        }
        Ok(LogAppendResult {
            base_offset: first.index,
            last_offset: last.index,
            last_term: last.term,
        })
    }

    async fn flush(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_flush {
            return Err(anyhow!("simulated flush failure"));
        }
        inner.flushed = inner.log.keys().next_back().copied().unwrap_or(inner.flushed);
        Ok(inner.flushed)
    }

    fn term_of(&self, offset: u64) -> Option<u64> {
        self.inner.lock().unwrap().log.get(&offset).map(|e| e.log_id.term)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// How the mock network answers requests for one peer.
#[derive(Debug, Clone)]
pub enum PeerBehavior {
    /// Acknowledge the append, reporting the batch's last offset as dirty (and as
    /// flushed, when a flush was requested).
    Ack,
    /// Acknowledge after a delay.
    AckAfter(Duration),
    /// Fail the call at the transport level.
    Error,
    /// Reject the append with the given result, reporting the peer's log end at the
    /// request's prev_log_index.
    Reject(ReplyResult),
    /// Answer successfully, but as a different node than the one addressed.
    WrongTarget(NodeId),
    /// Never answer; the caller's timeout decides.
    Hang,
}

/// A record of one request the mock network has seen.
///
/// Only cheap metadata is captured; holding a batch handle here would keep the round's
/// payload alive and defeat the release assertions.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub target: NodeId,
    pub prev_log_index: u64,
    pub last_offset: Option<u64>,
    pub flush_required: bool,
    pub entries: usize,
}

/// A type which emulates the replication transport.
#[derive(Default)]
pub struct MockNetwork {
    behaviors: Mutex<HashMap<NodeId, PeerBehavior>>,
    sent: Mutex<Vec<SentRequest>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set how requests to `target` are answered. The default is [`PeerBehavior::Ack`].
    pub fn set_behavior(&self, target: NodeId, behavior: PeerBehavior) {
        self.behaviors.lock().unwrap().insert(target, behavior);
    }

    /// All requests seen so far.
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// The number of requests sent to `target`.
    pub fn sent_to(&self, target: NodeId) -> usize {
        self.sent.lock().unwrap().iter().filter(|r| r.target == target).count()
    }

    /// The total number of requests seen.
    pub fn total_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn behavior_for(&self, target: NodeId) -> PeerBehavior {
        self.behaviors.lock().unwrap().get(&target).cloned().unwrap_or(PeerBehavior::Ack)
    }

    fn ack(rpc: &AppendEntriesRequest<TestPayload>, responder: NodeId) -> AppendEntriesReply {
        let last_dirty = rpc.batch.last_log_id().map(|l| l.index).unwrap_or(rpc.meta.prev_log_index);
        AppendEntriesReply {
            node_id: responder,
            target_node_id: rpc.to,
            group: rpc.meta.group,
            term: rpc.meta.term,
            last_dirty_log_index: last_dirty,
            last_flushed_log_index: if rpc.flush_required { last_dirty } else { 0 },
            result: ReplyResult::Success,
        }
    }
}

#[async_trait]
impl RaftNetwork<TestPayload> for MockNetwork {
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<TestPayload>,
        _opts: RpcOptions,
    ) -> Result<AppendEntriesReply> {
        self.sent.lock().unwrap().push(SentRequest {
            target,
            prev_log_index: rpc.meta.prev_log_index,
            last_offset: rpc.batch.last_log_id().map(|l| l.index),
            flush_required: rpc.flush_required,
            entries: rpc.batch.len(),
        });

        match self.behavior_for(target) {
            PeerBehavior::Ack => Ok(Self::ack(&rpc, target)),
            PeerBehavior::AckAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Self::ack(&rpc, target))
            }
            PeerBehavior::Error => Err(anyhow!("connection refused")),
            PeerBehavior::Reject(result) => Ok(AppendEntriesReply {
                node_id: target,
                target_node_id: rpc.to,
                group: rpc.meta.group,
                term: rpc.meta.term,
                last_dirty_log_index: rpc.meta.prev_log_index,
                last_flushed_log_index: rpc.meta.prev_log_index,
                result,
            }),
            PeerBehavior::WrongTarget(other) => {
                let mut reply = Self::ack(&rpc, other);
                reply.target_node_id = other;
                Ok(reply)
            }
            PeerBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("unreachable"))
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A leader plus its mock collaborators.
pub struct TestCluster {
    pub config: Arc<Config>,
    pub log: Arc<MemLog>,
    pub network: Arc<MockNetwork>,
    pub consensus: Arc<Consensus<TestPayload, MockNetwork, MemLog>>,
}

/// A config with short timeouts suitable for tests.
pub fn test_config() -> Config {
    Config::build("test".into())
        .replicate_append_timeout(100)
        .heartbeat_interval(10)
        .validate()
        .expect("failed to build replication config")
}

/// Build a single-group leader with node 0 leading the given voter set.
pub fn test_cluster(voters: &[NodeId], term: u64, last_log: LogId) -> TestCluster {
    test_cluster_with_config(voters, term, last_log, test_config())
}

/// Like [`test_cluster`], with a caller-supplied config.
pub fn test_cluster_with_config(voters: &[NodeId], term: u64, last_log: LogId, config: Config) -> TestCluster {
    let config = Arc::new(config);
    let log = MemLog::new();
    let network = MockNetwork::new();
    let membership = MembershipConfig::new(voters.iter().copied().collect::<BTreeSet<_>>());

    let consensus = ConsensusBuilder::new(LEADER, 1, config.clone(), network.clone(), log.clone())
        .membership(membership)
        .current_term(term)
        .last_log(last_log)
        .build();

    TestCluster {
        config,
        log,
        network,
        consensus,
    }
}
