//! The leader-side consensus state the replication pipeline operates on.
//!
//! `Consensus` is not a full Raft node: elections, recovery and the follower role live
//! in the embedding application. What lives here is everything a replication round
//! reads and writes while driving one batch: the leader's log position, the commit
//! index watch, the follower stats table, heartbeat suppression, reply routing and
//! quorum accounting.

mod follower_stats;
mod quorum;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use tokio::sync::watch;
use tokio::sync::Semaphore;

pub use follower_stats::FollowerState;
pub use follower_stats::HeartbeatGuard;
pub(crate) use follower_stats::FollowerStats;

use crate::config::Config;
use crate::core::quorum::quorum_offset;
use crate::error::{ReplicateError, ReplicateResult};
use crate::metrics::Probe;
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, Consistency, EntryBatch, LogId, MembershipConfig, ProtocolMetadata,
    ReplicateOutcome, ReplyResult,
};
use crate::replication::{ReplicateUnits, ReplicationRound};
use crate::storage::LogAppendResult;
use crate::{AppData, FollowerReqSeq, GroupId, MessageSummary, NodeId, RaftLog, RaftNetwork};

/// Leader state mutated as rounds and replies progress.
///
/// Everything in here is read and written under short, non-awaiting critical sections.
#[derive(Debug)]
struct LeaderState {
    term: u64,
    membership: MembershipConfig,
    last_log_index: u64,
    last_log_term: u64,
    /// The last offset the leader's own log has flushed to durable storage.
    self_flushed_log_index: u64,
    /// The last offset written by a quorum-ack round.
    last_quorum_replicated_index: u64,
    /// The upper bound of offsets visible to relaxed-consistency readers.
    visibility_upper_bound_index: u64,
    /// The quorum value of dirty offsets across voters; drives relaxed-consistency visibility.
    majority_replicated_index: u64,
    last_write_consistency_level: Consistency,
}

/// The shared leader state one replication round at a time operates on.
///
/// The embedding application constructs one `Consensus` per group it leads (via
/// [`ConsensusBuilder`]) and calls [`Consensus::replicate`] for every accepted batch.
/// The pipeline pieces are also available individually through [`ReplicationRound`]
/// for callers that need to interleave the acknowledgement and commit-wait futures
/// themselves.
pub struct Consensus<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    id: NodeId,
    group: GroupId,
    config: Arc<Config>,
    network: Arc<N>,
    log: Arc<S>,

    state: RwLock<LeaderState>,

    /// The commit index, published through a watch channel so rounds can wait on it.
    ///
    /// Dropping the sender "breaks" the channel: every waiter resolves to
    /// `ShuttingDown`. The receiver half stays alive for reads.
    commit_index_tx: Mutex<Option<watch::Sender<u64>>>,
    commit_index_rx: watch::Receiver<u64>,

    /// One replication round at a time may hold this lock's permit; the round returns
    /// it at the dispatch barrier, once every RPC of the round has been issued.
    op_lock: Arc<Semaphore>,

    fstats: FollowerStats,
    probe: Probe,

    marker_d: PhantomData<D>,
}

impl<D, N, S> Consensus<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    /// This node's ID.
    pub fn self_node_id(&self) -> NodeId {
        self.id
    }

    /// The Raft group this consensus instance leads.
    pub fn group_id(&self) -> GroupId {
        self.group
    }

    /// A human readable identity for diagnostics.
    pub fn ident(&self) -> String {
        format!("{}/{}", self.config.cluster_name, self.group)
    }

    /// The current term.
    pub fn current_term(&self) -> u64 {
        self.state.read().unwrap().term
    }

    /// The highest offset known to be committed cluster-wide.
    pub fn committed_offset(&self) -> u64 {
        *self.commit_index_rx.borrow()
    }

    /// The current membership configuration.
    pub fn membership(&self) -> MembershipConfig {
        self.state.read().unwrap().membership.clone()
    }

    /// The runtime configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The replication probe counters.
    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    /// The upper bound of offsets visible to relaxed-consistency readers.
    pub fn visibility_upper_bound_index(&self) -> u64 {
        self.state.read().unwrap().visibility_upper_bound_index
    }

    /// The quorum value of dirty offsets across voters.
    pub fn majority_replicated_index(&self) -> u64 {
        self.state.read().unwrap().majority_replicated_index
    }

    /// The consistency level of the most recently accepted write.
    pub fn last_write_consistency_level(&self) -> Consistency {
        self.state.read().unwrap().last_write_consistency_level
    }

    /// A point-in-time copy of one follower's bookkeeping, if the node is known.
    pub fn follower_state(&self, id: &NodeId) -> Option<FollowerState> {
        self.fstats.get(id)
    }

    /// The id of the last entry in the leader's log.
    pub fn last_log_id(&self) -> LogId {
        let st = self.state.read().unwrap();
        LogId {
            term: st.last_log_term,
            index: st.last_log_index,
        }
    }

    /// Build the AppendEntries header for a batch accepted right now.
    pub fn protocol_metadata(&self) -> ProtocolMetadata {
        let st = self.state.read().unwrap();
        ProtocolMetadata {
            group: self.group,
            term: st.term,
            prev_log_index: st.last_log_index,
            prev_log_term: st.last_log_term,
            commit_index: self.committed_offset(),
        }
    }

    /// Allocate the next request sequence for every non-self voter.
    ///
    /// The resulting map is what a [`ReplicationRound`] needs to route replies; every
    /// round must use freshly allocated sequences.
    pub fn next_follower_request_sequences(&self) -> HashMap<NodeId, FollowerReqSeq> {
        let voters = {
            let st = self.state.read().unwrap();
            st.membership.voters.clone()
        };
        self.fstats.next_request_sequences(voters.iter().filter(|v| **v != self.id))
    }

    /// Record a heartbeat reply from the peer, refreshing its liveness accounting.
    ///
    /// Heartbeat scheduling lives outside this crate; this is the hook its reply path
    /// feeds, and it is what keeps a healthy follower eligible for direct appends.
    pub fn note_heartbeat_reply(&self, id: &NodeId) {
        self.fstats.update(id, |f| {
            f.last_received_reply_timestamp = tokio::time::Instant::now();
        });
    }

    pub(crate) fn log(&self) -> &Arc<S> {
        &self.log
    }

    pub(crate) fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub(crate) fn fstats(&self) -> &FollowerStats {
        &self.fstats
    }

    pub(crate) fn commit_index_rx(&self) -> watch::Receiver<u64> {
        self.commit_index_rx.clone()
    }

    pub(crate) fn last_quorum_replicated_index(&self) -> u64 {
        self.state.read().unwrap().last_quorum_replicated_index
    }

    pub(crate) fn set_last_write_consistency_level(&self, level: Consistency) {
        self.state.write().unwrap().last_write_consistency_level = level;
    }

    /// Raise the relaxed-consistency visibility bound to at least `offset`.
    pub(crate) fn raise_visibility_upper_bound(&self, offset: u64) {
        let mut st = self.state.write().unwrap();
        st.visibility_upper_bound_index = st.visibility_upper_bound_index.max(offset);
    }

    /// Install a heartbeat-suppression guard for the given peer.
    pub fn suppress_heartbeats(&self, id: &NodeId) -> HeartbeatGuard {
        self.fstats.suppress_heartbeats(id)
    }

    pub(crate) fn update_node_append_timestamp(&self, id: &NodeId) {
        self.fstats.update_node_append_timestamp(id);
    }

    /// Append a batch to the leader's own log, tracking the new log end.
    ///
    /// `update_last_quorum_index` is set for quorum-ack rounds: the appended range
    /// becomes part of the offsets a quorum must durably hold before relaxed reads
    /// may advance past them.
    pub(crate) async fn disk_append(
        &self,
        batch: EntryBatch<D>,
        update_last_quorum_index: bool,
    ) -> anyhow::Result<LogAppendResult> {
        let res = self.log.append(batch).await?;
        let mut st = self.state.write().unwrap();
        st.last_log_index = res.last_offset;
        st.last_log_term = res.last_term;
        if update_last_quorum_index {
            st.last_quorum_replicated_index = st.last_quorum_replicated_index.max(res.last_offset);
        }
        Ok(res)
    }

    /// Flush the leader's own log, recording the flushed offset.
    pub(crate) async fn flush_log(&self) -> anyhow::Result<()> {
        let flushed = self.log.flush().await?;
        let mut st = self.state.write().unwrap();
        st.self_flushed_log_index = st.self_flushed_log_index.max(flushed);
        Ok(())
    }

    /// Return the reply unchanged, or a target-mismatch error if it was answered by a
    /// different node than the request was sent to.
    pub(crate) fn validate_reply_target_node(
        &self,
        tag: &str,
        reply: ReplicateResult<AppendEntriesReply>,
        expected: NodeId,
    ) -> ReplicateResult<AppendEntriesReply> {
        match reply {
            Ok(r) if r.target_node_id != expected => {
                tracing::error!(
                    tag,
                    expected,
                    got = r.target_node_id,
                    "reply target node does not match the request target"
                );
                Err(ReplicateError::TargetNodeMismatch {
                    expected,
                    got: r.target_node_id,
                })
            }
            other => other,
        }
    }

    /// Route one peer's outcome for a round into follower bookkeeping.
    ///
    /// `seq` orders replies per follower; replies older than one already processed are
    /// dropped. `dirty_offset` is the log end the round produced, carried for tracing.
    #[tracing::instrument(level = "trace", skip(self, reply))]
    pub(crate) fn process_append_entries_reply(
        &self,
        node: NodeId,
        reply: ReplicateResult<AppendEntriesReply>,
        seq: FollowerReqSeq,
        dirty_offset: u64,
    ) {
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(error=%err, node, dirty_offset, "append entries to peer failed");
                // Stale failures are discarded like stale replies; a newer round may
                // already have re-established the follower's position.
                if node != self.id && self.fstats.observe_dispatch_failure(&node, seq) {
                    self.fstats.clear_expected_log_end(&node);
                }
                return;
            }
        };

        tracing::trace!(node, reply=%reply.summary(), "processing append entries reply");

        if reply.term > self.current_term() {
            self.install_term(reply.term);
        }

        if node == self.id {
            // The leader's own slot: the synthesized flush reply.
            {
                let mut st = self.state.write().unwrap();
                st.self_flushed_log_index = st.self_flushed_log_index.max(reply.last_flushed_log_index);
            }
            self.maybe_advance_commit_index();
            self.maybe_update_majority_replicated_index();
            return;
        }

        if !self.fstats.observe_reply(&node, seq) {
            tracing::trace!(node, seq, "dropping out-of-order append entries reply");
            return;
        }

        match reply.result {
            ReplyResult::Success => {
                self.fstats.record_success(&node, reply.last_dirty_log_index, reply.last_flushed_log_index);
                self.maybe_advance_commit_index();
                self.maybe_update_majority_replicated_index();
            }
            other => {
                tracing::debug!(node, result = ?other, "append entries rejected by peer");
                self.fstats.clear_expected_log_end(&node);
            }
        }
    }

    /// Advance the commit index to the quorum value of flushed offsets, if it moved.
    ///
    /// Only entries of the current term may commit by counting replicas (§5.4.2);
    /// older-term entries commit transitively once a current-term entry does.
    fn maybe_advance_commit_index(&self) {
        let candidate = {
            let st = self.state.read().unwrap();
            let mut flushed: Vec<u64> = self
                .fstats
                .flushed_offsets(st.membership.voters.iter().filter(|v| **v != self.id));
            if st.membership.is_voter(&self.id) {
                flushed.push(st.self_flushed_log_index);
            }
            match quorum_offset(&flushed, st.membership.majority()) {
                Some(c) => c,
                None => return,
            }
        };

        if candidate <= self.committed_offset() {
            return;
        }
        if self.log.term_of(candidate) != Some(self.current_term()) {
            return;
        }

        tracing::trace!(candidate, "advancing commit index");
        self.update_committed_offset(candidate);
    }

    /// Re-evaluate the quorum value of dirty offsets across voters.
    ///
    /// This value bounds what relaxed-consistency (leader-ack) readers may observe.
    pub(crate) fn maybe_update_majority_replicated_index(&self) {
        let mut st = self.state.write().unwrap();
        let mut dirty: Vec<u64> = self
            .fstats
            .dirty_offsets(st.membership.voters.iter().filter(|v| **v != self.id));
        if st.membership.is_voter(&self.id) {
            dirty.push(st.last_log_index);
        }
        if let Some(q) = quorum_offset(&dirty, st.membership.majority()) {
            st.majority_replicated_index = st.majority_replicated_index.max(q);
        }
    }

    /// Adopt a newer term observed from a peer.
    ///
    /// The leadership transition itself is the embedding application's concern; this
    /// only records the term so in-flight commit waits can detect truncation.
    pub fn install_term(&self, term: u64) {
        let mut st = self.state.write().unwrap();
        if term > st.term {
            tracing::info!(observed = term, current = st.term, "observed a newer term");
            st.term = term;
        }
    }

    /// Adopt a commit index learned outside the reply path and wake commit waiters.
    pub fn update_committed_offset(&self, offset: u64) {
        let tx = self.commit_index_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            tx.send_if_modified(|cur| {
                if offset > *cur {
                    *cur = offset;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Break the commit-index watch and close the replication lock.
    ///
    /// In-flight dispatches complete normally; commit waiters resolve with
    /// `ShuttingDown`, and no new round can start.
    pub fn shutdown(&self) {
        tracing::info!(ident = %self.ident(), "shutting down replication");
        self.op_lock.close();
        self.commit_index_tx.lock().unwrap().take();
    }

    /// Replicate one batch and wait for the requested consistency level.
    ///
    /// This is the full pipeline: acquire the replication lock, build the protocol
    /// metadata from the current leader state, allocate follower request sequences,
    /// run one [`ReplicationRound`] and drain its background work before returning.
    ///
    /// The lock permit travels with the round and is returned once every RPC of the
    /// round has been issued (not answered), so a subsequent `replicate` call may
    /// begin dispatching while this round's replies are still in flight.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(ident=%self.ident(), batch=%batch.summary()))]
    pub async fn replicate(
        self: &Arc<Self>,
        batch: EntryBatch<D>,
        consistency: Consistency,
    ) -> ReplicateResult<ReplicateOutcome> {
        let permit = self
            .op_lock
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ReplicateError::ShuttingDown)?;

        let meta = self.protocol_metadata();
        let seqs = self.next_follower_request_sequences();

        let request = AppendEntriesRequest {
            from: self.id,
            to: self.id,
            meta,
            batch,
            flush_required: consistency.requires_flush(),
        };

        let mut round = ReplicationRound::new(self.clone(), request, seqs);
        let res = round.apply(ReplicateUnits::new(vec![permit])).await;
        let res = match res {
            Ok(_) => round.wait_for_majority().await,
            Err(err) => Err(err),
        };
        round.wait_for_shutdown().await;
        self.probe.round_done();
        res
    }
}

/// Assembles a [`Consensus`] from its collaborators and the leader's initial state.
pub struct ConsensusBuilder<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    id: NodeId,
    group: GroupId,
    config: Arc<Config>,
    network: Arc<N>,
    log: Arc<S>,
    membership: MembershipConfig,
    current_term: u64,
    last_log: LogId,
    committed_offset: u64,
    marker_d: PhantomData<D>,
}

impl<D, N, S> ConsensusBuilder<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    /// Start building a consensus instance for the given group.
    pub fn new(id: NodeId, group: GroupId, config: Arc<Config>, network: Arc<N>, log: Arc<S>) -> Self {
        Self {
            id,
            group,
            config,
            network,
            log,
            membership: MembershipConfig::default(),
            current_term: 0,
            last_log: LogId::default(),
            committed_offset: 0,
            marker_d: PhantomData,
        }
    }

    /// Set the cluster membership. The builder registers follower bookkeeping for
    /// every member other than the local node.
    pub fn membership(mut self, membership: MembershipConfig) -> Self {
        self.membership = membership;
        self
    }

    /// Set the term this node leads in.
    pub fn current_term(mut self, term: u64) -> Self {
        self.current_term = term;
        self
    }

    /// Set the id of the last entry in the leader's log.
    pub fn last_log(mut self, last_log: LogId) -> Self {
        self.last_log = last_log;
        self
    }

    /// Set the commit index known at leadership start.
    pub fn committed_offset(mut self, offset: u64) -> Self {
        self.committed_offset = offset;
        self
    }

    /// Build the consensus instance.
    pub fn build(self) -> Arc<Consensus<D, N, S>> {
        let (tx, rx) = watch::channel(self.committed_offset);

        let fstats = FollowerStats::default();
        for node in self.membership.all_nodes() {
            if node == self.id {
                continue;
            }
            let is_learner = !self.membership.is_voter(&node);
            fstats.register(node, is_learner, self.config.max_inflight_appends_per_follower);
        }

        Arc::new(Consensus {
            id: self.id,
            group: self.group,
            config: self.config,
            network: self.network,
            log: self.log,
            state: RwLock::new(LeaderState {
                term: self.current_term,
                membership: self.membership,
                last_log_index: self.last_log.index,
                last_log_term: self.last_log.term,
                self_flushed_log_index: self.last_log.index,
                last_quorum_replicated_index: self.committed_offset,
                visibility_upper_bound_index: self.committed_offset,
                majority_replicated_index: self.committed_offset,
                last_write_consistency_level: Consistency::default(),
            }),
            commit_index_tx: Mutex::new(Some(tx)),
            commit_index_rx: rx,
            op_lock: Arc::new(Semaphore::new(1)),
            fstats,
            probe: Probe::default(),
            marker_d: PhantomData,
        })
    }
}
