use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::core::Consensus;
use crate::core::HeartbeatGuard;
use crate::error::{ReplicateError, ReplicateResult};
use crate::network::RpcOptions;
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, Consistency, EntryBatch, ProtocolMetadata, ReplicateOutcome, ReplyResult,
};
use crate::replication::{ReplicateUnits, ResourceUnits};
use crate::storage::LogAppendResult;
use crate::{AppData, FollowerReqSeq, MessageSummary, NodeId, RaftLog, RaftNetwork};

/// One leader-side replication round: a single batch, driven from local append to
/// quorum commit.
///
/// The round is a single-shot object. The intended call sequence is:
///
/// ```ignore
/// let mut round = ReplicationRound::new(consensus, request, seqs);
/// let accepted = round.apply(units).await?;        // appended locally, dispatch scheduled
/// let committed = round.wait_for_majority().await; // quorum / truncation / shutdown
/// round.wait_for_shutdown().await;                 // drain background work
/// ```
///
/// Stop conditions for the commit wait:
///  1. the leader's commit index reaches the offset appended by this round (success),
///  2. the term changed and the entry at the appended offset no longer carries the
///     appended term (the entry was truncated by a newer leader),
///  3. the commit-index watch was broken (the node is shutting down).
///
/// Dropping the round while background dispatches are still running is a programming
/// error and panics; `wait_for_shutdown` is idempotent and cheap once drained.
pub struct ReplicationRound<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    /// State shared with the background dispatch tasks.
    shared: Arc<RoundShared<D, N, S>>,

    /// Heartbeat-suppression guards, installed before the self append. Each guard
    /// leaves this map exactly once: moved into its peer's dispatch, released
    /// synchronously on skip, or dropped with the round if the self append failed.
    hb_guards: HashMap<NodeId, HeartbeatGuard>,

    /// The outcome of the local append; peers are dispatched only when this is `Ok`.
    append_result: Option<ReplicateResult<LogAppendResult>>,

    /// The last offset produced by the self append, set exactly once before any
    /// peer dispatch.
    dirty_offset: u64,

    /// The commit index snapshotted right after the self append; distinguishes
    /// "commit advanced" from "term merely changed" during the commit wait.
    initial_committed_offset: u64,

    /// The number of peers a dispatch task was started for. Each contributes exactly
    /// one permit to the dispatch semaphore.
    requests_count: u32,

    /// The background scope: per-peer dispatches and the post-dispatch cleanup.
    req_bg: JoinSet<()>,
}

/// The part of the round the background tasks hold on to.
struct RoundShared<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    consensus: Arc<Consensus<D, N, S>>,
    meta: ProtocolMetadata,
    flush_required: bool,
    followers_seq: HashMap<NodeId, FollowerReqSeq>,

    /// The authoritative batch handle. The mutex serializes sharing; the holder
    /// survives every share so retry paths can reissue the batch, and is cleared
    /// only by the post-dispatch cleanup.
    batch: Mutex<Option<EntryBatch<D>>>,

    /// Counting barrier, starting at zero. Every scheduled peer signals exactly one
    /// permit once its RPC has been *issued* (not answered), so the cleanup task can
    /// release the op lock while replies are still in flight.
    dispatch_sem: Semaphore,

    /// The caller's dispatch units, released when the dispatch barrier clears. The
    /// memory-accounting handle inside is shared with each outbound RPC and, by
    /// design, outlives the barrier until the last reply lands; the dispatch permits
    /// themselves never travel with an RPC.
    units: StdMutex<Option<ReplicateUnits>>,
}

/// Signals the dispatch semaphore exactly once, on `fire()` or on drop.
///
/// Every dispatch path must produce its permit even when it fails before reaching the
/// network; otherwise the barrier never clears and the op lock is never returned.
struct DispatchSignal<'a> {
    sem: &'a Semaphore,
    fired: bool,
}

impl<'a> DispatchSignal<'a> {
    fn new(sem: &'a Semaphore) -> Self {
        Self { sem, fired: false }
    }

    fn fire(&mut self) {
        if !self.fired {
            self.fired = true;
            self.sem.add_permits(1);
        }
    }
}

impl Drop for DispatchSignal<'_> {
    fn drop(&mut self) {
        self.fire();
    }
}

impl<D, N, S> RoundShared<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    /// Produce a batch handle for one consumer.
    ///
    /// The holder keeps its own handle across every share; it is only released at the
    /// dispatch barrier.
    async fn share_batch(&self) -> EntryBatch<D> {
        let holder = self.batch.lock().await;
        holder.as_ref().expect("batch holder released before all dispatches were issued").clone()
    }

    fn resource_units_handle(&self) -> Option<Arc<ResourceUnits>> {
        self.units.lock().unwrap().as_ref().and_then(|u| u.resource_units())
    }

    /// Dispatch the round to a single peer and produce its reply.
    ///
    /// The leader's own slot flushes locally and synthesizes the reply; remote peers
    /// get a real AppendEntries RPC. The heartbeat guard is released when the
    /// dispatch terminates, success or not.
    async fn dispatch_single_retry(
        &self,
        id: NodeId,
        dirty_offset: u64,
        hb_guard: Option<HeartbeatGuard>,
    ) -> ReplicateResult<AppendEntriesReply> {
        if id == self.consensus.self_node_id() {
            return self.flush_leader_log(dirty_offset).await;
        }

        let batch = self.share_batch().await;
        let res = self.send_append_entries(id, batch).await;
        if let Some(guard) = hb_guard {
            guard.unsuppress();
        }
        res
    }

    /// The leader's own "peer slot": flush if required, then synthesize the reply.
    async fn flush_leader_log(&self, dirty_offset: u64) -> ReplicateResult<AppendEntriesReply> {
        // The leader's dispatch is logically instantaneous: the permit's job is to
        // release the op lock, not to wait for the flush.
        self.dispatch_sem.add_permits(1);

        if self.flush_required {
            if let Err(err) = self.consensus.flush_log().await {
                tracing::warn!(error=%err, "leader log flush failed");
                return Err(ReplicateError::LeaderFlushFailed);
            }
        }

        // dirty_offset was sampled after the self append; everything up to it is
        // covered by the flush above, so both indexes report it.
        let id = self.consensus.self_node_id();
        Ok(AppendEntriesReply {
            node_id: id,
            target_node_id: id,
            group: self.consensus.group_id(),
            term: self.consensus.current_term(),
            last_dirty_log_index: dirty_offset,
            last_flushed_log_index: dirty_offset,
            result: ReplyResult::Success,
        })
    }

    /// Issue one AppendEntries RPC to a remote peer.
    async fn send_append_entries(&self, target: NodeId, batch: EntryBatch<D>) -> ReplicateResult<AppendEntriesReply> {
        let consensus = &self.consensus;
        consensus.update_node_append_timestamp(&target);

        tracing::trace!(target, meta = %self.meta.summary(), "sending append entries request");

        let mut signal = DispatchSignal::new(&self.dispatch_sem);

        let admission = consensus.fstats().append_entries_units(&target);
        let permit = match admission {
            Some(sem) => match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_closed) => return Err(ReplicateError::AppendEntriesDispatchError),
            },
            None => return Err(ReplicateError::AppendEntriesDispatchError),
        };

        let request = AppendEntriesRequest {
            from: consensus.self_node_id(),
            to: target,
            meta: self.meta,
            batch,
            flush_required: self.flush_required,
        };
        let rpc_timeout = consensus.config().replicate_append_timeout();
        let opts = RpcOptions::new(rpc_timeout).with_resource_units(self.resource_units_handle());

        let rpc = consensus.network().append_entries(target, request, opts);
        // The request has left the leader: release the op lock so the next round can
        // start dispatching while this reply is still in flight.
        signal.fire();

        let reply = match timeout(rpc_timeout, rpc).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                tracing::warn!(error=%err, target, "error while replicating entries");
                Err(ReplicateError::AppendEntriesDispatchError)
            }
            Err(_elapsed) => {
                tracing::warn!(target, "timeout while replicating entries");
                Err(ReplicateError::AppendEntriesDispatchError)
            }
        };
        drop(permit);

        consensus.validate_reply_target_node("append_entries_replicate", reply, target)
    }
}

impl<D, N, S> ReplicationRound<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    /// Create a round for one accepted batch.
    ///
    /// `followers_seq` maps every follower that may be dispatched to the request
    /// sequence allocated for this round; a missing entry for a dispatched follower
    /// is a fatal invariant violation at reply-routing time.
    pub fn new(
        consensus: Arc<Consensus<D, N, S>>,
        request: AppendEntriesRequest<D>,
        followers_seq: HashMap<NodeId, FollowerReqSeq>,
    ) -> Self {
        Self {
            shared: Arc::new(RoundShared {
                consensus,
                meta: request.meta,
                flush_required: request.flush_required,
                followers_seq,
                batch: Mutex::new(Some(request.batch)),
                dispatch_sem: Semaphore::new(0),
                units: StdMutex::new(None),
            }),
            hb_guards: HashMap::new(),
            append_result: None,
            dirty_offset: 0,
            initial_committed_offset: 0,
            requests_count: 0,
            req_bg: JoinSet::new(),
        }
    }

    /// Append the batch locally and schedule every per-peer dispatch.
    ///
    /// Resolves once all requests have been *scheduled*: the returned offset is the
    /// "accepted locally, dispatch in progress" acknowledgement. The commit wait is a
    /// separate future, [`Self::wait_for_majority`].
    #[tracing::instrument(level = "trace", skip(self, units), fields(meta = %self.shared.meta.summary()))]
    pub async fn apply(&mut self, units: ReplicateUnits) -> ReplicateResult<ReplicateOutcome> {
        let consensus = self.shared.consensus.clone();
        let self_id = consensus.self_node_id();
        let voters = consensus.membership().voters;

        // Suppress follower heartbeats before appending to the leader log, so a
        // heartbeat cannot race ahead of the append with stale metadata.
        for id in &voters {
            if *id != self_id {
                self.hb_guards.insert(*id, consensus.suppress_heartbeats(id));
            }
        }

        *self.shared.units.lock().unwrap() = Some(units);
        consensus.probe().round_started();

        let append = self.append_to_self().await;
        self.append_result = Some(append.clone());
        let append = match append {
            Ok(append) => append,
            // No peer dispatch may happen after a failed local append. The guards
            // still held release when the round is dropped.
            Err(err) => return Err(err),
        };

        self.dirty_offset = append.last_offset;
        self.initial_committed_offset = consensus.committed_offset();

        for id in voters {
            // Peers that are recovering or unresponsive get heartbeats only.
            if self.should_skip_follower_request(&id) {
                if let Some(guard) = self.hb_guards.remove(&id) {
                    guard.unsuppress();
                }
                continue;
            }
            if id != self_id {
                let dirty_offset = self.dirty_offset;
                let meta = self.shared.meta;
                consensus.fstats().update(&id, |f| {
                    f.expected_log_end_offset = Some(dirty_offset);
                    f.last_sent_protocol_meta = Some(meta);
                });
            }
            self.requests_count += 1;
            self.dispatch_one(id);
        }

        // Once every RPC has been issued, return the dispatch units and release the
        // retained batch handle in the background; shutdown awaits this task too.
        // Memory units attached to still-in-flight RPCs come back with their replies.
        let shared = self.shared.clone();
        let scheduled = self.requests_count;
        self.req_bg.spawn(async move {
            if let Ok(permits) = shared.dispatch_sem.acquire_many(scheduled).await {
                permits.forget();
            }
            *shared.batch.lock().await = None;
            shared.units.lock().unwrap().take();
        });

        Ok(ReplicateOutcome {
            last_offset: self.dirty_offset,
        })
    }

    /// Wait until the round's batch is committed, truncated, or the node shuts down.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn wait_for_majority(&self) -> ReplicateResult<ReplicateOutcome> {
        let append = match &self.append_result {
            None => panic!("leader append result must be present before waiting for a majority"),
            Some(Err(err)) => return Err(err.clone()),
            Some(Ok(append)) => append.clone(),
        };
        let appended_offset = append.last_offset;
        let appended_term = append.last_term;

        let consensus = &self.shared.consensus;
        let mut rx = consensus.commit_index_rx();

        // Finish when the commit index reaches the appended offset, or when the term
        // changed after a commit-index update: the entry may then have been either
        // committed or truncated, and process_result tells the two apart.
        loop {
            let committed = *rx.borrow_and_update();
            if committed >= appended_offset {
                break;
            }
            let truncated = consensus.current_term() > appended_term
                && committed > self.initial_committed_offset
                && consensus.log().term_of(appended_offset) != Some(appended_term);
            if truncated {
                break;
            }
            if rx.changed().await.is_err() {
                tracing::debug!(
                    last_offset = self.dirty_offset,
                    "replication of entries aborted, shutting down"
                );
                return Err(ReplicateError::ShuttingDown);
            }
        }

        self.process_result(appended_offset, appended_term)
    }

    /// Wait for all background work of this round to finish.
    ///
    /// Required before the round is dropped; repeated calls after the first are
    /// no-ops.
    pub async fn wait_for_shutdown(&mut self) {
        while self.req_bg.join_next().await.is_some() {}
    }

    /// Append the batch to the leader's own log.
    async fn append_to_self(&self) -> ReplicateResult<LogAppendResult> {
        let shared = &self.shared;
        let consensus = &shared.consensus;

        let batch = shared.share_batch().await;
        tracing::trace!(meta = %shared.meta.summary(), "self append entries");

        consensus.set_last_write_consistency_level(if shared.flush_required {
            Consistency::QuorumAck
        } else {
            Consistency::LeaderAck
        });

        match consensus.disk_append(batch, shared.flush_required).await {
            Ok(append) => {
                tracing::trace!(last_offset = append.last_offset, last_term = append.last_term, "leader append result");
                // Only move the visibility upper bound when every quorum-replicated
                // entry is already committed; otherwise relaxed readers could observe
                // offsets a pending quorum write still covers.
                if consensus.committed_offset() >= consensus.last_quorum_replicated_index() {
                    consensus.raise_visibility_upper_bound(append.last_offset);
                    consensus.maybe_update_majority_replicated_index();
                }
                Ok(append)
            }
            Err(err) => {
                tracing::warn!(error=%err, "error replicating entries, leader append failed");
                consensus.probe().leader_append_error();
                Err(ReplicateError::LeaderAppendFailed)
            }
        }
    }

    /// Whether the round should skip dispatching to the given peer.
    ///
    /// Peers missing from the stats table (including the leader itself) are never
    /// skipped. For known peers the decision is the follower's: see
    /// [`crate::FollowerState::should_skip_append`].
    fn should_skip_follower_request(&self, id: &NodeId) -> bool {
        let consensus = &self.shared.consensus;
        let follower = match consensus.fstats().get(id) {
            Some(f) => f,
            None => return false,
        };
        let seq = match self.shared.followers_seq.get(id) {
            Some(seq) => *seq,
            None => panic!("no follower sequence found for {}", id),
        };

        let skip = follower.should_skip_append(
            seq,
            self.shared.meta.prev_log_index,
            consensus.config().replicate_append_timeout(),
        );
        if skip {
            tracing::trace!(
                peer = *id,
                expected_log_end = ?follower.expected_log_end_offset,
                prev_log_index = self.shared.meta.prev_log_index,
                "skipping append entries request to peer"
            );
        }
        skip
    }

    /// Spawn the dispatch task for one peer and route its reply.
    fn dispatch_one(&mut self, id: NodeId) {
        let shared = self.shared.clone();
        let dirty_offset = self.dirty_offset;
        let hb_guard = self.hb_guards.remove(&id);

        self.req_bg.spawn(async move {
            let reply = shared.dispatch_single_retry(id, dirty_offset, hb_guard).await;

            let seq = if id == shared.consensus.self_node_id() {
                0
            } else {
                match shared.followers_seq.get(&id) {
                    Some(seq) => *seq,
                    None => panic!(
                        "follower request sequence is required to exist for each follower, none found for {}",
                        id
                    ),
                }
            };

            if reply.is_err() {
                shared.consensus.probe().replicate_request_error();
            }
            shared.consensus.process_append_entries_reply(id, reply, seq, dirty_offset);
        });
    }

    /// Decide the final outcome once the commit wait has fired.
    fn process_result(&self, appended_offset: u64, appended_term: u64) -> ReplicateResult<ReplicateOutcome> {
        let consensus = &self.shared.consensus;
        tracing::trace!(
            appended_offset,
            appended_term,
            commit_index = consensus.committed_offset(),
            current_term = consensus.current_term(),
            "replication result"
        );

        // If the term changed, the entry survived only if its stored term still
        // matches the term it was appended in.
        if appended_term != consensus.current_term() {
            let stored_term = consensus.log().term_of(appended_offset);
            if stored_term != Some(appended_term) {
                tracing::debug!(
                    appended_offset,
                    appended_term,
                    ?stored_term,
                    "appended entry was truncated under a newer leader"
                );
                return Err(ReplicateError::ReplicatedEntryTruncated);
            }
        }

        // Better to crash than to allow inconsistency.
        assert!(
            appended_offset <= consensus.committed_offset(),
            "{} - successful replication means the commit index reached the appended offset; \
             commit index: {}, appended offset: {}, initial committed offset: {}",
            consensus.ident(),
            consensus.committed_offset(),
            appended_offset,
            self.initial_committed_offset
        );

        Ok(ReplicateOutcome {
            last_offset: appended_offset,
        })
    }
}

impl<D, N, S> Drop for ReplicationRound<D, N, S>
where
    D: AppData,
    N: RaftNetwork<D>,
    S: RaftLog<D>,
{
    fn drop(&mut self) {
        if !self.req_bg.is_empty() && !std::thread::panicking() {
            panic!("replication round dropped with undrained background tasks, call wait_for_shutdown() first");
        }
    }
}
