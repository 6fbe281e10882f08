//! Per-follower replication bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::raft::ProtocolMetadata;
use crate::{FollowerReqSeq, NodeId};

/// The leader's view of a single follower.
///
/// Timestamps and indexes are written by the consensus layer as replies arrive; the
/// replication round reads them for the skip decision and stamps the expected log end
/// and the last sent metadata at dispatch time.
#[derive(Debug, Clone)]
pub struct FollowerState {
    /// Whether the node is a non-voting learner.
    pub is_learner: bool,
    /// When the last well-formed reply (append or heartbeat) arrived from this follower.
    pub last_received_reply_timestamp: Instant,
    /// When the leader last started sending an append to this follower.
    pub last_sent_append_timestamp: Instant,
    /// Where the follower's log is expected to end once all dispatched appends land.
    ///
    /// `None` until the first dispatch, and cleared again whenever a reply fails: an
    /// unknown log end means the follower needs recovery, not direct appends.
    pub expected_log_end_offset: Option<u64>,
    /// The header of the last AppendEntries request dispatched to this follower.
    pub last_sent_protocol_meta: Option<ProtocolMetadata>,
    /// The last dirty offset the follower has reported.
    pub last_dirty_log_index: u64,
    /// The last flushed offset the follower has reported.
    pub last_flushed_log_index: u64,
    /// The highest request sequence acknowledged by a reply.
    pub last_ack_seq: FollowerReqSeq,
    /// The next request sequence to allocate.
    pub next_req_seq: FollowerReqSeq,

    append_entries_units: Arc<Semaphore>,
    heartbeats_suppressed: Arc<AtomicU64>,
}

impl FollowerState {
    fn new(is_learner: bool, max_inflight_appends: usize) -> Self {
        let now = Instant::now();
        Self {
            is_learner,
            last_received_reply_timestamp: now,
            last_sent_append_timestamp: now,
            expected_log_end_offset: None,
            last_sent_protocol_meta: None,
            last_dirty_log_index: 0,
            last_flushed_log_index: 0,
            last_ack_seq: 0,
            next_req_seq: 0,
            append_entries_units: Arc::new(Semaphore::new(max_inflight_appends)),
            heartbeats_suppressed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `seq` is the first request ever allocated for this follower.
    ///
    /// The first request after a leadership change carries the new leader's initial
    /// metadata; there is not enough reply history to judge the follower, so voters
    /// receive it unconditionally.
    pub fn is_first_request(seq: FollowerReqSeq) -> bool {
        seq <= 1
    }

    /// Decide whether a direct append with the given header should be skipped.
    ///
    /// Skipping keeps a struggling follower on heartbeats only: either it has not
    /// answered anything within the liveness window (probably down), or its log end is
    /// not where this batch attaches (it needs recovery first). Either way a direct
    /// append could only queue up behind the problem.
    pub fn should_skip_append(&self, seq: FollowerReqSeq, prev_log_index: u64, liveness_window: Duration) -> bool {
        if !self.is_learner && Self::is_first_request(seq) {
            return false;
        }
        if self.last_received_reply_timestamp.elapsed() > liveness_window {
            return true;
        }
        if self.expected_log_end_offset != Some(prev_log_index) {
            return true;
        }
        false
    }

    /// Whether heartbeats to this follower are currently suppressed.
    pub fn heartbeats_suppressed(&self) -> bool {
        self.heartbeats_suppressed.load(Ordering::Acquire) > 0
    }
}

/// A scoped token suppressing heartbeats to one follower.
///
/// Suppression is installed before the leader's own append so a heartbeat cannot race
/// ahead of the append with stale metadata. Dropping the guard (or calling
/// [`HeartbeatGuard::unsuppress`]) resumes heartbeats; the release happens exactly once.
#[derive(Debug)]
pub struct HeartbeatGuard {
    counter: Option<Arc<AtomicU64>>,
}

impl HeartbeatGuard {
    fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter: Some(counter) }
    }

    /// Resume heartbeats to the follower now.
    pub fn unsuppress(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(counter) = self.counter.take() {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// The table of all followers known to the leader.
///
/// All access goes through short, non-awaiting critical sections; the admission
/// semaphore and the suppression counter are handed out as `Arc`s so they can be used
/// without holding the table lock.
#[derive(Debug, Default)]
pub(crate) struct FollowerStats {
    table: RwLock<HashMap<NodeId, FollowerState>>,
}

impl FollowerStats {
    /// Register a follower. Replaces any previous state for the node.
    pub(crate) fn register(&self, id: NodeId, is_learner: bool, max_inflight_appends: usize) {
        let mut table = self.table.write().unwrap();
        table.insert(id, FollowerState::new(is_learner, max_inflight_appends));
    }

    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        self.table.read().unwrap().contains_key(id)
    }

    /// A point-in-time copy of one follower's state.
    pub(crate) fn get(&self, id: &NodeId) -> Option<FollowerState> {
        self.table.read().unwrap().get(id).cloned()
    }

    /// Run `f` against the mutable state of one follower, if present.
    pub(crate) fn update<F, T>(&self, id: &NodeId, f: F) -> Option<T>
    where
        F: FnOnce(&mut FollowerState) -> T,
    {
        let mut table = self.table.write().unwrap();
        table.get_mut(id).map(f)
    }

    /// The admission semaphore for one follower.
    pub(crate) fn append_entries_units(&self, id: &NodeId) -> Option<Arc<Semaphore>> {
        let table = self.table.read().unwrap();
        table.get(id).map(|f| f.append_entries_units.clone())
    }

    /// Install a heartbeat-suppression guard for one follower.
    ///
    /// Unknown followers yield a guard over a detached counter, so callers need not
    /// special-case peers that have never been registered.
    pub(crate) fn suppress_heartbeats(&self, id: &NodeId) -> HeartbeatGuard {
        let counter = {
            let table = self.table.read().unwrap();
            table.get(id).map(|f| f.heartbeats_suppressed.clone())
        };
        HeartbeatGuard::new(counter.unwrap_or_default())
    }

    /// Allocate the next request sequence for each of the given followers.
    pub(crate) fn next_request_sequences<'a, I>(&self, ids: I) -> HashMap<NodeId, FollowerReqSeq>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let mut table = self.table.write().unwrap();
        let mut seqs = HashMap::new();
        for id in ids {
            if let Some(f) = table.get_mut(id) {
                f.next_req_seq += 1;
                seqs.insert(*id, f.next_req_seq);
            }
        }
        seqs
    }

    /// Record that an append request is being sent to the follower now.
    pub(crate) fn update_node_append_timestamp(&self, id: &NodeId) {
        self.update(id, |f| f.last_sent_append_timestamp = Instant::now());
    }

    /// Record a well-formed reply carrying `seq`.
    ///
    /// Returns `false` when the reply is older than one already processed, in which
    /// case the caller must discard it.
    pub(crate) fn observe_reply(&self, id: &NodeId, seq: FollowerReqSeq) -> bool {
        self.update(id, |f| {
            if seq < f.last_ack_seq {
                return false;
            }
            f.last_ack_seq = seq;
            f.last_received_reply_timestamp = Instant::now();
            true
        })
        .unwrap_or(false)
    }

    /// Record a failed dispatch carrying `seq`.
    ///
    /// Returns `false` when a newer reply has already been processed for the peer, in
    /// which case the failure is stale and must be ignored. Unlike
    /// [`FollowerStats::observe_reply`] this does not refresh the liveness timestamp:
    /// a dispatch error is not a follower reply.
    pub(crate) fn observe_dispatch_failure(&self, id: &NodeId, seq: FollowerReqSeq) -> bool {
        self.update(id, |f| {
            if seq < f.last_ack_seq {
                return false;
            }
            f.last_ack_seq = seq;
            true
        })
        .unwrap_or(false)
    }

    /// Record the offsets reported by a successful append reply.
    pub(crate) fn record_success(&self, id: &NodeId, dirty: u64, flushed: u64) {
        self.update(id, |f| {
            f.last_dirty_log_index = f.last_dirty_log_index.max(dirty);
            f.last_flushed_log_index = f.last_flushed_log_index.max(flushed);
        });
    }

    /// Forget where the follower's log ends.
    ///
    /// Called on failed replies and dispatch errors: subsequent rounds will skip the
    /// follower until recovery re-establishes its position.
    pub(crate) fn clear_expected_log_end(&self, id: &NodeId) {
        self.update(id, |f| f.expected_log_end_offset = None);
    }

    /// The flushed offset reported by each of the given followers, where known.
    pub(crate) fn flushed_offsets<'a, I>(&self, ids: I) -> Vec<u64>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let table = self.table.read().unwrap();
        ids.into_iter().filter_map(|id| table.get(id).map(|f| f.last_flushed_log_index)).collect()
    }

    /// The dirty offset reported by each of the given followers, where known.
    pub(crate) fn dirty_offsets<'a, I>(&self, ids: I) -> Vec<u64>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let table = self.table.read().unwrap();
        ids.into_iter().filter_map(|id| table.get(id).map(|f| f.last_dirty_log_index)).collect()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn caught_up_follower(prev_log_index: u64) -> FollowerState {
        let mut f = FollowerState::new(false, 1);
        f.expected_log_end_offset = Some(prev_log_index);
        f
    }

    #[test]
    fn test_first_request_is_never_skipped_for_voters() {
        // No reply history, no expected log end: a later request would be skipped,
        // but the very first one goes out unconditionally.
        let f = FollowerState::new(false, 1);
        assert!(!f.should_skip_append(1, 10, Duration::from_millis(100)));
        assert!(f.should_skip_append(2, 10, Duration::from_millis(100)));
    }

    #[test]
    fn test_learners_get_no_first_request_exemption() {
        let f = FollowerState::new(true, 1);
        // expected_log_end_offset is unknown, so even the first request is skipped.
        assert!(f.should_skip_append(1, 10, Duration::from_millis(100)));
    }

    #[test]
    fn test_skip_when_reply_timestamp_is_stale() {
        let mut f = caught_up_follower(10);
        f.last_received_reply_timestamp = Instant::now() - Duration::from_secs(10);
        assert!(f.should_skip_append(5, 10, Duration::from_millis(100)));
    }

    #[test]
    fn test_skip_when_log_end_does_not_match() {
        let f = caught_up_follower(7);
        assert!(f.should_skip_append(5, 10, Duration::from_secs(60)));
    }

    #[test]
    fn test_send_when_alive_and_caught_up() {
        let f = caught_up_follower(10);
        assert!(!f.should_skip_append(5, 10, Duration::from_secs(60)));
    }

    #[test]
    fn test_out_of_order_replies_are_discarded() {
        let stats = FollowerStats::default();
        stats.register(2, false, 1);
        assert!(stats.observe_reply(&2, 3));
        assert!(!stats.observe_reply(&2, 2));
        assert!(stats.observe_reply(&2, 3));
    }

    #[test]
    fn test_stale_dispatch_failures_are_discarded() {
        let stats = FollowerStats::default();
        stats.register(2, false, 1);
        stats.update(&2, |f| f.expected_log_end_offset = Some(10));
        assert!(stats.observe_reply(&2, 4));

        // An error from an older round must not be processed after a newer reply.
        assert!(!stats.observe_dispatch_failure(&2, 3));

        let before = stats.get(&2).unwrap().last_received_reply_timestamp;
        assert!(stats.observe_dispatch_failure(&2, 4));
        assert_eq!(stats.get(&2).unwrap().last_received_reply_timestamp, before);
    }

    #[test]
    fn test_heartbeat_guard_releases_exactly_once() {
        let stats = FollowerStats::default();
        stats.register(2, false, 1);

        let guard = stats.suppress_heartbeats(&2);
        assert!(stats.get(&2).unwrap().heartbeats_suppressed());

        let second = stats.suppress_heartbeats(&2);
        guard.unsuppress();
        assert!(stats.get(&2).unwrap().heartbeats_suppressed());

        drop(second);
        assert!(!stats.get(&2).unwrap().heartbeats_suppressed());
    }
}
