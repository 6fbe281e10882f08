use std::time::Duration;

use anyhow::Result;
use raft_replication::raft::{AppendEntriesRequest, LogId};
use raft_replication::replication::{ReplicateUnits, ReplicationRound};
use raft_replication::raft::ReplyResult;
use raft_replication::Consistency;

mod fixtures;

/// A follower that has not answered within the replicate timeout is skipped.
///
/// What does this test do?
///
/// - replicate one batch so both followers have reply history (the first request is
///   exempt from skipping).
/// - let the liveness window lapse, then refresh only follower 1 via the heartbeat
///   reply path.
/// - drive a round by hand and assert that follower 2 got no RPC, its heartbeat
///   guard was released synchronously, and follower 1's only after its dispatch
///   finished.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_follower_with_stale_replies() -> Result<()> {
    fixtures::init_tracing();

    let cluster = fixtures::test_cluster(&[0, 1, 2], 1, LogId { term: 1, index: 0 });
    let consensus = &cluster.consensus;

    consensus.replicate(fixtures::batch(1, 1..=3), Consistency::QuorumAck).await?;
    assert_eq!(cluster.network.sent_to(1), 1);
    assert_eq!(cluster.network.sent_to(2), 1);

    // Both followers go quiet past the liveness window; only follower 1 comes back.
    tokio::time::sleep(Duration::from_millis(150)).await;
    consensus.note_heartbeat_reply(&1);

    // Delay follower 1's reply so the suppression window is observable after apply.
    cluster.network.set_behavior(1, fixtures::PeerBehavior::AckAfter(Duration::from_millis(40)));

    let request = AppendEntriesRequest {
        from: fixtures::LEADER,
        to: fixtures::LEADER,
        meta: consensus.protocol_metadata(),
        batch: fixtures::batch(1, 4..=6),
        flush_required: true,
    };
    let seqs = consensus.next_follower_request_sequences();
    let mut round = ReplicationRound::new(consensus.clone(), request, seqs);

    let accepted = round.apply(ReplicateUnits::empty()).await?;
    assert_eq!(accepted.last_offset, 6);

    // Give the spawned dispatch a moment to reach the network.
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Follower 2 was skipped: no RPC, and its heartbeat guard came off synchronously.
    assert_eq!(cluster.network.sent_to(2), 1, "no new request to the stale follower");
    assert!(!consensus.follower_state(&2).unwrap().heartbeats_suppressed());
    // Follower 1's dispatch is still in flight, so its heartbeats stay suppressed.
    assert_eq!(cluster.network.sent_to(1), 2);
    assert!(consensus.follower_state(&1).unwrap().heartbeats_suppressed());

    let committed = round.wait_for_majority().await?;
    assert_eq!(committed.last_offset, 6);
    round.wait_for_shutdown().await;

    assert!(!consensus.follower_state(&1).unwrap().heartbeats_suppressed());
    Ok(())
}

/// A follower whose log end does not match the batch's attach point is skipped, and
/// no reply is routed for it in that round.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_follower_needing_recovery() -> Result<()> {
    fixtures::init_tracing();

    let cluster = fixtures::test_cluster(&[0, 1, 2], 1, LogId { term: 1, index: 0 });
    let consensus = &cluster.consensus;

    // Follower 2 rejects the first batch: its expected log end becomes unknown.
    cluster.network.set_behavior(2, fixtures::PeerBehavior::Reject(ReplyResult::LogMismatch));
    consensus.replicate(fixtures::batch(1, 1..=3), Consistency::QuorumAck).await?;
    assert_eq!(consensus.follower_state(&2).unwrap().expected_log_end_offset, None);

    // Follower 2 answers heartbeats again, but it still needs recovery.
    cluster.network.set_behavior(2, fixtures::PeerBehavior::Ack);
    consensus.note_heartbeat_reply(&2);

    consensus.replicate(fixtures::batch(1, 4..=6), Consistency::QuorumAck).await?;

    assert_eq!(cluster.network.sent_to(1), 2);
    assert_eq!(cluster.network.sent_to(2), 1, "recovering follower receives no direct appends");

    // No reply was routed for follower 2 in the second round.
    let f = consensus.follower_state(&2).unwrap();
    assert_eq!(f.last_ack_seq, 1);
    assert_eq!(f.last_flushed_log_index, 0);
    Ok(())
}

/// The first request to a voter is sent unconditionally, even without reply history.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_request_is_always_sent() -> Result<()> {
    fixtures::init_tracing();

    let cluster = fixtures::test_cluster(&[0, 1, 2], 1, LogId { term: 1, index: 0 });

    // Fresh cluster: no follower has an expected log end yet, which would normally
    // mean "skip"; the first-request exemption overrides it.
    cluster.consensus.replicate(fixtures::batch(1, 1..=2), Consistency::QuorumAck).await?;
    assert_eq!(cluster.network.sent_to(1), 1);
    assert_eq!(cluster.network.sent_to(2), 1);
    Ok(())
}
