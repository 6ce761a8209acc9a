//! Failover tests for Raft leader failure and recovery.
//!
//! These tests verify cluster behavior when leaders fail, including
//! new leader election, log retention, and restart from persisted state.


use std::time::Duration;
use test_harness::{assert_eventually, TestCluster};

use raft_kv::raft::RaftRole;

/// Test 1: New leader is elected after leader shutdown
#[tokio::test]
async fn test_new_leader_election_after_shutdown() {
    let mut cluster = TestCluster::new(3, 51200).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster
        .get_node(initial_leader)
        .unwrap()
        .current_term()
        .await;

    assert!(cluster.shutdown_node(initial_leader).await);

    let new_leader = cluster
        .wait_for_new_leader(initial_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");
    assert_ne!(new_leader, initial_leader);

    // New term should be higher (election increments term)
    let new_term = cluster.get_node(new_leader).unwrap().current_term().await;
    assert!(new_term > initial_term, "Term should increase after new election");

    assert_eq!(cluster.count_leaders().await, 1, "Exactly one leader should exist");

    cluster.shutdown().await;
}

/// Test 2: Committed entries survive a leader change
#[tokio::test]
async fn test_committed_entries_survive_leader_change() {
    let mut cluster = TestCluster::new(3, 51210).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let mut last = 0;
    for i in 0..5 {
        let applied = cluster
            .put(&format!("key{}", i), &format!("value{}", i))
            .await
            .unwrap_or_else(|e| panic!("put {} should commit: {}", i, e));
        last = applied.index;
    }
    assert!(cluster.wait_for_applied_on_all(last, Duration::from_secs(3)).await);

    cluster.shutdown_node(leader_id).await;

    let new_leader_id = cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    // Leader completeness: the new leader holds every committed entry
    let new_leader = cluster.get_node(new_leader_id).unwrap();
    assert!(new_leader.log_len().await >= last);
    for i in 0..5 {
        assert_eq!(
            new_leader.store.get(&format!("key{}", i)),
            Some(format!("value{}", i))
        );
    }

    cluster.shutdown().await;
}

/// Test 3: Writes after failover are committed by the surviving majority
#[tokio::test]
async fn test_writes_committed_after_failover() {
    let mut cluster = TestCluster::new(3, 51220).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    cluster.put("before", "1").await.expect("put should commit");
    cluster.shutdown_node(leader_id).await;

    cluster
        .wait_for_new_leader(leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    let applied = cluster.put("after", "2").await.expect("put should commit");
    assert!(
        cluster
            .wait_for_applied_on_all(applied.index, Duration::from_secs(3))
            .await
    );
    for node in cluster.nodes.values() {
        assert_eq!(node.store.get("before").as_deref(), Some("1"));
        assert_eq!(node.store.get("after").as_deref(), Some("2"));
    }
    assert!(cluster.verify_log_consistency().await);

    cluster.shutdown().await;
}

/// Test 4: Multiple sequential leader failures in a 5-node cluster
#[tokio::test]
async fn test_multiple_sequential_leader_failures() {
    let mut cluster = TestCluster::new(5, 51230).await;

    let mut previous_leaders = Vec::new();

    // A 5-node cluster tolerates 2 failures
    for i in 0..2 {
        let leader_id = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("Leader {} should be elected", i + 1));

        previous_leaders.push(leader_id);
        cluster.shutdown_node(leader_id).await;
    }

    let final_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Should elect leader with 3 remaining nodes");
    assert!(!previous_leaders.contains(&final_leader));
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.put("k", "v").await.expect("3 of 5 is still a quorum");

    cluster.shutdown().await;
}

/// Test 5: No progress without a quorum
#[tokio::test]
async fn test_no_commit_without_quorum() {
    let mut cluster = TestCluster::new(3, 51240).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let commit_before = cluster.get_node(leader_id).unwrap().commit_index().await;

    let followers: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != leader_id)
        .collect();
    for id in followers {
        cluster.shutdown_node(id).await;
    }

    let result = cluster.put_to_node(leader_id, "lonely", "write").await;
    assert!(result.is_err(), "A lone leader must not commit");

    let leader = cluster.get_node(leader_id).unwrap();
    assert_eq!(leader.commit_index().await, commit_before);
    assert!(leader.log_len().await > commit_before);
    assert!(leader.store.get("lonely").is_none());

    cluster.shutdown().await;
}

/// Test 6: A restarted replica rejoins with its persisted term, vote, and log
#[tokio::test]
async fn test_restarted_node_rejoins_from_storage() {
    let mut cluster = TestCluster::new(3, 51250).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();

    let first = cluster.put("a", "1").await.expect("put should commit");
    assert!(
        cluster
            .wait_for_applied_on_all(first.index, Duration::from_secs(3))
            .await
    );

    let term_before = cluster.get_node(follower_id).unwrap().current_term().await;
    cluster.shutdown_node(follower_id).await;

    // Progress continues with 2 of 3
    let second = cluster.put("b", "2").await.expect("put should commit");

    assert!(cluster.restart_node(follower_id).await);
    let restarted = cluster.get_node(follower_id).unwrap();
    assert!(restarted.current_term().await >= term_before);
    assert!(restarted.log_len().await >= first.index);

    // The restarted replica completes its handshake, catches up, and
    // re-applies everything from its restored log
    assert!(
        cluster
            .wait_for_applied_on_nodes(&[follower_id], second.index, Duration::from_secs(5))
            .await,
        "Restarted node should catch up"
    );
    let restarted = cluster.get_node(follower_id).unwrap();
    assert_eq!(restarted.store.get("a").as_deref(), Some("1"));
    assert_eq!(restarted.store.get("b").as_deref(), Some("2"));
    assert_eq!(restarted.role().await, RaftRole::Follower);

    cluster.shutdown().await;
}

/// Test 7: A stopped replica reports Down and fails pending submissions
#[tokio::test]
async fn test_stopped_leader_fails_pending_submissions() {
    let mut cluster = TestCluster::new(3, 51260).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let raft_node = cluster.get_node(leader_id).unwrap().raft_node.clone();

    cluster.shutdown_node(leader_id).await;

    assert_eventually(
        || async { raft_node.state.read().await.role == RaftRole::Down },
        Duration::from_secs(2),
        "Stopped replica should be down",
    )
    .await;
    assert!(raft_node.submit(b"{}".to_vec()).await.is_err());

    cluster.shutdown().await;
}
