//! Network partition tests for Raft cluster behavior.
//!
//! These tests verify correct behavior when the network is partitioned:
//! majority elects leader, minority cannot commit, logs converge after healing.


use std::time::Duration;
use test_harness::{assert_eventually, TestCluster};

/// Test 1: Majority partition elects a leader
#[tokio::test]
async fn test_majority_partition_elects_leader() {
    let mut cluster = TestCluster::new(5, 51500).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    let majority = vec![1, 2, 3];
    let minority = vec![4, 5];
    cluster.create_partition(&majority, &minority).await;

    let leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await;
    assert!(leader.is_some(), "Majority partition should elect a leader");

    cluster.shutdown().await;
}

/// Test 2: A stale leader cut off in the minority cannot commit
#[tokio::test]
async fn test_minority_leader_cannot_commit() {
    let mut cluster = TestCluster::new(3, 51510).await;

    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let old_term = cluster.get_node(old_leader).unwrap().current_term().await;
    let commit_before = cluster.get_node(old_leader).unwrap().commit_index().await;

    cluster.isolate_node(old_leader).await;

    let others: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != old_leader)
        .collect();
    let new_leader = cluster
        .wait_for_leader_in_group(&others, Duration::from_secs(5))
        .await
        .expect("Majority should elect a new leader");
    assert!(cluster.get_node(new_leader).unwrap().current_term().await > old_term);

    // Writes to the isolated leader never commit
    let stale = cluster.put_to_node(old_leader, "stale", "x").await;
    assert!(stale.is_err());
    assert_eq!(
        cluster.get_node(old_leader).unwrap().commit_index().await,
        commit_before
    );

    // The majority keeps working
    let applied = cluster
        .put_to_node(new_leader, "fresh", "y")
        .await
        .expect("majority leader should commit");
    assert!(
        cluster
            .wait_for_applied_on_nodes(&others, applied.index, Duration::from_secs(3))
            .await
    );

    cluster.shutdown().await;
}

/// Test 3: After healing, the old leader steps down and its uncommitted
/// suffix is overwritten by the new leader's log.
#[tokio::test]
async fn test_logs_converge_after_heal() {
    let mut cluster = TestCluster::new(3, 51520).await;

    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.put("base", "0").await.expect("put should commit");

    cluster.isolate_node(old_leader).await;

    // The isolated leader accepts entries it can never commit
    let old_node = cluster.get_node(old_leader).unwrap().raft_node.clone();
    let stale_writes = tokio::spawn(async move {
        for i in 0..3 {
            let command = raft_kv::store::KvCommand::Put {
                key: format!("lost{}", i),
                value: "x".to_string(),
            }
            .encode()
            .unwrap();
            let _ = old_node.submit(command).await;
        }
    });

    let others: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != old_leader)
        .collect();
    let new_leader = cluster
        .wait_for_leader_in_group(&others, Duration::from_secs(5))
        .await
        .expect("Majority should elect a new leader");

    let mut last = 0;
    for i in 0..10 {
        last = cluster
            .put_to_node(new_leader, &format!("kept{}", i), "y")
            .await
            .expect("majority leader should commit")
            .index;
    }

    cluster.heal_node(old_leader).await;

    assert!(
        cluster
            .wait_for_applied_on_all(last, Duration::from_secs(5))
            .await,
        "Every node should apply the majority's log"
    );
    assert_eventually(
        || async { cluster.count_leaders().await == 1 },
        Duration::from_secs(2),
        "Old leader should step down",
    )
    .await;

    for node in cluster.nodes.values() {
        assert_eq!(node.store.get("base").as_deref(), Some("0"));
        assert_eq!(node.store.get("kept9").as_deref(), Some("y"));
        assert!(node.store.get("lost0").is_none());
    }
    assert!(cluster.verify_log_consistency().await);

    stale_writes.abort();
    cluster.shutdown().await;
}

/// Test 4: A follower that falls far behind is backtracked and caught up.
#[tokio::test]
async fn test_lagging_follower_catches_up() {
    let mut cluster = TestCluster::new(3, 51530).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let lagging = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();

    cluster.isolate_node(lagging).await;

    let mut last = 0;
    for i in 0..10 {
        last = cluster
            .put_to_node(leader_id, &format!("k{}", i), &i.to_string())
            .await
            .expect("2 of 3 is a quorum")
            .index;
    }
    assert_eq!(cluster.get_node(lagging).unwrap().store.len(), 0);

    cluster.heal_node(lagging).await;

    assert!(
        cluster
            .wait_for_applied_on_nodes(&[lagging], last, Duration::from_secs(5))
            .await,
        "Lagging follower should catch up"
    );
    // The rejoining node's inflated term may force a new election, so
    // compare against the original leader's applied state
    let expected = cluster.get_node(leader_id).unwrap().store.snapshot();
    assert_eq!(cluster.get_node(lagging).unwrap().store.snapshot(), expected);

    cluster.shutdown().await;
}

/// Test 5: Partitioned peers are reported unreachable
#[tokio::test]
async fn test_peer_status_reflects_partition() {
    let mut cluster = TestCluster::new(3, 51540).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let leader = cluster.get_node(leader_id).unwrap();

    assert_eventually(
        || async { leader.raft_node.get_peers_status().await.values().all(|&r| r) },
        Duration::from_secs(2),
        "Leader should reach every peer",
    )
    .await;

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    cluster.isolate_node(follower_id).await;

    let status = leader.raft_node.get_peers_status().await;
    assert_eq!(status.get(&follower_id), Some(&false));

    cluster.heal_node(follower_id).await;
    assert_eventually(
        || async {
            let Some(id) = cluster.get_leader_id().await else {
                return false;
            };
            let status = cluster.get_node(id).unwrap().raft_node.get_peers_status().await;
            status.values().all(|&reachable| reachable)
        },
        Duration::from_secs(5),
        "Healed peer should become reachable again",
    )
    .await;

    cluster.shutdown().await;
}
