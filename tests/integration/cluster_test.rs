// tests/integration/cluster_test.rs

//! End-to-end controller scenarios over the in-memory cluster.

use super::test_helpers::{Event, TestCluster};
use etcdkeeper::core::backup::{BackupController, BackupStore};
use etcdkeeper::core::commands::{CommandStore, restore_command};
use etcdkeeper::core::protocol::{ClusterSpec, InitialClusterState, PeerId};
use etcdkeeper::core::reconciler::ControllerStatus;
use etcdkeeper::core::specstore::{SPEC_MIRROR_KEY, SpecStore};
use std::collections::BTreeMap;

fn spec(count: u32, version: &str) -> ClusterSpec {
    ClusterSpec {
        member_count: count,
        etcd_version: version.to_string(),
        backup_interval: None,
        backup_retention: None,
    }
}

#[tokio::test]
async fn test_fresh_three_node_cluster_bootstrap() {
    let cluster = TestCluster::new(&["a", "b", "c"], spec(3, "3.5.7")).await;
    cluster.place_new_cluster_marker();

    cluster.tick().await.unwrap();

    // Every peer runs a replica carrying the same freshly minted token.
    let token = cluster.running("a").expect("a not running").token;
    assert_eq!(token.len(), 32);
    for name in ["b", "c"] {
        assert_eq!(cluster.running(name).expect("not running").token, token);
    }

    let events = cluster.events();
    let starts: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::ReplicaStarted { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(starts.len(), 3);

    // Every PREPARE and every member map broadcast precedes every start.
    for (i, event) in events.iter().enumerate() {
        if matches!(
            event,
            Event::PrepareAccepted { .. } | Event::MemberMapUpdated { .. }
        ) {
            assert!(i < starts[0], "{event:?} did not precede process start");
        }
    }
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::PrepareAccepted { .. }))
            .count(),
        3
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::MemberMapUpdated { .. }))
            .count(),
        3
    );
    for event in &events {
        if let Event::ReplicaStarted { state, token: t, .. } = event {
            assert_eq!(*state, InitialClusterState::New);
            assert_eq!(*t, token);
        }
    }

    // The marker is consumed, the spec persisted and mirrored.
    assert!(!cluster.marker_present());
    let persisted = cluster.spec_store.get().await.unwrap();
    assert_eq!(persisted.map(|s| s.member_count), Some(3));
    assert!(cluster.db.kv.lock().contains_key(SPEC_MIRROR_KEY));

    // A second tick finds nothing to do, and the observer sees three
    // members.
    cluster.tick().await.unwrap();
    assert_eq!(*cluster.status_rx.borrow(), ControllerStatus::Idle);
    assert_eq!(cluster.state_rx.borrow().members.len(), 3);
}

#[tokio::test]
async fn test_grow_from_one_to_three_members() {
    let cluster = TestCluster::new(&["a", "b", "c"], spec(3, "3.5.7")).await;
    cluster.peer("a").seed_running("tok-1", "3.5.7");
    cluster
        .db
        .kv
        .lock()
        .insert("app-key".to_string(), b"app-value".to_vec());

    // One ADD_MEMBER per tick.
    cluster.tick().await.unwrap();
    assert!(cluster.running("b").is_some());
    cluster.tick().await.unwrap();
    assert!(cluster.running("c").is_some());

    assert_eq!(cluster.db.members.lock().len(), 3);
    for event in cluster.events() {
        if let Event::ReplicaStarted { state, token, .. } = event {
            assert_eq!(state, InitialClusterState::Existing);
            assert_eq!(token, "tok-1");
        }
    }

    // Each new member learned the map before it started.
    let events = cluster.events();
    for name in ["b", "c"] {
        let started = events
            .iter()
            .position(
                |e| matches!(e, Event::ReplicaStarted { peer, .. } if *peer == PeerId::from(name)),
            )
            .unwrap();
        let mapped = events
            .iter()
            .position(
                |e| matches!(e, Event::MemberMapUpdated { peer, .. } if *peer == PeerId::from(name)),
            )
            .unwrap();
        assert!(mapped < started);
    }

    // No data loss across the expansion.
    assert_eq!(
        cluster.db.kv.lock().get("app-key"),
        Some(&b"app-value".to_vec())
    );
}

#[tokio::test]
async fn test_shrink_from_three_to_one_member() {
    let cluster = TestCluster::new(&["a", "b", "c"], spec(1, "3.5.7")).await;
    for name in ["a", "b", "c"] {
        cluster.peer(name).seed_running("tok-1", "3.5.7");
    }

    cluster.tick().await.unwrap();
    cluster.tick().await.unwrap();

    // Only the survivor remains a member and a process.
    assert_eq!(cluster.db.members.lock().len(), 1);
    assert!(cluster.running("a").is_some());
    assert!(cluster.running("b").is_none());
    assert!(cluster.running("c").is_none());

    // For each removal the database was told before the process stopped.
    let events = cluster.events();
    for victim in ["b", "c"] {
        let stopped = events
            .iter()
            .position(
                |e| matches!(e, Event::ReplicaStopped { peer } if *peer == PeerId::from(victim)),
            )
            .unwrap();
        let removed_before_stop = events[..stopped]
            .iter()
            .any(|e| matches!(e, Event::MemberRemoved { .. }));
        assert!(removed_before_stop, "member-remove must precede StopEtcd");
    }
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::MemberRemoved { .. }))
            .count(),
        2
    );

    // The controller stays leader throughout.
    assert!(cluster.elector.is_leader());
}

#[tokio::test]
async fn test_rolling_upgrade_one_member_per_tick() {
    let cluster = TestCluster::new(&["a", "b", "c"], spec(3, "3.5.10")).await;
    for name in ["a", "b", "c"] {
        cluster.peer(name).seed_running("tok-1", "3.5.7");
    }

    for _ in 0..3 {
        cluster.tick().await.unwrap();
    }

    for name in ["a", "b", "c"] {
        let running = cluster.running(name).expect("replica gone");
        assert_eq!(running.version, "3.5.10");
        assert_eq!(running.token, "tok-1");
    }

    // Exactly one stop/respawn pair per member, never two members down at
    // once.
    let events = cluster.events();
    let stops = events
        .iter()
        .filter(|e| matches!(e, Event::ReplicaStopped { .. }))
        .count();
    assert_eq!(stops, 3);
    let mut down: Option<PeerId> = None;
    for event in &events {
        match event {
            Event::ReplicaStopped { peer } => {
                assert!(down.is_none(), "two members down simultaneously");
                down = Some(peer.clone());
            }
            Event::ReplicaStarted { peer, .. } => {
                if down.as_ref() == Some(peer) {
                    down = None;
                }
            }
            _ => {}
        }
    }

    cluster.tick().await.unwrap();
    assert_eq!(*cluster.status_rx.borrow(), ControllerStatus::Idle);
}

#[tokio::test]
async fn test_split_brain_quarantines_and_halts() {
    let cluster = TestCluster::new(&["a", "b", "c"], spec(3, "3.5.7")).await;
    cluster.peer("a").seed_running("tok-1", "3.5.7");
    cluster.peer("b").seed_running("tok-1", "3.5.7");
    cluster.peer("c").seed_running("tok-2", "3.5.7");

    cluster.tick().await.unwrap();

    // The minority token holder is isolated from clients but keeps
    // replicating.
    let c = cluster.running("c").expect("c must keep running");
    assert!(c.quarantined);
    assert_eq!(c.token, "tok-2");
    assert!(matches!(
        *cluster.status_rx.borrow(),
        ControllerStatus::SplitBrain { .. }
    ));

    // With the offender quarantined, the controller refuses to reconfigure
    // anything until the operator resolves the condition.
    let events_before = cluster.events().len();
    cluster.tick().await.unwrap();
    assert!(matches!(
        *cluster.status_rx.borrow(),
        ControllerStatus::SplitBrain { .. }
    ));
    let new_events: Vec<_> = cluster.events()[events_before..].to_vec();
    assert!(
        new_events
            .iter()
            .all(|e| !matches!(e, Event::MemberAdded { .. } | Event::MemberRemoved { .. })),
        "destructive work during split brain: {new_events:?}"
    );
}

#[tokio::test]
async fn test_backups_are_taken_from_the_smallest_healthy_member() {
    let mut spec = spec(3, "3.5.7");
    spec.backup_interval = Some(std::time::Duration::from_secs(60));
    spec.backup_retention = Some(std::time::Duration::from_secs(24 * 3600));
    let cluster = TestCluster::new(&["a", "b", "c"], spec).await;
    for name in ["a", "b", "c"] {
        cluster.peer(name).seed_running("tok-1", "3.5.7");
    }
    cluster.db.kv.lock().insert("k".to_string(), b"v".to_vec());

    // One tick to acquire leadership and publish the observed state.
    cluster.tick().await.unwrap();

    let controller = BackupController::new(
        cluster.transport.clone(),
        cluster.elector.clone(),
        cluster.backup_store.clone(),
        cluster.spec_store.clone(),
        spec_with_backups(),
        cluster.state_rx.clone(),
    );
    controller.run_once().await.unwrap();

    let keys = cluster.backup_store.list("tok-1/").await.unwrap();
    assert_eq!(keys.len(), 1, "exactly one snapshot expected: {keys:?}");

    // The snapshot content is the keyspace at backup time.
    let blob = cluster.backup_store.get(&keys[0]).await.unwrap();
    let restored: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&blob).unwrap();
    assert_eq!(restored.get("k"), Some(&b"v".to_vec()));

    // Within the interval no second snapshot is taken.
    controller.run_once().await.unwrap();
    assert_eq!(cluster.backup_store.list("tok-1/").await.unwrap().len(), 1);
}

fn spec_with_backups() -> ClusterSpec {
    let mut s = spec(3, "3.5.7");
    s.backup_interval = Some(std::time::Duration::from_secs(60));
    s.backup_retention = Some(std::time::Duration::from_secs(24 * 3600));
    s
}

#[tokio::test]
async fn test_restore_from_backup_rebuilds_the_cluster() {
    let cluster = TestCluster::new(&["a", "b", "c"], spec(3, "3.5.7")).await;
    for name in ["a", "b", "c"] {
        cluster.peer(name).seed_running("old-token", "3.5.7");
    }
    cluster.db.kv.lock().insert("k".to_string(), b"v1".to_vec());

    // A backup taken when k=v2 sits in the store.
    let mut snapshot = BTreeMap::new();
    snapshot.insert("k".to_string(), b"v2".to_vec());
    let backup_ref = "old-token/2026-01-01T00-00-00Z";
    cluster
        .backup_store
        .put(backup_ref, &serde_json::to_vec(&snapshot).unwrap())
        .await
        .unwrap();

    cluster
        .command_store
        .add(&restore_command(backup_ref))
        .await
        .unwrap();

    cluster.tick().await.unwrap();

    // All replicas stopped before anything touched the data.
    let events = cluster.events();
    let last_stop = events
        .iter()
        .rposition(|e| matches!(e, Event::ReplicaStopped { .. }))
        .unwrap();
    let restore_pos = events
        .iter()
        .position(|e| matches!(e, Event::SnapshotRestored { .. }))
        .unwrap();
    assert!(last_stop < restore_pos);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::ReplicaStopped { .. }))
            .count(),
        3
    );

    // The target was restored, the others wiped.
    assert!(matches!(
        events[restore_pos],
        Event::SnapshotRestored { ref peer, .. } if *peer == PeerId::from("a")
    ));
    for name in ["b", "c"] {
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::DataDirWiped { peer } if *peer == PeerId::from(name)))
        );
        assert!(cluster.running(name).is_none());
    }

    // The restored peer boots a fresh one-member incarnation with
    // force-new-cluster set.
    let restored = cluster.running("a").expect("restored peer not running");
    assert_ne!(restored.token, "old-token");
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ReplicaStarted { peer, force_new_cluster: true, state: InitialClusterState::New, .. }
            if *peer == PeerId::from("a")
    )));

    // The command is consumed and the snapshot data is back.
    assert!(cluster.command_store.list().await.unwrap().is_empty());
    assert_eq!(cluster.db.kv.lock().get("k"), Some(&b"v2".to_vec()));

    // The following ticks grow the cluster back to the desired size.
    cluster.tick().await.unwrap();
    cluster.tick().await.unwrap();
    for name in ["b", "c"] {
        assert_eq!(cluster.running(name).unwrap().token, restored.token);
    }
    assert_eq!(cluster.db.members.lock().len(), 3);
    assert_eq!(cluster.db.kv.lock().get("k"), Some(&b"v2".to_vec()));
}
