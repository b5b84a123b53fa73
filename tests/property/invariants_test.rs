// tests/property/invariants_test.rs

//! Invariants of the pure decision helpers.

use chrono::{TimeZone, Utc};
use etcdkeeper::core::backup::plan_retention;
use etcdkeeper::core::observer::EtcdClusterState;
use etcdkeeper::core::protocol::{ClusterMember, ClusterSpec, EtcdNode, EtcdState, PeerId, PeerInfo};
use etcdkeeper::core::quorum_size;
use etcdkeeper::core::reconciler::{Action, DecisionContext, decide};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

proptest! {
    #[test]
    fn quorum_is_a_strict_majority(n in 1usize..100) {
        let q = quorum_size(n);
        // A quorum is more than half, and two quorums always intersect.
        prop_assert!(q * 2 > n);
        prop_assert!(q <= n);
        prop_assert_eq!(quorum_size(n), n / 2 + 1);
    }

    #[test]
    fn retention_never_deletes_inside_the_window(
        offsets in prop::collection::vec(0i64..90 * 24 * 3600, 1..40),
        retention_hours in 1i64..72,
    ) {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let retention = Duration::from_secs(retention_hours as u64 * 3600);
        let entries: Vec<(String, _)> = offsets
            .iter()
            .enumerate()
            .map(|(i, secs)| (format!("tok/{i}"), now - chrono::Duration::seconds(*secs)))
            .collect();

        let doomed = plan_retention(&entries, now, retention);

        for (key, taken_at) in &entries {
            let age = now.signed_duration_since(*taken_at);
            if age.num_seconds() <= retention_hours * 3600 {
                prop_assert!(!doomed.contains(key), "deleted in-window backup {}", key);
            }
        }
        // The newest backup survives unless it has aged past the last
        // bucket horizon entirely.
        let newest = entries.iter().max_by_key(|(_, t)| *t).unwrap();
        let newest_age = now.signed_duration_since(newest.1).num_seconds();
        if newest_age < 28 * 24 * 3600 {
            prop_assert!(!doomed.contains(&newest.0));
        }
    }
}

fn cluster_of(member_count: usize, healthy: &[bool], version: &str) -> EtcdClusterState {
    let mut state = EtcdClusterState::default();
    for i in 0..member_count {
        let name = format!("node-{i:02}");
        let id = i as u64 + 1;
        state.members.insert(
            id,
            ClusterMember {
                member_id: id,
                name: name.clone(),
                peer_urls: vec![format!("http://{name}:2380")],
                client_urls: vec![format!("http://{name}:2379")],
            },
        );
        if healthy.get(i).copied().unwrap_or(true) {
            state.healthy_members.insert(id);
        }
        state.peers.insert(
            PeerId(name.clone()),
            PeerInfo {
                peer_id: PeerId(name.clone()),
                endpoints: vec![format!("{name}:2480")],
                node_config: EtcdNode {
                    name: name.clone(),
                    peer_urls: vec![format!("http://{name}:2380")],
                    client_urls: vec![format!("http://{name}:2379")],
                    quarantined_client_urls: vec![format!("http://{name}:3994")],
                    tls_enabled: false,
                },
                etcd_state: Some(EtcdState {
                    cluster_token: "tok".to_string(),
                    member_id: id,
                    etcd_version: version.to_string(),
                    quarantined: false,
                }),
                zone: None,
            },
        );
    }
    state
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn removal_victims_are_always_current_members(
        member_count in 2usize..8,
        desired in 1u32..8,
        healthy in prop::collection::vec(any::<bool>(), 8),
    ) {
        let state = cluster_of(member_count, &healthy, "3.5.7");
        let spec = ClusterSpec {
            member_count: desired,
            etcd_version: "3.5.7".to_string(),
            backup_interval: None,
            backup_retention: None,
        };
        let streaks = BTreeMap::new();
        let action = decide(&DecisionContext {
            state: &state,
            spec: &spec,
            new_cluster_marker: false,
            commands: &[],
            unhealthy_streaks: &streaks,
            unhealthy_threshold: 3,
        });

        if let Action::RemoveMember(victim) = action {
            prop_assert!(state.members.contains_key(&victim));
            prop_assert!(member_count > desired as usize);
        }
    }

    #[test]
    fn a_converged_healthy_cluster_is_left_alone(member_count in 1usize..8) {
        let healthy = vec![true; member_count];
        let state = cluster_of(member_count, &healthy, "3.5.7");
        let spec = ClusterSpec {
            member_count: member_count as u32,
            etcd_version: "3.5.7".to_string(),
            backup_interval: None,
            backup_retention: None,
        };
        let streaks = BTreeMap::new();
        let action = decide(&DecisionContext {
            state: &state,
            spec: &spec,
            new_cluster_marker: false,
            commands: &[],
            unhealthy_streaks: &streaks,
            unhealthy_threshold: 3,
        });
        prop_assert_eq!(action, Action::None);
    }
}
