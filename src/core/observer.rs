// src/core/observer.rs

//! Aggregates peer reports into a per-tick cluster snapshot.
//!
//! The snapshot is assembled fresh on every tick and never persisted. It is
//! handed down the call chain immutably; nothing holds a back-reference to
//! the registry.

use crate::core::etcd::EtcdApi;
use crate::core::protocol::{ClusterMember, PeerId, PeerInfo};
use crate::core::registry::PeerRegistry;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything the reconciler knows about the world this tick.
#[derive(Debug, Clone, Default)]
pub struct EtcdClusterState {
    /// Usable peers only; the reconciler counts nothing else.
    pub peers: BTreeMap<PeerId, PeerInfo>,
    /// Members as reported by the database itself.
    pub members: BTreeMap<u64, ClusterMember>,
    /// Members whose serving replica passed its health check.
    pub healthy_members: BTreeSet<u64>,
    /// Set when peer reports and member lists disagree; such a tick is
    /// diagnostic-only and drives no reconfiguration.
    pub diagnostic_only: bool,
}

impl EtcdClusterState {
    /// Peers currently running an etcd process.
    pub fn running_peers(&self) -> impl Iterator<Item = (&PeerId, &PeerInfo)> {
        self.peers
            .iter()
            .filter(|(_, info)| info.etcd_state.is_some())
    }

    /// Distinct cluster tokens carried by running replicas. More than one
    /// means split brain.
    pub fn cluster_tokens(&self) -> BTreeSet<String> {
        self.running_peers()
            .filter_map(|(_, info)| info.etcd_state.as_ref())
            .map(|s| s.cluster_token.clone())
            .collect()
    }

    pub fn member_id_for_name(&self, name: &str) -> Option<u64> {
        self.members
            .values()
            .find(|m| m.name == name)
            .map(|m| m.member_id)
    }

    /// The peer serving a given member, matched by node name.
    pub fn peer_for_member(&self, member: &ClusterMember) -> Option<&PeerId> {
        self.peers
            .iter()
            .find(|(_, info)| info.node_config.name == member.name)
            .map(|(id, _)| id)
    }
}

/// Client URLs to reach a peer's replica, honoring quarantine.
pub fn reachable_client_urls(info: &PeerInfo) -> Vec<String> {
    match info.etcd_state.as_ref() {
        Some(state) if state.quarantined => info.node_config.quarantined_client_urls.clone(),
        _ => info.node_config.client_urls.clone(),
    }
}

pub struct Observer {
    registry: Arc<PeerRegistry>,
    etcd: Arc<dyn EtcdApi>,
}

impl Observer {
    pub fn new(registry: Arc<PeerRegistry>, etcd: Arc<dyn EtcdApi>) -> Self {
        Self { registry, etcd }
    }

    /// Builds this tick's snapshot: usable peers from the registry, member
    /// lists and health from every running replica.
    pub async fn observe(&self) -> EtcdClusterState {
        let peers: BTreeMap<PeerId, PeerInfo> = self
            .registry
            .usable_peers()
            .into_iter()
            .filter_map(|(id, view)| view.info.map(|info| (id, info)))
            .collect();

        let mut state = EtcdClusterState {
            peers,
            ..Default::default()
        };

        let queries = state
            .running_peers()
            .map(|(peer_id, info)| {
                let urls = reachable_client_urls(info);
                let etcd = self.etcd.clone();
                let peer_id = peer_id.clone();
                let node_name = info.node_config.name.clone();
                let token = info
                    .etcd_state
                    .as_ref()
                    .map(|s| s.cluster_token.clone())
                    .unwrap_or_default();
                async move {
                    let members = etcd.member_list(&urls).await;
                    let healthy = etcd.health(&urls).await.unwrap_or(false);
                    (peer_id, node_name, token, members, healthy)
                }
            })
            .collect::<Vec<_>>();

        // Replicas of one cluster incarnation must agree on the member
        // set; during split brain the incarnations legitimately differ, so
        // the comparison is per token.
        let mut sets_by_token: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        let mut healthy_names: BTreeSet<String> = BTreeSet::new();

        for (peer_id, node_name, token, members, healthy) in join_all(queries).await {
            if healthy {
                healthy_names.insert(node_name);
            }
            match members {
                Ok(members) => {
                    let set: BTreeSet<u64> = members.iter().map(|m| m.member_id).collect();
                    if let Some(previous) = sets_by_token.get(&token) {
                        if *previous != set {
                            warn!(
                                "replicas of cluster {} disagree on the member set; downgrading tick to diagnostic-only",
                                token
                            );
                            state.diagnostic_only = true;
                        }
                    } else {
                        sets_by_token.insert(token, set);
                    }
                    for member in members {
                        if let Some(existing) = state.members.get(&member.member_id)
                            && existing.name != member.name
                        {
                            warn!(
                                "member {} reported as {:?} and {:?}; downgrading tick to diagnostic-only",
                                member.member_id, existing.name, member.name
                            );
                            state.diagnostic_only = true;
                        }
                        state.members.insert(member.member_id, member);
                    }
                }
                Err(e) => debug!("member list via {} failed: {}", peer_id, e),
            }
        }

        state.healthy_members = state
            .members
            .values()
            .filter(|m| healthy_names.contains(&m.name))
            .map(|m| m.member_id)
            .collect();

        state
    }
}
