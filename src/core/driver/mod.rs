// src/core/driver/mod.rs

//! Executes the action the reconciler selected.
//!
//! Every action runs under the per-action deadline and returns
//! `ActionOutcome { done }`: `done` with no error advances the spec,
//! `!done` means preconditions were not met (benign), and an error is
//! logged and re-evaluated next tick. Partial failures roll back on the
//! next tick rather than inline wherever the protocol allows it.

mod create;
mod members;
mod quarantine;
mod restore;
mod upgrade;

use crate::core::client::{PeerClient, Transport};
use crate::core::election::LeaderElector;
use crate::core::errors::KeeperError;
use crate::core::etcd::EtcdApi;
use crate::core::observer::{EtcdClusterState, reachable_client_urls};
use crate::core::protocol::{
    ClusterSpec, EtcdNode, MemberMap, PeerInfo, RpcHeader, build_member_map,
};
use crate::core::reconciler::Action;
use crate::core::urls;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub done: bool,
}

impl ActionOutcome {
    pub const DONE: Self = Self { done: true };
    pub const NOT_YET: Self = Self { done: false };
}

pub struct ReconfigDriver {
    transport: Arc<dyn Transport>,
    elector: Arc<LeaderElector>,
    etcd: Arc<dyn EtcdApi>,
    tls_enabled: bool,
    dns_suffix: Option<String>,
    bin_roots: Vec<PathBuf>,
    rpc_timeout: Duration,
    action_timeout: Duration,
}

impl ReconfigDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        elector: Arc<LeaderElector>,
        etcd: Arc<dyn EtcdApi>,
        tls_enabled: bool,
        dns_suffix: Option<String>,
        bin_roots: Vec<PathBuf>,
        rpc_timeout: Duration,
        action_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            elector,
            etcd,
            tls_enabled,
            dns_suffix,
            bin_roots,
            rpc_timeout,
            action_timeout,
        }
    }

    pub async fn execute(
        &self,
        action: Action,
        state: &EtcdClusterState,
        spec: &ClusterSpec,
    ) -> Result<ActionOutcome, KeeperError> {
        let header = self
            .elector
            .leader_header()
            .ok_or_else(|| KeeperError::Precondition("leadership lost before acting".into()))?;
        match timeout(self.action_timeout, self.dispatch(action, state, spec, header)).await {
            Ok(result) => result,
            Err(_) => Err(KeeperError::Timeout(format!(
                "action exceeded {:?}; partial work rolls back next tick",
                self.action_timeout
            ))),
        }
    }

    async fn dispatch(
        &self,
        action: Action,
        state: &EtcdClusterState,
        spec: &ClusterSpec,
        header: RpcHeader,
    ) -> Result<ActionOutcome, KeeperError> {
        match action {
            Action::Create => create::create_new_cluster(self, state, spec, header).await,
            Action::Restore(command) => {
                restore::restore_from_backup(self, state, spec, header, &command).await
            }
            Action::StopCluster(_) => self.stop_cluster(state, header).await,
            Action::AddMember(peer_id) => {
                members::add_member(self, state, spec, header, &peer_id).await
            }
            Action::RemoveMember(member_id) => {
                members::remove_member(self, state, spec, header, member_id).await
            }
            Action::Upgrade(member_id) => {
                upgrade::upgrade_member(self, state, spec, header, member_id).await
            }
            Action::Quarantine { peer, .. } => {
                quarantine::quarantine_peer(self, state, header, &peer).await
            }
            Action::None => Ok(ActionOutcome::NOT_YET),
        }
    }

    pub(super) fn client_for(&self, info: &PeerInfo) -> PeerClient {
        PeerClient::new(
            info.peer_id.clone(),
            info.endpoints.clone(),
            self.transport.clone(),
        )
    }

    /// Clones a peer's proposed node identity with URL schemes rewritten to
    /// honor the cluster TLS policy.
    pub(super) fn materialize_node(&self, info: &PeerInfo) -> EtcdNode {
        let mut node = info.node_config.clone();
        let (from, to) = if self.tls_enabled {
            ("http://", "https://")
        } else {
            ("https://", "http://")
        };
        node.peer_urls = urls::rewrite_scheme(&node.peer_urls, from, to);
        node.client_urls = urls::rewrite_scheme(&node.client_urls, from, to);
        node.quarantined_client_urls = urls::rewrite_scheme(&node.quarantined_client_urls, from, to);
        node.tls_enabled = self.tls_enabled;
        node
    }

    /// Builds the member map for a set of proposed nodes, resolving each
    /// node's addresses from its supervisor's discovery endpoints.
    pub(super) fn member_map_for(&self, state: &EtcdClusterState, nodes: &[EtcdNode]) -> MemberMap {
        let mut endpoints_by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for info in state.peers.values() {
            let addresses = info
                .endpoints
                .iter()
                .map(|e| {
                    e.rsplit_once(':')
                        .map(|(host, _)| host.to_string())
                        .unwrap_or_else(|| e.clone())
                })
                .collect();
            endpoints_by_name.insert(info.node_config.name.clone(), addresses);
        }
        build_member_map(nodes, &endpoints_by_name, self.dns_suffix.as_deref())
    }

    /// Broadcasts the member map to every usable peer. The broadcast must
    /// succeed for all of them before any process-start instruction that
    /// depends on it.
    pub(super) async fn broadcast_member_map(
        &self,
        state: &EtcdClusterState,
        member_map: &MemberMap,
        header: &RpcHeader,
    ) -> Result<(), KeeperError> {
        let mut broadcasts = JoinSet::new();
        for info in state.peers.values() {
            let client = self.client_for(info);
            let header = header.clone();
            let member_map = member_map.clone();
            let deadline = self.rpc_timeout;
            broadcasts.spawn(async move {
                client
                    .update_member_map(header, member_map, deadline)
                    .await
                    .map_err(|e| (client.peer_id.clone(), e))
            });
        }
        let mut failures = Vec::new();
        while let Some(joined) = broadcasts.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((peer_id, e))) => failures.push(format!("{peer_id}: {e}")),
                Err(e) => failures.push(format!("broadcast task: {e}")),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(KeeperError::Transport(format!(
                "unable to broadcast member map: {}",
                failures.join("; ")
            )))
        }
    }

    /// Stops etcd wherever it is running. Aborts on the first failure.
    pub(super) async fn stop_running(
        &self,
        state: &EtcdClusterState,
        header: &RpcHeader,
    ) -> Result<(), KeeperError> {
        for (peer_id, info) in state.running_peers() {
            let client = self.client_for(info);
            let was_running = client.stop_etcd(header.clone()).await.map_err(|e| {
                KeeperError::Transport(format!("stopping etcd on peer {peer_id}: {e}"))
            })?;
            info!("stopped etcd on peer {} (was_running={})", peer_id, was_running);
        }
        Ok(())
    }

    async fn stop_cluster(
        &self,
        state: &EtcdClusterState,
        header: RpcHeader,
    ) -> Result<ActionOutcome, KeeperError> {
        warn!("executing operator STOP: stopping etcd on every peer");
        self.stop_running(state, &header).await?;
        Ok(ActionOutcome::DONE)
    }

    /// Client URLs of some healthy running replica, used for membership
    /// calls against the database.
    pub(super) fn any_member_client_urls(
        &self,
        state: &EtcdClusterState,
        exclude_member: Option<u64>,
    ) -> Result<Vec<String>, KeeperError> {
        for member in state.members.values() {
            if Some(member.member_id) == exclude_member {
                continue;
            }
            if !state.healthy_members.contains(&member.member_id) {
                continue;
            }
            if let Some(peer_id) = state.peer_for_member(member)
                && let Some(info) = state.peers.get(peer_id)
            {
                return Ok(reachable_client_urls(info));
            }
        }
        Err(KeeperError::Precondition(
            "no healthy replica reachable for a membership call".into(),
        ))
    }

    /// Rebuilds the node list of the currently running cluster, in member
    /// order, from the peers serving each member.
    pub(super) fn current_nodes(&self, state: &EtcdClusterState) -> Vec<EtcdNode> {
        state
            .members
            .values()
            .filter_map(|member| {
                let peer_id = state.peer_for_member(member)?;
                state.peers.get(peer_id).map(|info| self.materialize_node(info))
            })
            .collect()
    }

    pub(super) fn etcd(&self) -> &Arc<dyn EtcdApi> {
        &self.etcd
    }

    pub(super) fn bin_roots(&self) -> &[PathBuf] {
        &self.bin_roots
    }
}
