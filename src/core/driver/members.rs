// src/core/driver/members.rs

//! Growing and shrinking the member set, one member per tick.

use super::{ActionOutcome, ReconfigDriver};
use crate::core::errors::KeeperError;
use crate::core::observer::EtcdClusterState;
use crate::core::protocol::{ClusterSpec, InitialClusterState, JoinPhase, PeerId, RpcHeader};
use crate::core::quorum_size;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

/// How long a freshly added member gets to start and join quorum.
const MEMBER_START_DEADLINE: Duration = Duration::from_secs(120);
const MEMBER_START_POLL: Duration = Duration::from_secs(2);

pub(super) async fn add_member(
    driver: &ReconfigDriver,
    state: &EtcdClusterState,
    spec: &ClusterSpec,
    header: RpcHeader,
    peer_id: &PeerId,
) -> Result<ActionOutcome, KeeperError> {
    // The member set must be stable and healthy before it grows.
    if state
        .members
        .keys()
        .any(|id| !state.healthy_members.contains(id))
    {
        info!("not all members healthy; deferring member add");
        return Ok(ActionOutcome::NOT_YET);
    }

    let Some(info) = state.peers.get(peer_id) else {
        return Ok(ActionOutcome::NOT_YET);
    };
    let tokens = state.cluster_tokens();
    let Some(cluster_token) = tokens.iter().next() else {
        return Err(KeeperError::Precondition(
            "no running cluster to add a member to".into(),
        ));
    };

    let new_node = driver.materialize_node(info);
    let membership_urls = driver.any_member_client_urls(state, None)?;

    // Step 1: the database assigns the member id; this is also the point
    // where quorum arithmetic changes.
    let member_id = driver
        .etcd()
        .member_add(&membership_urls, &new_node.peer_urls)
        .await?;
    info!(
        "database assigned member id {:x} to peer {}",
        member_id, peer_id
    );

    // Step 2: everyone learns the new addressing before the process starts.
    let mut nodes = driver.current_nodes(state);
    nodes.push(new_node.clone());
    let member_map = driver.member_map_for(state, &nodes);
    driver
        .broadcast_member_map(state, &member_map, &header)
        .await?;

    // Step 3: start the replica against the existing cluster.
    let client = driver.client_for(info);
    let joined = client
        .join_cluster(
            header.clone(),
            JoinPhase::InitialCluster,
            cluster_token,
            &spec.etcd_version,
            nodes,
            InitialClusterState::Existing,
            false,
            false,
        )
        .await;

    // Step 4: verify the member starts and participates, or undo the
    // membership change so quorum arithmetic is restored.
    let verified = match joined {
        Ok(()) => wait_member_started(driver, &membership_urls, member_id).await,
        Err(e) => {
            warn!("starting etcd on new member {}: {}", peer_id, e);
            false
        }
    };
    if !verified {
        warn!(
            "new member {:x} on peer {} did not start in time; removing it again",
            member_id, peer_id
        );
        driver
            .etcd()
            .member_remove(&membership_urls, member_id)
            .await?;
        return Err(KeeperError::Transport(format!(
            "member add of peer {peer_id} failed; rolled back"
        )));
    }

    Ok(ActionOutcome::DONE)
}

async fn wait_member_started(
    driver: &ReconfigDriver,
    membership_urls: &[String],
    member_id: u64,
) -> bool {
    let deadline = Instant::now() + MEMBER_START_DEADLINE;
    while Instant::now() < deadline {
        match driver.etcd().member_list(membership_urls).await {
            // etcd reports an empty name until the member has started and
            // caught up with the cluster.
            Ok(members) => {
                if members
                    .iter()
                    .any(|m| m.member_id == member_id && !m.name.is_empty())
                {
                    return true;
                }
            }
            Err(e) => warn!("member list while awaiting member start: {}", e),
        }
        sleep(MEMBER_START_POLL).await;
    }
    false
}

pub(super) async fn remove_member(
    driver: &ReconfigDriver,
    state: &EtcdClusterState,
    _spec: &ClusterSpec,
    header: RpcHeader,
    member_id: u64,
) -> Result<ActionOutcome, KeeperError> {
    let Some(member) = state.members.get(&member_id) else {
        return Ok(ActionOutcome::NOT_YET);
    };

    // Quorum guard: the survivors must still hold a majority of the
    // shrunken membership.
    let healthy_survivors = state
        .healthy_members
        .iter()
        .filter(|id| **id != member_id)
        .count();
    let remaining = state.members.len() - 1;
    if remaining > 0 && healthy_survivors < quorum_size(remaining) {
        info!(
            "removing member {:x} would leave {} healthy of quorum {}; refusing",
            member_id,
            healthy_survivors,
            quorum_size(remaining)
        );
        return Ok(ActionOutcome::NOT_YET);
    }

    // The database is told first so quorum is recomputed before the
    // process stops.
    let membership_urls = driver.any_member_client_urls(state, Some(member_id))?;
    driver
        .etcd()
        .member_remove(&membership_urls, member_id)
        .await?;
    info!("removed member {:x} ({}) from the cluster", member_id, member.name);

    if let Some(peer_id) = state.peer_for_member(member) {
        if let Some(info) = state.peers.get(peer_id) {
            let client = driver.client_for(info);
            client.stop_etcd(header.clone()).await?;
            info!("stopped etcd on removed peer {}", peer_id);
        }
    } else {
        warn!(
            "no usable peer serves removed member {:x}; its process will stop on its own supervisor",
            member_id
        );
    }

    let nodes = driver.current_nodes(state);
    let nodes: Vec<_> = nodes
        .into_iter()
        .filter(|n| n.name != member.name)
        .collect();
    let member_map = driver.member_map_for(state, &nodes);
    driver
        .broadcast_member_map(state, &member_map, &header)
        .await?;

    Ok(ActionOutcome::DONE)
}
