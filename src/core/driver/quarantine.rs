// src/core/driver/quarantine.rs

//! Isolating a misbehaving replica from normal clients.
//!
//! Quarantine rotates the advertised client URLs to the quarantined
//! variant, so external clients cannot reach the replica while peer URLs
//! stay unchanged and replication continues. A quarantined peer is excluded
//! from leader election and from ADD/REMOVE eligibility until it is
//! un-quarantined by the operator.

use super::{ActionOutcome, ReconfigDriver};
use crate::core::errors::KeeperError;
use crate::core::observer::EtcdClusterState;
use crate::core::protocol::{InitialClusterState, JoinPhase, PeerId, RpcHeader};
use tracing::{info, warn};

pub(super) async fn quarantine_peer(
    driver: &ReconfigDriver,
    state: &EtcdClusterState,
    header: RpcHeader,
    peer_id: &PeerId,
) -> Result<ActionOutcome, KeeperError> {
    let Some(info) = state.peers.get(peer_id) else {
        return Ok(ActionOutcome::NOT_YET);
    };
    let Some(etcd_state) = info.etcd_state.as_ref() else {
        info!("peer {} runs no etcd; nothing to quarantine", peer_id);
        return Ok(ActionOutcome::NOT_YET);
    };
    if etcd_state.quarantined {
        return Ok(ActionOutcome::NOT_YET);
    }

    warn!(
        "quarantining peer {} (token {})",
        peer_id, etcd_state.cluster_token
    );

    // The replica keeps its identity and data; it is merely respawned
    // advertising the quarantined client URLs. The node list covers every
    // peer sharing the offender's token, which during split brain is not
    // the canonical cluster.
    let nodes: Vec<_> = state
        .running_peers()
        .filter(|(_, other)| {
            other
                .etcd_state
                .as_ref()
                .is_some_and(|s| s.cluster_token == etcd_state.cluster_token)
        })
        .map(|(_, other)| driver.materialize_node(other))
        .collect();
    let client = driver.client_for(info);
    client.stop_etcd(header.clone()).await?;
    client
        .join_cluster(
            header,
            JoinPhase::InitialCluster,
            &etcd_state.cluster_token,
            &etcd_state.etcd_version,
            nodes,
            InitialClusterState::Existing,
            false,
            true,
        )
        .await?;

    info!("peer {} is quarantined", peer_id);
    Ok(ActionOutcome::DONE)
}
