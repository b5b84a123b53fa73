// src/core/driver/create.rs

//! Bootstrapping a new cluster through the two-phase JOIN protocol.

use super::{ActionOutcome, ReconfigDriver};
use crate::core::errors::KeeperError;
use crate::core::etcd::process::bindir_for_version;
use crate::core::observer::EtcdClusterState;
use crate::core::protocol::{
    ClusterSpec, InitialClusterState, JoinPhase, RpcHeader, random_cluster_token,
};
use crate::core::quorum_size;
use crate::core::specstore::SPEC_MIRROR_KEY;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::info;

pub(super) async fn create_new_cluster(
    driver: &ReconfigDriver,
    state: &EtcdClusterState,
    spec: &ClusterSpec,
    header: RpcHeader,
) -> Result<ActionOutcome, KeeperError> {
    let desired_member_count = spec.member_count as usize;
    let desired_quorum = quorum_size(desired_member_count);

    if state.peers.len() < desired_quorum {
        info!(
            "insufficient peers ({}) to form a quorum of {}; won't proceed",
            state.peers.len(),
            desired_quorum
        );
        return Ok(ActionOutcome::NOT_YET);
    }

    if state.peers.len() < desired_member_count {
        // As a special case, one peer short is tolerable when the quorum
        // size works out the same; the cluster can still form.
        if quorum_size(state.peers.len()) == desired_quorum {
            info!(
                "fewer peers ({}) than desired members ({}), but quorum size matches; proceeding",
                state.peers.len(),
                desired_member_count
            );
        } else {
            info!(
                "insufficient peers ({}) to form the full cluster of {}; won't proceed",
                state.peers.len(),
                desired_member_count
            );
            return Ok(ActionOutcome::NOT_YET);
        }
    }

    // Creating a cluster at a version nobody installed would strand every
    // peer in PREPARE; check the local install as a cheap sanity gate.
    bindir_for_version(driver.bin_roots(), &spec.etcd_version, "etcd").await?;

    let cluster_token = random_cluster_token();

    let proposal: Vec<_> = state
        .peers
        .values()
        .take(desired_member_count)
        .collect();
    if proposal.len() < desired_member_count
        && quorum_size(proposal.len()) < desired_quorum
    {
        return Err(KeeperError::Invariant(
            "proposal too small: would need dummy peers to force the quorum size".into(),
        ));
    }

    let proposed_nodes: Vec<_> = proposal
        .iter()
        .map(|info| driver.materialize_node(info))
        .collect();

    // Stop any etcd that is still running anywhere before proposing.
    driver.stop_running(state, &header).await?;

    // Everyone must agree on addressing before any process starts.
    let member_map = driver.member_map_for(state, &proposed_nodes);
    driver
        .broadcast_member_map(state, &member_map, &header)
        .await?;

    info!(
        "starting new etcd cluster with token {} across {} peers",
        cluster_token,
        proposal.len()
    );

    for phase in [JoinPhase::Prepare, JoinPhase::InitialCluster] {
        for info in &proposal {
            // Note that we may send the message to ourselves.
            let client = driver.client_for(info);
            client
                .join_cluster(
                    header.clone(),
                    phase,
                    &cluster_token,
                    &spec.etcd_version,
                    proposed_nodes.clone(),
                    InitialClusterState::New,
                    false,
                    false,
                )
                .await
                .map_err(|e| {
                    KeeperError::Transport(format!(
                        "JoinCluster({phase:?}) to peer {}: {e}; un-committed PREPAREs expire at their peers",
                        info.peer_id
                    ))
                })?;
        }
    }

    write_spec_mirror(driver, &proposed_nodes[0].client_urls, spec).await?;

    Ok(ActionOutcome::DONE)
}

/// Mirrors the spec into the database itself for cross-checking. A freshly
/// booted cluster takes a few seconds to serve writes, so this polls until
/// the put lands or its window closes.
pub(super) async fn write_spec_mirror(
    driver: &ReconfigDriver,
    client_urls: &[String],
    spec: &ClusterSpec,
) -> Result<(), KeeperError> {
    const WRITE_DEADLINE: Duration = Duration::from_secs(60);
    const WRITE_POLL: Duration = Duration::from_secs(2);

    let body = serde_json::to_vec(spec)
        .map_err(|e| KeeperError::Storage(format!("encoding cluster spec: {e}")))?;
    let deadline = Instant::now() + WRITE_DEADLINE;
    loop {
        match driver.etcd().put(client_urls, SPEC_MIRROR_KEY, &body).await {
            Ok(()) => return Ok(()),
            Err(e) if Instant::now() + WRITE_POLL < deadline => {
                info!("cluster not yet serving writes ({}); retrying spec mirror", e);
                sleep(WRITE_POLL).await;
            }
            Err(e) => return Err(e),
        }
    }
}
