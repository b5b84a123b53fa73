// src/core/driver/upgrade.rs

//! Rolling version upgrade, one member per tick.
//!
//! The reconciler selects the mismatched member with the lowest id, so the
//! roll proceeds in a deterministic order across ticks. A failure leaves
//! the cluster mixed-version but quorum-preserving; the next tick retries.

use super::{ActionOutcome, ReconfigDriver};
use crate::core::errors::KeeperError;
use crate::core::observer::{EtcdClusterState, reachable_client_urls};
use crate::core::protocol::{ClusterSpec, InitialClusterState, JoinPhase, RpcHeader};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

const HEALTHY_DEADLINE: Duration = Duration::from_secs(120);
const HEALTHY_POLL: Duration = Duration::from_secs(2);

pub(super) async fn upgrade_member(
    driver: &ReconfigDriver,
    state: &EtcdClusterState,
    spec: &ClusterSpec,
    header: RpcHeader,
    member_id: u64,
) -> Result<ActionOutcome, KeeperError> {
    let Some(member) = state.members.get(&member_id) else {
        return Ok(ActionOutcome::NOT_YET);
    };
    // Upgrading must never cost quorum: every other member stays up, so
    // they must all be healthy before this one restarts.
    if state
        .members
        .keys()
        .any(|id| *id != member_id && !state.healthy_members.contains(id))
    {
        info!("other members unhealthy; deferring upgrade of {:x}", member_id);
        return Ok(ActionOutcome::NOT_YET);
    }

    let Some(peer_id) = state.peer_for_member(member) else {
        return Ok(ActionOutcome::NOT_YET);
    };
    let info = &state.peers[peer_id];
    let Some(etcd_state) = info.etcd_state.as_ref() else {
        return Ok(ActionOutcome::NOT_YET);
    };

    info!(
        "upgrading member {:x} on peer {} from {} to {}",
        member_id, peer_id, etcd_state.etcd_version, spec.etcd_version
    );

    let nodes = driver.current_nodes(state);
    let client = driver.client_for(info);

    client.stop_etcd(header.clone()).await?;
    client
        .join_cluster(
            header.clone(),
            JoinPhase::InitialCluster,
            &etcd_state.cluster_token,
            &spec.etcd_version,
            nodes,
            InitialClusterState::Existing,
            false,
            etcd_state.quarantined,
        )
        .await?;

    // Wait until the member reports healthy and in sync before the roll
    // may continue with the next member.
    let client_urls = reachable_client_urls(info);
    let deadline = Instant::now() + HEALTHY_DEADLINE;
    loop {
        if driver.etcd().health(&client_urls).await.unwrap_or(false) {
            info!("member {:x} healthy at {}", member_id, spec.etcd_version);
            return Ok(ActionOutcome::DONE);
        }
        if Instant::now() >= deadline {
            warn!(
                "member {:x} did not report healthy after upgrade; cluster left mixed-version",
                member_id
            );
            return Err(KeeperError::Timeout(format!(
                "member {member_id:x} unhealthy after respawn at {}",
                spec.etcd_version
            )));
        }
        sleep(HEALTHY_POLL).await;
    }
}
