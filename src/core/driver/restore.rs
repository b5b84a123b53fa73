// src/core/driver/restore.rs

//! Disaster recovery: rebuilding the cluster from a backup snapshot.
//!
//! The steps are strictly ordered and destructive. Every peer stops; the
//! chosen peer stages the blob and runs the snapshot-restore tool, minting
//! a fresh cluster incarnation; every other peer wipes its data directory;
//! the restored peer then boots a one-member cluster with force-new-cluster
//! set. The grow back to the desired member count happens through ordinary
//! ADD_MEMBER actions on the following ticks.

use super::{ActionOutcome, ReconfigDriver, create};
use crate::core::errors::KeeperError;
use crate::core::observer::EtcdClusterState;
use crate::core::protocol::{
    ClusterSpec, Command, CommandKind, InitialClusterState, JoinPhase, RpcHeader,
    random_cluster_token,
};
use tracing::{info, warn};

pub(super) async fn restore_from_backup(
    driver: &ReconfigDriver,
    state: &EtcdClusterState,
    spec: &ClusterSpec,
    header: RpcHeader,
    command: &Command,
) -> Result<ActionOutcome, KeeperError> {
    let CommandKind::RestoreBackup { backup_ref } = &command.kind else {
        return Err(KeeperError::Precondition(format!(
            "command {} is not a restore",
            command.id
        )));
    };
    if state.peers.is_empty() {
        return Ok(ActionOutcome::NOT_YET);
    }

    warn!(
        "executing RESTORE from backup {:?}; this destroys current data",
        backup_ref
    );

    // Step 1: stop every replica. The restore must not race a live quorum.
    driver.stop_running(state, &header).await?;

    // The restore target is the first usable peer; deterministic, so a
    // re-driven restore lands on the same peer.
    let (target_id, target_info) = state
        .peers
        .iter()
        .next()
        .map(|(id, info)| (id.clone(), info.clone()))
        .ok_or_else(|| KeeperError::Precondition("no usable peer to restore onto".into()))?;

    let cluster_token = random_cluster_token();
    let restored_node = driver.materialize_node(&target_info);
    let restore_nodes = vec![restored_node.clone()];

    info!(
        "restoring backup {:?} onto peer {} as cluster incarnation {}",
        backup_ref, target_id, cluster_token
    );

    // Steps 2 and 3: stage and run the snapshot-restore on the target.
    let target_client = driver.client_for(&target_info);
    target_client
        .do_restore(
            header.clone(),
            Some(backup_ref.clone()),
            &cluster_token,
            &spec.etcd_version,
            restore_nodes.clone(),
        )
        .await?;

    // Step 4: wipe every other peer so nothing of the old incarnation can
    // resurface.
    for (peer_id, info) in &state.peers {
        if *peer_id == target_id {
            continue;
        }
        let client = driver.client_for(info);
        client
            .do_restore(
                header.clone(),
                None,
                &cluster_token,
                &spec.etcd_version,
                restore_nodes.clone(),
            )
            .await
            .map_err(|e| {
                KeeperError::Transport(format!("wiping data dir on peer {peer_id}: {e}"))
            })?;
        info!("wiped data directory on peer {}", peer_id);
    }

    // Step 5: boot the restored peer as a one-member cluster. Subsequent
    // ticks grow it back with ADD_MEMBER.
    let member_map = driver.member_map_for(state, &restore_nodes);
    driver
        .broadcast_member_map(state, &member_map, &header)
        .await?;

    for phase in [JoinPhase::Prepare, JoinPhase::InitialCluster] {
        target_client
            .join_cluster(
                header.clone(),
                phase,
                &cluster_token,
                &spec.etcd_version,
                restore_nodes.clone(),
                InitialClusterState::New,
                true,
                false,
            )
            .await?;
    }

    create::write_spec_mirror(driver, &restored_node.client_urls, spec).await?;

    info!(
        "restore complete; cluster {} now has one member and will grow to {}",
        cluster_token, spec.member_count
    );
    Ok(ActionOutcome::DONE)
}
