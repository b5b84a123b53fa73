// src/core/backup/controller.rs

//! Periodic snapshots of the running cluster, driven by the leader.

use super::{BackupStore, parse_backup_key, plan_retention};
use crate::core::client::{PeerClient, Transport};
use crate::core::election::LeaderElector;
use crate::core::errors::KeeperError;
use crate::core::observer::EtcdClusterState;
use crate::core::protocol::{BackupInfo, ClusterSpec};
use crate::core::specstore::SpecStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time;
use tracing::{debug, info, warn};

/// How often the controller re-checks whether a backup is due.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct BackupController {
    transport: Arc<dyn Transport>,
    elector: Arc<LeaderElector>,
    store: Arc<dyn BackupStore>,
    spec_store: Arc<dyn SpecStore>,
    bootstrap_spec: ClusterSpec,
    state_rx: watch::Receiver<EtcdClusterState>,
    /// When the last backup attempt was made; failures also reset it so
    /// the retry waits one interval.
    last_attempt: Mutex<Option<Instant>>,
}

impl BackupController {
    pub fn new(
        transport: Arc<dyn Transport>,
        elector: Arc<LeaderElector>,
        store: Arc<dyn BackupStore>,
        spec_store: Arc<dyn SpecStore>,
        bootstrap_spec: ClusterSpec,
        state_rx: watch::Receiver<EtcdClusterState>,
    ) -> Self {
        Self {
            transport,
            elector,
            store,
            spec_store,
            bootstrap_spec,
            state_rx,
            last_attempt: Mutex::new(None),
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.elector.is_leader() {
                        continue;
                    }
                    if let Err(e) = self.run_once().await {
                        // Backup failure never blocks reconciliation.
                        warn!("backup cycle failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("backup controller shutting down");
                    return;
                }
            }
        }
    }

    /// One backup cycle: takes a snapshot when the interval has elapsed,
    /// then garbage-collects per the retention policy.
    pub async fn run_once(&self) -> Result<(), KeeperError> {
        let spec = self
            .spec_store
            .get()
            .await?
            .unwrap_or_else(|| self.bootstrap_spec.clone());
        let Some(backup_interval) = spec.backup_interval else {
            return Ok(());
        };

        {
            let mut last_attempt = self.last_attempt.lock();
            if last_attempt.is_some_and(|t| t.elapsed() < backup_interval) {
                return Ok(());
            }
            *last_attempt = Some(Instant::now());
        }

        let state = self.state_rx.borrow().clone();
        // A healthy, non-quarantined member; lexicographically smallest
        // peer id wins ties.
        let source = state
            .members
            .values()
            .filter(|m| state.healthy_members.contains(&m.member_id))
            .filter_map(|m| {
                let peer_id = state.peer_for_member(m)?;
                let info = state.peers.get(peer_id)?;
                let etcd_state = info.etcd_state.as_ref()?;
                (!etcd_state.quarantined).then_some((peer_id.clone(), info.clone(), etcd_state))
            })
            .min_by(|a, b| a.0.cmp(&b.0));
        let Some((peer_id, info, etcd_state)) = source else {
            debug!("no healthy member to back up");
            return Ok(());
        };

        let header = self
            .elector
            .leader_header()
            .ok_or_else(|| KeeperError::Precondition("leadership lost before backup".into()))?;
        let backup_info = BackupInfo {
            cluster_token: etcd_state.cluster_token.clone(),
            etcd_version: etcd_state.etcd_version.clone(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        let client = PeerClient::new(peer_id.clone(), info.endpoints.clone(), self.transport.clone());
        let backup_id = client.do_backup(header, backup_info).await?;
        info!("backup {} taken via peer {}", backup_id, peer_id);

        if let Some(retention) = spec.backup_retention {
            self.collect_garbage(retention).await?;
        }
        Ok(())
    }

    async fn collect_garbage(&self, retention: Duration) -> Result<(), KeeperError> {
        let keys = self.store.list("").await?;
        let entries: Vec<_> = keys
            .iter()
            .filter_map(|key| parse_backup_key(key).map(|t| (key.clone(), t)))
            .collect();
        let doomed = plan_retention(&entries, Utc::now(), retention);
        for key in &doomed {
            self.store.delete(key).await?;
        }
        if !doomed.is_empty() {
            info!("retention deleted {} expired backups", doomed.len());
        }
        Ok(())
    }
}
