// src/core/agent.rs

//! The peer-side half of the supervisor protocol.
//!
//! Every supervisor, leader or not, runs one agent. It owns the local etcd
//! process exclusively, holds PREPARE proposals under a bounded lease, and
//! answers the RPCs the active controller issues. All handlers are
//! idempotent the way the protocol requires: a repeated PREPARE with
//! identical arguments is OK and with different arguments is rejected, a
//! second StopEtcd observes the same result as the first, and a repeated
//! INITIAL_CLUSTER is OK only while a process with the same token runs.

use crate::config::Config;
use crate::core::backup::{BackupStore, backup_key};
use crate::core::election::LeaderLedger;
use crate::core::errors::KeeperError;
use crate::core::etcd::process::{self, EtcdProcess, ProcessPlan};
use crate::core::protocol::{
    DoBackupRequest, DoRestoreRequest, EtcdNode, EtcdState, InitialClusterState,
    JoinClusterRequest, JoinPhase, LeaderProposalRequest, LeaderProposalResponse, MemberMap,
    PeerId, PeerInfo, RejectKind, RpcHeader, RpcReject, RpcRequest, RpcResponse, StopEtcdResponse,
    UpdateMemberMapRequest,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct PreparedProposal {
    cluster_token: String,
    etcd_version: String,
    nodes: Vec<EtcdNode>,
    expires_at: Instant,
}

pub struct LocalAgent {
    peer_id: PeerId,
    cluster_name: String,
    endpoints: Vec<String>,
    node_config: EtcdNode,
    zone: Option<String>,
    base_dir: PathBuf,
    bin_roots: Vec<PathBuf>,
    listen_address: String,
    listen_metrics_urls: Vec<String>,
    pki_peers_dir: Option<PathBuf>,
    pki_clients_dir: Option<PathBuf>,
    prepare_lease: Duration,
    stop_grace: Duration,

    ledger: Arc<LeaderLedger>,
    backup_store: Arc<dyn BackupStore>,

    process: AsyncMutex<Option<EtcdProcess>>,
    prepared: Mutex<Option<PreparedProposal>>,
    member_map: Mutex<Option<(u64, MemberMap)>>,
    last_backup: AsyncMutex<Option<(i64, String)>>,
}

fn reject(kind: RejectKind, message: impl Into<String>) -> RpcResponse {
    RpcResponse::Reject(RpcReject {
        kind,
        message: message.into(),
    })
}

impl LocalAgent {
    pub fn new(
        config: &Config,
        ledger: Arc<LeaderLedger>,
        backup_store: Arc<dyn BackupStore>,
    ) -> Self {
        Self {
            peer_id: config.peer_id(),
            cluster_name: config.cluster_name.clone(),
            endpoints: vec![config.announce_addr()],
            node_config: config.my_node_config(),
            zone: config.zone.clone(),
            base_dir: config.data_dir.clone(),
            bin_roots: config.etcd.bin_roots.clone(),
            listen_address: config.host.clone(),
            listen_metrics_urls: config.etcd.listen_metrics_urls.clone(),
            pki_peers_dir: config.etcd.pki_peers_dir.clone(),
            pki_clients_dir: config.etcd.pki_clients_dir.clone(),
            prepare_lease: config.timing.prepare_lease,
            stop_grace: config.timing.stop_grace,
            ledger,
            backup_store,
            process: AsyncMutex::new(None),
            prepared: Mutex::new(None),
            member_map: Mutex::new(None),
            last_backup: AsyncMutex::new(None),
        }
    }

    fn etcd_data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    fn staging_dir(&self) -> PathBuf {
        self.base_dir.join("staging")
    }

    /// The member map most recently accepted from a leader, if any.
    pub fn member_map(&self) -> Option<MemberMap> {
        self.member_map.lock().as_ref().map(|(_, map)| map.clone())
    }

    fn check_cluster(&self, cluster_name: &str) -> Option<RpcResponse> {
        if cluster_name != self.cluster_name {
            return Some(reject(
                RejectKind::UnknownCluster,
                format!(
                    "request for cluster {:?} but local cluster is {:?}",
                    cluster_name, self.cluster_name
                ),
            ));
        }
        None
    }

    /// Fences a mutating request on cluster name and leader epoch.
    fn check_header(&self, header: &RpcHeader) -> Option<RpcResponse> {
        if let Some(response) = self.check_cluster(&header.cluster_name) {
            return Some(response);
        }
        if let Err(accepted) = self.ledger.admit(header) {
            return Some(reject(
                RejectKind::RejectedEpoch,
                format!(
                    "leader epoch {} below accepted epoch {accepted}",
                    header.leader_epoch
                ),
            ));
        }
        None
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::GetInfo { cluster_name } => self.handle_get_info(&cluster_name).await,
            RpcRequest::LeaderProposal(req) => self.handle_leader_proposal(req),
            RpcRequest::JoinCluster(req) => self.handle_join_cluster(req).await,
            RpcRequest::StopEtcd(req) => match self.check_header(&req.header) {
                Some(response) => response,
                None => self.handle_stop_etcd().await,
            },
            RpcRequest::UpdateMemberMap(req) => self.handle_update_member_map(req),
            RpcRequest::DoBackup(req) => match self.check_header(&req.header) {
                Some(response) => response,
                None => self.handle_do_backup(req).await,
            },
            RpcRequest::DoRestore(req) => match self.check_header(&req.header) {
                Some(response) => response,
                None => self.handle_do_restore(req).await,
            },
        }
    }

    async fn handle_get_info(&self, cluster_name: &str) -> RpcResponse {
        if let Some(response) = self.check_cluster(cluster_name) {
            return response;
        }
        let etcd_state = {
            let process = self.process.lock().await;
            process
                .as_ref()
                .filter(|p| p.is_running())
                .map(|p| EtcdState {
                    cluster_token: p.plan().cluster_token.clone(),
                    // Learned by the observer from the member list; the
                    // agent itself never queries its own membership.
                    member_id: 0,
                    etcd_version: p.plan().etcd_version.clone(),
                    quarantined: p.plan().quarantined,
                })
        };
        RpcResponse::GetInfo(PeerInfo {
            peer_id: self.peer_id.clone(),
            endpoints: self.endpoints.clone(),
            node_config: self.node_config.clone(),
            etcd_state,
            zone: self.zone.clone(),
        })
    }

    fn handle_leader_proposal(&self, req: LeaderProposalRequest) -> RpcResponse {
        if let Some(response) = self.check_cluster(&req.header.cluster_name) {
            return response;
        }
        let (accepted, last_accepted_epoch) =
            self.ledger.consider(&req.header.leader_id, req.epoch);
        RpcResponse::LeaderProposal(LeaderProposalResponse {
            accepted,
            last_accepted_epoch,
        })
    }

    async fn handle_join_cluster(&self, req: JoinClusterRequest) -> RpcResponse {
        if let Some(response) = self.check_header(&req.header) {
            return response;
        }
        match req.phase {
            JoinPhase::Prepare => self.handle_prepare(req),
            JoinPhase::InitialCluster => self.handle_initial_cluster(req).await,
        }
    }

    fn handle_prepare(&self, req: JoinClusterRequest) -> RpcResponse {
        if let Ok(process) = self.process.try_lock()
            && let Some(p) = process.as_ref().filter(|p| p.is_running())
        {
            return if p.plan().cluster_token == req.cluster_token {
                RpcResponse::JoinCluster
            } else {
                reject(
                    RejectKind::TokenMismatch,
                    format!(
                        "etcd already running with token {}",
                        p.plan().cluster_token
                    ),
                )
            };
        }

        let mut prepared = self.prepared.lock();
        if let Some(existing) = prepared
            .as_ref()
            .filter(|p| p.expires_at > Instant::now())
        {
            if existing.cluster_token != req.cluster_token || existing.nodes != req.nodes {
                return reject(
                    RejectKind::TokenMismatch,
                    format!("already prepared for token {}", existing.cluster_token),
                );
            }
            // Identical retry: refresh the lease.
        }
        info!(
            "accepted PREPARE for token {} with {} nodes",
            req.cluster_token,
            req.nodes.len()
        );
        *prepared = Some(PreparedProposal {
            cluster_token: req.cluster_token,
            etcd_version: req.etcd_version,
            nodes: req.nodes,
            expires_at: Instant::now() + self.prepare_lease,
        });
        RpcResponse::JoinCluster
    }

    async fn handle_initial_cluster(&self, req: JoinClusterRequest) -> RpcResponse {
        let mut process = self.process.lock().await;
        if let Some(p) = process.as_ref().filter(|p| p.is_running()) {
            return if p.plan().cluster_token == req.cluster_token {
                RpcResponse::JoinCluster
            } else {
                reject(
                    RejectKind::TokenMismatch,
                    format!("etcd already running with token {}", p.plan().cluster_token),
                )
            };
        }

        if req.cluster_state == InitialClusterState::New {
            // A fresh cluster start must commit a previously accepted
            // proposal; joins into an existing cluster need none.
            let prepared = self.prepared.lock().clone();
            match prepared.filter(|p| p.expires_at > Instant::now()) {
                Some(p) if p.cluster_token == req.cluster_token => {}
                Some(p) => {
                    return reject(
                        RejectKind::TokenMismatch,
                        format!("prepared for token {}, not {}", p.cluster_token, req.cluster_token),
                    );
                }
                None => {
                    return reject(
                        RejectKind::Failed,
                        "no live PREPARE for this INITIAL_CLUSTER",
                    );
                }
            }
        }

        let bin_dir = match process::bindir_for_version(&self.bin_roots, &req.etcd_version, "etcd")
            .await
        {
            Ok(dir) => dir,
            Err(e) => return reject(RejectKind::Failed, e.to_string()),
        };

        let plan = ProcessPlan {
            bin_dir,
            data_dir: self.etcd_data_dir(),
            current_dir: self.base_dir.clone(),
            etcd_version: req.etcd_version,
            cluster_token: req.cluster_token,
            nodes: req.nodes,
            my_node_name: self.node_config.name.clone(),
            create_new_cluster: req.cluster_state == InitialClusterState::New,
            force_new_cluster: req.force_new_cluster,
            quarantined: req.quarantined,
            listen_address: self.listen_address.clone(),
            listen_metrics_urls: self.listen_metrics_urls.clone(),
            pki_peers_dir: self.pki_peers_dir.clone(),
            pki_clients_dir: self.pki_clients_dir.clone(),
        };

        match EtcdProcess::start(plan).await {
            Ok(started) => {
                *process = Some(started);
                *self.prepared.lock() = None;
                RpcResponse::JoinCluster
            }
            Err(e) => {
                warn!("failed to start etcd: {}", e);
                reject(RejectKind::Failed, e.to_string())
            }
        }
    }

    async fn handle_stop_etcd(&self) -> RpcResponse {
        let mut process = self.process.lock().await;
        let Some(p) = process.take() else {
            return RpcResponse::StopEtcd(StopEtcdResponse { was_running: false });
        };
        if !p.is_running() {
            // The process died on its own; stopping it is a no-op.
            return RpcResponse::StopEtcd(StopEtcdResponse { was_running: false });
        }
        match p.stop(self.stop_grace).await {
            Ok(()) => RpcResponse::StopEtcd(StopEtcdResponse { was_running: true }),
            Err(e) => {
                // Put the handle back so a later call can retry.
                *process = Some(p);
                reject(RejectKind::Failed, e.to_string())
            }
        }
    }

    fn handle_update_member_map(&self, req: UpdateMemberMapRequest) -> RpcResponse {
        if let Some(response) = self.check_header(&req.header) {
            return response;
        }
        let mut member_map = self.member_map.lock();
        // Last writer wins, monotonic by leader epoch.
        if member_map
            .as_ref()
            .is_none_or(|(epoch, _)| *epoch <= req.header.leader_epoch)
        {
            *member_map = Some((req.header.leader_epoch, req.member_map));
        }
        RpcResponse::UpdateMemberMap
    }

    async fn handle_do_backup(&self, req: DoBackupRequest) -> RpcResponse {
        let mut last_backup = self.last_backup.lock().await;
        if let Some((timestamp, backup_id)) = last_backup.as_ref()
            && *timestamp == req.info.timestamp_ms
        {
            // DoBackup is not idempotent; dedupe on the caller's timestamp.
            return RpcResponse::DoBackup(crate::core::protocol::DoBackupResponse {
                backup_id: backup_id.clone(),
            });
        }

        let process = self.process.lock().await;
        let Some(p) = process.as_ref().filter(|p| p.is_running()) else {
            return reject(RejectKind::NotRunning, "no etcd process to snapshot");
        };
        let client_urls = match p.plan().local_client_urls() {
            Ok(urls) => urls,
            Err(e) => return reject(RejectKind::Failed, e.to_string()),
        };
        let bin_dir = p.plan().bin_dir.clone();
        drop(process);

        let taken_at: DateTime<Utc> = DateTime::from_timestamp_millis(req.info.timestamp_ms)
            .unwrap_or_else(Utc::now);
        let key = backup_key(&req.info.cluster_token, taken_at);
        let staging = self.staging_dir();
        if let Err(e) = fs::create_dir_all(&staging).await {
            return reject(RejectKind::Failed, format!("creating staging dir: {e}"));
        }
        let snapshot_path = staging.join(format!("backup-{}.snap", req.info.timestamp_ms));

        if let Err(e) = process::snapshot_save(&bin_dir, &client_urls, &snapshot_path).await {
            return reject(RejectKind::Failed, e.to_string());
        }
        let blob = match fs::read(&snapshot_path).await {
            Ok(blob) => blob,
            Err(e) => return reject(RejectKind::Failed, format!("reading snapshot: {e}")),
        };
        if let Err(e) = self.backup_store.put(&key, &blob).await {
            return reject(RejectKind::Failed, e.to_string());
        }
        let _ = fs::remove_file(&snapshot_path).await;
        info!("backup {} uploaded ({} bytes)", key, blob.len());
        *last_backup = Some((req.info.timestamp_ms, key.clone()));
        RpcResponse::DoBackup(crate::core::protocol::DoBackupResponse { backup_id: key })
    }

    async fn handle_do_restore(&self, req: DoRestoreRequest) -> RpcResponse {
        let process = self.process.lock().await;
        if process.as_ref().is_some_and(|p| p.is_running()) {
            return reject(
                RejectKind::Failed,
                "etcd still running; all peers must be stopped before a restore",
            );
        }
        drop(process);

        let data_dir = self.etcd_data_dir();
        // Removing the data directory is legal here and only here: the
        // request is the explicit effect of an accepted RESTORE command.
        match fs::remove_dir_all(&data_dir).await {
            Ok(()) => info!("wiped data directory {:?}", data_dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return reject(RejectKind::Failed, format!("wiping data dir: {e}")),
        }

        let Some(backup_ref) = req.backup_ref else {
            return RpcResponse::DoRestore;
        };

        let my_node = match req.nodes.iter().find(|n| n.name == self.node_config.name) {
            Some(node) => node.clone(),
            None => {
                return reject(
                    RejectKind::Failed,
                    format!("node {:?} not in restore proposal", self.node_config.name),
                );
            }
        };
        let bin_dir = match process::bindir_for_version(&self.bin_roots, &req.etcd_version, "etcdctl")
            .await
        {
            Ok(dir) => dir,
            Err(e) => return reject(RejectKind::Failed, e.to_string()),
        };

        let blob = match self.backup_store.get(&backup_ref).await {
            Ok(blob) => blob,
            Err(e) => return reject(RejectKind::Failed, e.to_string()),
        };
        let staging = self.staging_dir();
        if let Err(e) = fs::create_dir_all(&staging).await {
            return reject(RejectKind::Failed, format!("creating staging dir: {e}"));
        }
        let snapshot_path = staging.join("restore.snap");
        if let Err(e) = fs::write(&snapshot_path, &blob).await {
            return reject(RejectKind::Failed, format!("staging snapshot: {e}"));
        }

        if let Err(e) = process::snapshot_restore(
            &bin_dir,
            &snapshot_path,
            &my_node,
            &req.nodes,
            &req.cluster_token,
            &data_dir,
        )
        .await
        {
            return reject(RejectKind::Failed, e.to_string());
        }
        let _ = fs::remove_file(&snapshot_path).await;
        RpcResponse::DoRestore
    }

    /// Discards PREPARE proposals whose lease has expired. A PREPARE that
    /// never sees its INITIAL_CLUSTER times out here rather than through an
    /// explicit cancel message.
    pub fn expire_stale_prepare(&self) {
        let mut prepared = self.prepared.lock();
        if let Some(p) = prepared.as_ref()
            && p.expires_at <= Instant::now()
        {
            warn!(
                "discarding PREPARE for token {}: lease expired without INITIAL_CLUSTER",
                p.cluster_token
            );
            *prepared = None;
        }
    }

    /// Stops the local process on supervisor shutdown.
    pub async fn shutdown(&self) {
        let mut process = self.process.lock().await;
        if let Some(p) = process.take()
            && p.is_running()
        {
            info!("stopping etcd on supervisor shutdown");
            if let Err(e) = p.stop(self.stop_grace).await {
                warn!("stopping etcd on shutdown: {}", e);
            }
        }
    }
}
