// src/core/client.rs

//! Per-peer RPC stub.
//!
//! The [`Transport`] trait is the seam between the controller and the wire:
//! production uses [`TcpTransport`] (length-prefixed bincode frames over
//! TCP), tests swap in an in-memory implementation.

use crate::core::errors::KeeperError;
use crate::core::protocol::{
    BackupInfo, ClientCodec, DoBackupRequest, DoRestoreRequest, EtcdNode, InitialClusterState,
    JoinClusterRequest, JoinPhase, LeaderProposalRequest, LeaderProposalResponse, MemberMap,
    PeerId, PeerInfo, RejectKind, RpcHeader, RpcReject, RpcRequest, RpcResponse, StopEtcdRequest,
    UpdateMemberMapRequest,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::Framed;
use tracing::debug;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one request/response exchange with the supervisor reachable
    /// at one of `endpoints`.
    async fn call(
        &self,
        endpoints: &[String],
        request: RpcRequest,
    ) -> Result<RpcResponse, KeeperError>;
}

/// One TCP connection per call. Supervisor RPC volume is a handful of small
/// messages per tick, so connection reuse buys nothing worth the
/// bookkeeping.
pub struct TcpTransport {
    connect_timeout: Duration,
    rpc_timeout: Duration,
}

impl TcpTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            rpc_timeout,
        }
    }

    async fn call_endpoint(
        &self,
        endpoint: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse, KeeperError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| KeeperError::Timeout(format!("connecting to {endpoint}")))?
            .map_err(|e| KeeperError::Transport(format!("connect {endpoint}: {e}")))?;
        let mut framed = Framed::new(stream, ClientCodec);
        framed.send(request).await?;
        match timeout(self.rpc_timeout, framed.next()).await {
            Ok(Some(Ok(response))) => Ok(response),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(KeeperError::Transport(format!(
                "connection to {endpoint} closed before a response arrived"
            ))),
            Err(_) => Err(KeeperError::Timeout(format!(
                "waiting for response from {endpoint}"
            ))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        endpoints: &[String],
        request: RpcRequest,
    ) -> Result<RpcResponse, KeeperError> {
        let mut last_err = KeeperError::Transport("peer has no endpoints".to_string());
        for endpoint in endpoints {
            match self.call_endpoint(endpoint, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    debug!("endpoint {} failed: {}; trying next", endpoint, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

fn reject_to_error(reject: RpcReject) -> KeeperError {
    match reject.kind {
        RejectKind::TokenMismatch => KeeperError::TokenMismatch(reject.message),
        RejectKind::RejectedEpoch
        | RejectKind::UnknownCluster
        | RejectKind::NotRunning
        | RejectKind::Failed => KeeperError::Rejected(reject.message),
    }
}

/// Typed RPC stub for a single peer supervisor.
#[derive(Clone)]
pub struct PeerClient {
    pub peer_id: PeerId,
    pub endpoints: Vec<String>,
    transport: Arc<dyn Transport>,
}

impl PeerClient {
    pub fn new(peer_id: PeerId, endpoints: Vec<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            peer_id,
            endpoints,
            transport,
        }
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, KeeperError> {
        self.transport.call(&self.endpoints, request).await
    }

    /// Retries transient failures with jittered exponential backoff, capped
    /// by `deadline`. Non-transient errors surface immediately; the next
    /// tick supersedes anything still failing.
    async fn call_retrying(
        &self,
        request: RpcRequest,
        deadline: Duration,
    ) -> Result<RpcResponse, KeeperError> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(200);
        let mut rng = SmallRng::from_entropy();
        loop {
            match self.call(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && start.elapsed() + delay < deadline => {
                    let jitter = Duration::from_millis(rng.gen_range(0..=delay.as_millis() as u64 / 2));
                    debug!(
                        "transient error calling peer {}: {}; retrying in {:?}",
                        self.peer_id,
                        e,
                        delay + jitter
                    );
                    sleep(delay + jitter).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_info(&self, cluster_name: &str) -> Result<PeerInfo, KeeperError> {
        match self
            .call(RpcRequest::GetInfo {
                cluster_name: cluster_name.to_string(),
            })
            .await?
        {
            RpcResponse::GetInfo(info) => Ok(info),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected GetInfo response: {other:?}"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn join_cluster(
        &self,
        header: RpcHeader,
        phase: JoinPhase,
        cluster_token: &str,
        etcd_version: &str,
        nodes: Vec<EtcdNode>,
        cluster_state: InitialClusterState,
        force_new_cluster: bool,
        quarantined: bool,
    ) -> Result<(), KeeperError> {
        let request = RpcRequest::JoinCluster(JoinClusterRequest {
            header,
            phase,
            cluster_token: cluster_token.to_string(),
            etcd_version: etcd_version.to_string(),
            nodes,
            cluster_state,
            force_new_cluster,
            quarantined,
        });
        match self.call(request).await? {
            RpcResponse::JoinCluster => Ok(()),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected JoinCluster response: {other:?}"
            ))),
        }
    }

    /// Returns whether etcd was running before the call. Idempotent.
    pub async fn stop_etcd(&self, header: RpcHeader) -> Result<bool, KeeperError> {
        match self.call(RpcRequest::StopEtcd(StopEtcdRequest { header })).await? {
            RpcResponse::StopEtcd(r) => Ok(r.was_running),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected StopEtcd response: {other:?}"
            ))),
        }
    }

    pub async fn update_member_map(
        &self,
        header: RpcHeader,
        member_map: MemberMap,
        deadline: Duration,
    ) -> Result<(), KeeperError> {
        let request = RpcRequest::UpdateMemberMap(UpdateMemberMapRequest { header, member_map });
        match self.call_retrying(request, deadline).await? {
            RpcResponse::UpdateMemberMap => Ok(()),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected UpdateMemberMap response: {other:?}"
            ))),
        }
    }

    pub async fn do_backup(
        &self,
        header: RpcHeader,
        info: BackupInfo,
    ) -> Result<String, KeeperError> {
        match self
            .call(RpcRequest::DoBackup(DoBackupRequest { header, info }))
            .await?
        {
            RpcResponse::DoBackup(r) => Ok(r.backup_id),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected DoBackup response: {other:?}"
            ))),
        }
    }

    pub async fn do_restore(
        &self,
        header: RpcHeader,
        backup_ref: Option<String>,
        cluster_token: &str,
        etcd_version: &str,
        nodes: Vec<EtcdNode>,
    ) -> Result<(), KeeperError> {
        let request = RpcRequest::DoRestore(DoRestoreRequest {
            header,
            backup_ref,
            cluster_token: cluster_token.to_string(),
            etcd_version: etcd_version.to_string(),
            nodes,
        });
        match self.call(request).await? {
            RpcResponse::DoRestore => Ok(()),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected DoRestore response: {other:?}"
            ))),
        }
    }

    pub async fn propose_leader(
        &self,
        header: RpcHeader,
        epoch: u64,
    ) -> Result<LeaderProposalResponse, KeeperError> {
        let request = RpcRequest::LeaderProposal(LeaderProposalRequest { header, epoch });
        match self.call(request).await? {
            RpcResponse::LeaderProposal(r) => Ok(r),
            RpcResponse::Reject(r) => Err(reject_to_error(r)),
            other => Err(KeeperError::Transport(format!(
                "unexpected LeaderProposal response: {other:?}"
            ))),
        }
    }
}
