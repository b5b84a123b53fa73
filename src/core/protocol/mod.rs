// src/core/protocol/mod.rs

//! Wire message contracts exchanged between supervisors.
//!
//! Every request carries an [`RpcHeader`]. Receivers reject requests whose
//! `cluster_name` disagrees with local configuration and whose
//! `leader_epoch` is lower than the one previously accepted, so a deposed
//! leader cannot mutate the cluster. Field additions must remain
//! backward-compatible across supervisor versions.

pub mod codec;

pub use codec::{ClientCodec, ServerCodec};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Opaque stable identifier of a supervisor. Immutable per physical node
/// across restarts when backed by the same data volume.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Header attached to every supervisor RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RpcHeader {
    pub leader_id: PeerId,
    pub leader_epoch: u64,
    pub cluster_name: String,
}

/// A proposed or running etcd member identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EtcdNode {
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub quarantined_client_urls: Vec<String>,
    pub tls_enabled: bool,
}

/// Present iff an etcd process is currently running under a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct EtcdState {
    /// Token of the logical cluster incarnation this process belongs to.
    pub cluster_token: String,
    pub member_id: u64,
    pub etcd_version: String,
    pub quarantined: bool,
}

/// What a supervisor reports about itself through `GetInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub endpoints: Vec<String>,
    pub node_config: EtcdNode,
    pub etcd_state: Option<EtcdState>,
    #[serde(default)]
    pub zone: Option<String>,
}

/// The operator-declared target the reconciler drives toward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClusterSpec {
    pub member_count: u32,
    pub etcd_version: String,
    #[serde(default, with = "humantime_serde")]
    pub backup_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub backup_retention: Option<Duration>,
}

/// Best-effort mapping from member name to reachable addresses, broadcast
/// so peers agree on how to address each other independently of DNS.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct MemberMap {
    pub members: Vec<MemberMapInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MemberMapInfo {
    pub name: String,
    pub dns: Option<String>,
    pub addresses: Vec<String>,
}

/// A member as reported by the database itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub member_id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

/// An operator-issued command, persisted until consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    /// Unix timestamp, seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum CommandKind {
    RestoreBackup { backup_ref: String },
    ForceUpgrade { etcd_version: String },
    Stop,
}

/// Phases of the two-phase JOIN protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum JoinPhase {
    /// Persist the proposal; refuse any further PREPARE with a different token.
    Prepare,
    /// Spawn the etcd process from the previously accepted proposal.
    InitialCluster,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum InitialClusterState {
    New,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct JoinClusterRequest {
    pub header: RpcHeader,
    pub phase: JoinPhase,
    pub cluster_token: String,
    pub etcd_version: String,
    pub nodes: Vec<EtcdNode>,
    pub cluster_state: InitialClusterState,
    /// Set on the restored peer when rebuilding a cluster from a snapshot.
    #[serde(default)]
    pub force_new_cluster: bool,
    /// Respawn with the quarantined client URL variant advertised.
    #[serde(default)]
    pub quarantined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StopEtcdRequest {
    pub header: RpcHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StopEtcdResponse {
    /// False means etcd was not running; the call is idempotent.
    pub was_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UpdateMemberMapRequest {
    pub header: RpcHeader,
    pub member_map: MemberMap,
}

/// Everything a peer needs to take and label a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BackupInfo {
    pub cluster_token: String,
    pub etcd_version: String,
    /// Callers dedupe `DoBackup` on this timestamp (unix milliseconds).
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DoBackupRequest {
    pub header: RpcHeader,
    pub info: BackupInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DoBackupResponse {
    pub backup_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DoRestoreRequest {
    pub header: RpcHeader,
    /// `Some` stages the blob and runs the snapshot-restore tool; `None`
    /// wipes the data directory in preparation for re-adding this member.
    /// Both are effects of an operator RESTORE command only.
    pub backup_ref: Option<String>,
    pub cluster_token: String,
    pub etcd_version: String,
    pub nodes: Vec<EtcdNode>,
}

/// Leadership proposal for the lock-based election over the peer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LeaderProposalRequest {
    pub header: RpcHeader,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LeaderProposalResponse {
    pub accepted: bool,
    pub last_accepted_epoch: u64,
}

/// Why a peer refused a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum RejectKind {
    RejectedEpoch,
    UnknownCluster,
    TokenMismatch,
    NotRunning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RpcReject {
    pub kind: RejectKind,
    pub message: String,
}

/// Envelope for every inbound supervisor RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum RpcRequest {
    GetInfo { cluster_name: String },
    JoinCluster(JoinClusterRequest),
    StopEtcd(StopEtcdRequest),
    UpdateMemberMap(UpdateMemberMapRequest),
    DoBackup(DoBackupRequest),
    DoRestore(DoRestoreRequest),
    LeaderProposal(LeaderProposalRequest),
}

/// Envelope for every outbound supervisor RPC reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum RpcResponse {
    GetInfo(PeerInfo),
    JoinCluster,
    StopEtcd(StopEtcdResponse),
    UpdateMemberMap,
    DoBackup(DoBackupResponse),
    DoRestore,
    LeaderProposal(LeaderProposalResponse),
    Reject(RpcReject),
}

/// Mints a fresh 128-bit cluster token identifying one logical cluster
/// incarnation. Created on new-cluster and restore only.
pub fn random_cluster_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Renders the `name=peer_url` initial-cluster string etcd expects.
pub fn initial_cluster_string(nodes: &[EtcdNode]) -> String {
    let entries: Vec<String> = nodes
        .iter()
        .map(|n| format!("{}={}", n.name, n.peer_urls.join(",")))
        .collect();
    entries.join(",")
}

/// Builds the member map broadcast alongside a proposal, resolving each
/// node's addresses from the discovery endpoints of its supervisor.
pub fn build_member_map(
    nodes: &[EtcdNode],
    endpoints_by_name: &BTreeMap<String, Vec<String>>,
    dns_suffix: Option<&str>,
) -> MemberMap {
    let mut map = MemberMap::default();
    for node in nodes {
        let dns = dns_suffix.map(|suffix| {
            if suffix.starts_with('.') {
                format!("{}{}", node.name, suffix)
            } else {
                format!("{}.{}", node.name, suffix)
            }
        });
        map.members.push(MemberMapInfo {
            name: node.name.clone(),
            dns,
            addresses: endpoints_by_name
                .get(&node.name)
                .cloned()
                .unwrap_or_default(),
        });
    }
    map
}
