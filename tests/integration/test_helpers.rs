// tests/integration/test_helpers.rs

//! In-memory cluster harness.
//!
//! A `FakePeer` implements the peer-side protocol the way a real agent
//! does (PREPARE leases, token checks, epoch fencing, member map
//! acceptance) but starts no processes: a "replica" is a record in a
//! shared `FakeDb` standing in for the database. The real controller code
//! runs unmodified on top, through the `Transport` and `EtcdApi` seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcdkeeper::core::KeeperError;
use etcdkeeper::core::backup::{BackupStore, FsBackupStore, backup_key};
use etcdkeeper::core::client::Transport;
use etcdkeeper::core::commands::FsCommandStore;
use etcdkeeper::core::discovery::{DiscoveredPeer, Discovery};
use etcdkeeper::core::driver::ReconfigDriver;
use etcdkeeper::core::election::{LeaderElector, LeaderLedger};
use etcdkeeper::core::etcd::EtcdApi;
use etcdkeeper::core::observer::{EtcdClusterState, Observer};
use etcdkeeper::core::protocol::{
    ClusterMember, ClusterSpec, EtcdNode, EtcdState, InitialClusterState, JoinPhase,
    LeaderProposalResponse, PeerId, PeerInfo, RejectKind, RpcHeader, RpcReject, RpcRequest,
    RpcResponse, StopEtcdResponse,
};
use etcdkeeper::core::reconciler::{ControllerStatus, Reconciler};
use etcdkeeper::core::registry::PeerRegistry;
use etcdkeeper::core::specstore::FsSpecStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// Everything observable that happened across the cluster, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    MemberMapUpdated {
        peer: PeerId,
        epoch: u64,
    },
    PrepareAccepted {
        peer: PeerId,
        token: String,
    },
    ReplicaStarted {
        peer: PeerId,
        token: String,
        version: String,
        state: InitialClusterState,
        force_new_cluster: bool,
        quarantined: bool,
    },
    ReplicaStopped {
        peer: PeerId,
    },
    MemberAdded {
        member_id: u64,
    },
    MemberRemoved {
        member_id: u64,
    },
    DataDirWiped {
        peer: PeerId,
    },
    SnapshotRestored {
        peer: PeerId,
        backup_ref: String,
        token: String,
    },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// The shared "database": one member list and one keyspace.
pub struct FakeDb {
    pub members: Mutex<BTreeMap<u64, ClusterMember>>,
    pub kv: Mutex<BTreeMap<String, Vec<u8>>>,
    next_id: AtomicU64,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(BTreeMap::new()),
            kv: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn assign_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct RunningReplica {
    pub token: String,
    pub version: String,
    pub quarantined: bool,
}

pub struct FakePeer {
    pub id: PeerId,
    pub node: EtcdNode,
    pub ledger: Arc<LeaderLedger>,
    pub running: Mutex<Option<RunningReplica>>,
    prepared: Mutex<Option<(String, Vec<EtcdNode>)>>,
    db: Arc<FakeDb>,
    store: Arc<dyn BackupStore>,
    log: EventLog,
    cluster_name: String,
}

fn reject(kind: RejectKind, message: impl Into<String>) -> RpcResponse {
    RpcResponse::Reject(RpcReject {
        kind,
        message: message.into(),
    })
}

impl FakePeer {
    pub fn new(
        name: &str,
        db: Arc<FakeDb>,
        store: Arc<dyn BackupStore>,
        log: EventLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId::from(name),
            node: EtcdNode {
                name: name.to_string(),
                peer_urls: vec![format!("http://{name}.test:2380")],
                client_urls: vec![format!("http://{name}.test:2379")],
                quarantined_client_urls: vec![format!("http://{name}.test:3994")],
                tls_enabled: false,
            },
            ledger: Arc::new(LeaderLedger::default()),
            running: Mutex::new(None),
            prepared: Mutex::new(None),
            db,
            store,
            log,
            cluster_name: "main".to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}.test:2480", self.id)
    }

    fn push(&self, event: Event) {
        self.log.lock().push(event);
    }

    fn my_member_id(&self) -> u64 {
        self.db
            .members
            .lock()
            .values()
            .find(|m| m.name == self.node.name)
            .map(|m| m.member_id)
            .unwrap_or(0)
    }

    /// Seeds a running replica plus its database membership, for scenarios
    /// that begin with an established cluster.
    pub fn seed_running(&self, token: &str, version: &str) {
        let member_id = self.db.assign_id();
        self.db.members.lock().insert(
            member_id,
            ClusterMember {
                member_id,
                name: self.node.name.clone(),
                peer_urls: self.node.peer_urls.clone(),
                client_urls: self.node.client_urls.clone(),
            },
        );
        *self.running.lock() = Some(RunningReplica {
            token: token.to_string(),
            version: version.to_string(),
            quarantined: false,
        });
    }

    fn check_header(&self, header: &RpcHeader) -> Option<RpcResponse> {
        if header.cluster_name != self.cluster_name {
            return Some(reject(RejectKind::UnknownCluster, "wrong cluster"));
        }
        if let Err(accepted) = self.ledger.admit(header) {
            return Some(reject(
                RejectKind::RejectedEpoch,
                format!("epoch below {accepted}"),
            ));
        }
        None
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::GetInfo { cluster_name } => {
                if cluster_name != self.cluster_name {
                    return reject(RejectKind::UnknownCluster, "wrong cluster");
                }
                let etcd_state = self.running.lock().as_ref().map(|r| EtcdState {
                    cluster_token: r.token.clone(),
                    member_id: self.my_member_id(),
                    etcd_version: r.version.clone(),
                    quarantined: r.quarantined,
                });
                RpcResponse::GetInfo(PeerInfo {
                    peer_id: self.id.clone(),
                    endpoints: vec![self.endpoint()],
                    node_config: self.node.clone(),
                    etcd_state,
                    zone: None,
                })
            }
            RpcRequest::LeaderProposal(req) => {
                let (accepted, last_accepted_epoch) =
                    self.ledger.consider(&req.header.leader_id, req.epoch);
                RpcResponse::LeaderProposal(LeaderProposalResponse {
                    accepted,
                    last_accepted_epoch,
                })
            }
            RpcRequest::JoinCluster(req) => {
                if let Some(response) = self.check_header(&req.header) {
                    return response;
                }
                match req.phase {
                    JoinPhase::Prepare => {
                        if let Some(r) = self.running.lock().as_ref() {
                            return if r.token == req.cluster_token {
                                RpcResponse::JoinCluster
                            } else {
                                reject(RejectKind::TokenMismatch, "already running")
                            };
                        }
                        let mut prepared = self.prepared.lock();
                        if let Some((token, nodes)) = prepared.as_ref()
                            && (*token != req.cluster_token || *nodes != req.nodes)
                        {
                            return reject(RejectKind::TokenMismatch, "already prepared");
                        }
                        *prepared = Some((req.cluster_token.clone(), req.nodes.clone()));
                        self.push(Event::PrepareAccepted {
                            peer: self.id.clone(),
                            token: req.cluster_token,
                        });
                        RpcResponse::JoinCluster
                    }
                    JoinPhase::InitialCluster => {
                        if let Some(r) = self.running.lock().as_ref() {
                            return if r.token == req.cluster_token {
                                RpcResponse::JoinCluster
                            } else {
                                reject(RejectKind::TokenMismatch, "already running")
                            };
                        }
                        if req.cluster_state == InitialClusterState::New {
                            let prepared = self.prepared.lock();
                            match prepared.as_ref() {
                                Some((token, _)) if *token == req.cluster_token => {}
                                _ => return reject(RejectKind::Failed, "no matching PREPARE"),
                            }
                        }
                        self.register_membership(req.cluster_state);
                        *self.running.lock() = Some(RunningReplica {
                            token: req.cluster_token.clone(),
                            version: req.etcd_version.clone(),
                            quarantined: req.quarantined,
                        });
                        *self.prepared.lock() = None;
                        self.push(Event::ReplicaStarted {
                            peer: self.id.clone(),
                            token: req.cluster_token,
                            version: req.etcd_version,
                            state: req.cluster_state,
                            force_new_cluster: req.force_new_cluster,
                            quarantined: req.quarantined,
                        });
                        RpcResponse::JoinCluster
                    }
                }
            }
            RpcRequest::StopEtcd(req) => {
                if let Some(response) = self.check_header(&req.header) {
                    return response;
                }
                let was_running = self.running.lock().take().is_some();
                if was_running {
                    self.push(Event::ReplicaStopped {
                        peer: self.id.clone(),
                    });
                }
                RpcResponse::StopEtcd(StopEtcdResponse { was_running })
            }
            RpcRequest::UpdateMemberMap(req) => {
                if let Some(response) = self.check_header(&req.header) {
                    return response;
                }
                self.push(Event::MemberMapUpdated {
                    peer: self.id.clone(),
                    epoch: req.header.leader_epoch,
                });
                RpcResponse::UpdateMemberMap
            }
            RpcRequest::DoBackup(req) => {
                if let Some(response) = self.check_header(&req.header) {
                    return response;
                }
                let Some(running) = self.running.lock().clone() else {
                    return reject(RejectKind::NotRunning, "no replica");
                };
                let taken_at: DateTime<Utc> =
                    DateTime::from_timestamp_millis(req.info.timestamp_ms).unwrap();
                let key = backup_key(&running.token, taken_at);
                let blob = serde_json::to_vec(&*self.db.kv.lock()).unwrap();
                if let Err(e) = self.store.put(&key, &blob).await {
                    return reject(RejectKind::Failed, e.to_string());
                }
                RpcResponse::DoBackup(etcdkeeper::core::protocol::DoBackupResponse {
                    backup_id: key,
                })
            }
            RpcRequest::DoRestore(req) => {
                if let Some(response) = self.check_header(&req.header) {
                    return response;
                }
                if self.running.lock().is_some() {
                    return reject(RejectKind::Failed, "still running");
                }
                match req.backup_ref {
                    None => {
                        self.push(Event::DataDirWiped {
                            peer: self.id.clone(),
                        });
                        RpcResponse::DoRestore
                    }
                    Some(backup_ref) => {
                        let blob = match self.store.get(&backup_ref).await {
                            Ok(blob) => blob,
                            Err(e) => return reject(RejectKind::Failed, e.to_string()),
                        };
                        let restored: BTreeMap<String, Vec<u8>> =
                            serde_json::from_slice(&blob).unwrap();
                        // A restore produces a fresh incarnation: the old
                        // membership is gone, the snapshot data is back.
                        self.db.members.lock().clear();
                        *self.db.kv.lock() = restored;
                        self.push(Event::SnapshotRestored {
                            peer: self.id.clone(),
                            backup_ref,
                            token: req.cluster_token,
                        });
                        RpcResponse::DoRestore
                    }
                }
            }
        }
    }

    /// Registers this replica in the shared member list the way etcd
    /// would: a fresh id for a new cluster, adoption of the pending
    /// `member add` entry when joining an existing one.
    fn register_membership(&self, cluster_state: InitialClusterState) {
        let mut members = self.db.members.lock();
        if cluster_state == InitialClusterState::Existing {
            // Adopt the unstarted entry created by member_add, if any.
            let pending = members
                .values()
                .find(|m| m.name.is_empty() && m.peer_urls == self.node.peer_urls)
                .map(|m| m.member_id);
            if let Some(id) = pending {
                let entry = members.get_mut(&id).unwrap();
                entry.name = self.node.name.clone();
                entry.client_urls = self.node.client_urls.clone();
                return;
            }
            // A respawn of an existing member keeps its entry.
            if members.values().any(|m| m.name == self.node.name) {
                return;
            }
        }
        let member_id = self.db.assign_id();
        members.insert(
            member_id,
            ClusterMember {
                member_id,
                name: self.node.name.clone(),
                peer_urls: self.node.peer_urls.clone(),
                client_urls: self.node.client_urls.clone(),
            },
        );
    }
}

/// Transport dispatching to fake peers by endpoint.
pub struct InMemoryTransport {
    peers: BTreeMap<String, Arc<FakePeer>>,
}

impl InMemoryTransport {
    pub fn new(peers: &[Arc<FakePeer>]) -> Arc<Self> {
        Arc::new(Self {
            peers: peers.iter().map(|p| (p.endpoint(), p.clone())).collect(),
        })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn call(
        &self,
        endpoints: &[String],
        request: RpcRequest,
    ) -> Result<RpcResponse, KeeperError> {
        for endpoint in endpoints {
            if let Some(peer) = self.peers.get(endpoint) {
                return Ok(peer.handle(request).await);
            }
        }
        Err(KeeperError::Transport(format!(
            "no fake peer at {endpoints:?}"
        )))
    }
}

/// `EtcdApi` over the shared fake database.
pub struct FakeEtcd {
    db: Arc<FakeDb>,
    peers: Vec<Arc<FakePeer>>,
    log: EventLog,
}

impl FakeEtcd {
    fn peer_by_urls(&self, urls: &[String]) -> Option<&Arc<FakePeer>> {
        self.peers.iter().find(|p| {
            urls.iter().any(|u| {
                p.node.client_urls.contains(u) || p.node.quarantined_client_urls.contains(u)
            })
        })
    }

    fn serving(&self, urls: &[String]) -> Result<(), KeeperError> {
        match self.peer_by_urls(urls) {
            Some(peer) if peer.running.lock().is_some() => Ok(()),
            _ => Err(KeeperError::Transport(format!("no replica at {urls:?}"))),
        }
    }
}

#[async_trait]
impl EtcdApi for FakeEtcd {
    async fn member_list(&self, client_urls: &[String]) -> Result<Vec<ClusterMember>, KeeperError> {
        self.serving(client_urls)?;
        Ok(self.db.members.lock().values().cloned().collect())
    }

    async fn member_add(
        &self,
        client_urls: &[String],
        peer_urls: &[String],
    ) -> Result<u64, KeeperError> {
        self.serving(client_urls)?;
        let member_id = self.db.assign_id();
        self.db.members.lock().insert(
            member_id,
            ClusterMember {
                member_id,
                name: String::new(),
                peer_urls: peer_urls.to_vec(),
                client_urls: vec![],
            },
        );
        self.log.lock().push(Event::MemberAdded { member_id });
        Ok(member_id)
    }

    async fn member_remove(
        &self,
        client_urls: &[String],
        member_id: u64,
    ) -> Result<(), KeeperError> {
        self.serving(client_urls)?;
        self.db.members.lock().remove(&member_id);
        self.log.lock().push(Event::MemberRemoved { member_id });
        Ok(())
    }

    async fn health(&self, client_urls: &[String]) -> Result<bool, KeeperError> {
        Ok(self.serving(client_urls).is_ok())
    }

    async fn get(&self, client_urls: &[String], key: &str) -> Result<Option<Vec<u8>>, KeeperError> {
        self.serving(client_urls)?;
        Ok(self.db.kv.lock().get(key).cloned())
    }

    async fn put(
        &self,
        client_urls: &[String],
        key: &str,
        value: &[u8],
    ) -> Result<(), KeeperError> {
        self.serving(client_urls)?;
        self.db.kv.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

struct FixedDiscovery {
    peers: BTreeMap<PeerId, DiscoveredPeer>,
}

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn poll(&self) -> Result<BTreeMap<PeerId, DiscoveredPeer>, KeeperError> {
        Ok(self.peers.clone())
    }
}

/// A whole supervisor control plane over fake peers. The first named peer
/// hosts the controller under test.
pub struct TestCluster {
    pub peers: Vec<Arc<FakePeer>>,
    pub transport: Arc<InMemoryTransport>,
    pub db: Arc<FakeDb>,
    pub registry: Arc<PeerRegistry>,
    pub elector: Arc<LeaderElector>,
    pub reconciler: Reconciler,
    pub status_rx: watch::Receiver<ControllerStatus>,
    pub state_rx: watch::Receiver<EtcdClusterState>,
    pub command_store: Arc<FsCommandStore>,
    pub spec_store: Arc<FsSpecStore>,
    pub backup_store: Arc<FsBackupStore>,
    pub log: EventLog,
    pub dir: TempDir,
}

impl TestCluster {
    pub async fn new(names: &[&str], spec: ClusterSpec) -> Self {
        let dir = TempDir::new().unwrap();
        let db = FakeDb::new();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let backup_store = Arc::new(FsBackupStore::new(&dir.path().join("backups")));

        let peers: Vec<Arc<FakePeer>> = names
            .iter()
            .map(|name| FakePeer::new(name, db.clone(), backup_store.clone(), log.clone()))
            .collect();
        let transport = InMemoryTransport::new(&peers);

        // Make the desired version "installed" so the create gate passes.
        let bin_dir = dir
            .path()
            .join("bins")
            .join(format!("etcd-v{}", spec.etcd_version));
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::write(bin_dir.join("etcd"), b"").unwrap();
        std::fs::write(bin_dir.join("etcdctl"), b"").unwrap();

        let discovery = Arc::new(FixedDiscovery {
            peers: peers
                .iter()
                .map(|p| {
                    (
                        p.id.clone(),
                        DiscoveredPeer {
                            endpoints: vec![p.endpoint()],
                            zone: None,
                        },
                    )
                })
                .collect(),
        });
        let registry = Arc::new(PeerRegistry::new(
            discovery,
            transport.clone(),
            "main".to_string(),
            Duration::from_secs(10),
            3,
        ));

        let elector = Arc::new(LeaderElector::new(
            peers[0].id.clone(),
            "main".to_string(),
            registry.clone(),
            peers[0].ledger.clone(),
            Duration::from_secs(30),
        ));

        let etcd_api: Arc<dyn EtcdApi> = Arc::new(FakeEtcd {
            db: db.clone(),
            peers: peers.clone(),
            log: log.clone(),
        });
        let observer = Observer::new(registry.clone(), etcd_api.clone());
        let driver = ReconfigDriver::new(
            transport.clone(),
            elector.clone(),
            etcd_api,
            false,
            None,
            vec![dir.path().join("bins")],
            Duration::from_secs(5),
            Duration::from_secs(60),
        );

        let command_store = Arc::new(FsCommandStore::new(dir.path()));
        let spec_store = Arc::new(FsSpecStore::new(dir.path()));
        let (reconciler, status_rx, state_rx) = Reconciler::new(
            observer,
            elector.clone(),
            driver,
            command_store.clone(),
            spec_store.clone(),
            spec,
            Duration::from_secs(10),
            3,
        );

        Self {
            peers,
            transport,
            db,
            registry,
            elector,
            reconciler,
            status_rx,
            state_rx,
            command_store,
            spec_store,
            backup_store,
            log,
            dir,
        }
    }

    /// Refreshes the registry, acquires leadership, and runs one tick.
    pub async fn tick(&self) -> Result<(), KeeperError> {
        self.registry.tick().await;
        self.elector.campaign().await;
        assert!(
            self.elector.is_leader(),
            "controller failed to take leadership"
        );
        self.reconciler.tick().await
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().clone()
    }

    pub fn peer(&self, name: &str) -> &Arc<FakePeer> {
        self.peers
            .iter()
            .find(|p| p.id == PeerId::from(name))
            .unwrap()
    }

    pub fn running(&self, name: &str) -> Option<RunningReplica> {
        self.peer(name).running.lock().clone()
    }

    pub fn place_new_cluster_marker(&self) {
        std::fs::write(self.dir.path().join("please-create-new-cluster"), b"").unwrap();
    }

    pub fn marker_present(&self) -> bool {
        self.dir.path().join("please-create-new-cluster").exists()
    }
}
