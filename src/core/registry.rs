// src/core/registry.rs

//! Tracks which supervisors are currently reachable.
//!
//! The registry consumes a discovery provider and maintains a monotonic
//! view with bounded staleness: a poll failure keeps the previous snapshot,
//! a peer absent from `eviction_polls` consecutive polls is evicted, and a
//! peer only counts as usable while its last `GetInfo` succeeded within the
//! staleness window.

use crate::core::client::{PeerClient, Transport};
use crate::core::discovery::Discovery;
use crate::core::protocol::{PeerId, PeerInfo};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

const PROBE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
struct PeerEntry {
    endpoints: Vec<String>,
    zone: Option<String>,
    missed_polls: u32,
    last_info: Option<PeerInfo>,
    last_success: Option<Instant>,
}

/// Copy-on-read view of one registry entry.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub endpoints: Vec<String>,
    pub zone: Option<String>,
    pub info: Option<PeerInfo>,
    pub last_success: Option<Instant>,
}

impl PeerView {
    pub fn usable(&self, staleness_window: Duration) -> bool {
        self.info.is_some()
            && self
                .last_success
                .is_some_and(|t| t.elapsed() <= staleness_window)
    }
}

pub struct PeerRegistry {
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    cluster_name: String,
    peers: DashMap<PeerId, PeerEntry>,
    poll_interval: Duration,
    eviction_polls: u32,
    /// Consecutive failed discovery polls; reset on success.
    stale_polls: AtomicU64,
}

impl PeerRegistry {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        cluster_name: String,
        poll_interval: Duration,
        eviction_polls: u32,
    ) -> Self {
        Self {
            discovery,
            transport,
            cluster_name,
            peers: DashMap::new(),
            poll_interval,
            eviction_polls,
            stale_polls: AtomicU64::new(0),
        }
    }

    /// Peers are usable while their last probe succeeded within three poll
    /// intervals.
    pub fn staleness_window(&self) -> Duration {
        self.poll_interval * 3
    }

    /// One discovery poll followed by a bounded-concurrency `GetInfo` sweep.
    pub async fn tick(self: &Arc<Self>) {
        match self.discovery.poll().await {
            Ok(polled) => {
                self.stale_polls.store(0, Ordering::Relaxed);
                for (id, discovered) in &polled {
                    match self.peers.get_mut(id) {
                        Some(mut entry) => {
                            entry.endpoints = discovered.endpoints.clone();
                            entry.zone = discovered.zone.clone();
                            entry.missed_polls = 0;
                        }
                        None => {
                            info!("discovered new peer {}", id);
                            self.peers.insert(
                                id.clone(),
                                PeerEntry {
                                    endpoints: discovered.endpoints.clone(),
                                    zone: discovered.zone.clone(),
                                    missed_polls: 0,
                                    last_info: None,
                                    last_success: None,
                                },
                            );
                        }
                    }
                }
                // Count a miss for everything the poll no longer returned.
                let mut evict = Vec::new();
                for mut entry in self.peers.iter_mut() {
                    if !polled.contains_key(entry.key()) {
                        entry.missed_polls += 1;
                        if entry.missed_polls >= self.eviction_polls {
                            evict.push(entry.key().clone());
                        }
                    }
                }
                for id in evict {
                    warn!(
                        "peer {} absent from {} consecutive polls; evicting",
                        id, self.eviction_polls
                    );
                    self.peers.remove(&id);
                }
            }
            Err(e) => {
                let stale = self.stale_polls.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "discovery poll failed ({} consecutive): {}; retaining previous snapshot",
                    stale, e
                );
            }
        }

        self.probe_all().await;
    }

    async fn probe_all(self: &Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(PROBE_CONCURRENCY));
        let mut probes = JoinSet::new();
        let targets: Vec<(PeerId, Vec<String>)> = self
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().endpoints.clone()))
            .collect();
        for (peer_id, endpoints) in targets {
            let registry = self.clone();
            let semaphore = semaphore.clone();
            probes.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let client =
                    PeerClient::new(peer_id.clone(), endpoints, registry.transport.clone());
                match client.get_info(&registry.cluster_name).await {
                    Ok(info) => {
                        if let Some(mut entry) = registry.peers.get_mut(&peer_id) {
                            entry.last_info = Some(info);
                            entry.last_success = Some(Instant::now());
                        }
                    }
                    Err(e) => {
                        debug!("GetInfo probe of {} failed: {}", peer_id, e);
                    }
                }
            });
        }
        while probes.join_next().await.is_some() {}
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown_rx.recv() => {
                    info!("peer registry shutting down");
                    return;
                }
            }
        }
    }

    /// Immutable snapshot of every tracked peer, keyed by stable peer id.
    pub fn snapshot(&self) -> BTreeMap<PeerId, PeerView> {
        self.peers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    PeerView {
                        peer_id: entry.key().clone(),
                        endpoints: entry.value().endpoints.clone(),
                        zone: entry.value().zone.clone(),
                        info: entry.value().last_info.clone(),
                        last_success: entry.value().last_success,
                    },
                )
            })
            .collect()
    }

    /// Only the peers the reconciler may count on this tick.
    pub fn usable_peers(&self) -> BTreeMap<PeerId, PeerView> {
        let window = self.staleness_window();
        self.snapshot()
            .into_iter()
            .filter(|(_, view)| view.usable(window))
            .collect()
    }

    pub fn client_for(&self, view: &PeerView) -> PeerClient {
        PeerClient::new(
            view.peer_id.clone(),
            view.endpoints.clone(),
            self.transport.clone(),
        )
    }
}
