// src/core/election.rs

//! Leader election by lock acquisition over the peer set.
//!
//! Each supervisor proposes itself with a monotonically increasing epoch. A
//! peer rejects any proposal whose epoch is at or below the one it already
//! accepted, unless it is a renewal from the same leader. A supervisor that
//! collects a quorum of accepts over the current usable peer snapshot holds
//! leadership for one lease and must renew before half of it has elapsed.

use crate::core::protocol::{PeerId, RpcHeader};
use crate::core::registry::PeerRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use super::quorum_size;

/// Peer-side record of the highest leadership accepted so far. Shared with
/// the local agent so mutating RPCs can be fenced on the same state.
#[derive(Debug, Default)]
pub struct LeaderLedger {
    inner: Mutex<Accepted>,
}

#[derive(Debug, Default)]
struct Accepted {
    epoch: u64,
    leader_id: Option<PeerId>,
}

impl LeaderLedger {
    /// Applies the acceptance rule for a proposal. Returns whether it was
    /// accepted and the highest epoch accepted so far.
    pub fn consider(&self, leader: &PeerId, epoch: u64) -> (bool, u64) {
        let mut inner = self.inner.lock();
        let renewal = epoch == inner.epoch && inner.leader_id.as_ref() == Some(leader);
        if epoch > inner.epoch || renewal {
            inner.epoch = epoch;
            inner.leader_id = Some(leader.clone());
            (true, inner.epoch)
        } else {
            (false, inner.epoch)
        }
    }

    /// Fences a mutating RPC: the header epoch must be at least the highest
    /// accepted one. A higher epoch implies an election this peer missed,
    /// so it is recorded.
    pub fn admit(&self, header: &RpcHeader) -> Result<(), u64> {
        let mut inner = self.inner.lock();
        if header.leader_epoch < inner.epoch {
            return Err(inner.epoch);
        }
        if header.leader_epoch > inner.epoch {
            inner.epoch = header.leader_epoch;
            inner.leader_id = Some(header.leader_id.clone());
        }
        Ok(())
    }

    pub fn accepted_epoch(&self) -> u64 {
        self.inner.lock().epoch
    }
}

#[derive(Debug, Default)]
struct ElectorState {
    /// Epoch of the lease currently held, if any.
    epoch: u64,
    lease_until: Option<Instant>,
    /// Highest epoch observed anywhere, used to pick the next proposal.
    max_seen: u64,
}

pub struct LeaderElector {
    my_id: PeerId,
    cluster_name: String,
    registry: Arc<PeerRegistry>,
    ledger: Arc<LeaderLedger>,
    lease: Duration,
    state: Mutex<ElectorState>,
}

impl LeaderElector {
    pub fn new(
        my_id: PeerId,
        cluster_name: String,
        registry: Arc<PeerRegistry>,
        ledger: Arc<LeaderLedger>,
        lease: Duration,
    ) -> Self {
        Self {
            my_id,
            cluster_name,
            registry,
            ledger,
            lease,
            state: Mutex::new(ElectorState::default()),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state
            .lock()
            .lease_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// The header driver RPCs must carry while this supervisor leads.
    pub fn leader_header(&self) -> Option<RpcHeader> {
        let state = self.state.lock();
        let leading = state.lease_until.is_some_and(|until| Instant::now() < until);
        leading.then(|| RpcHeader {
            leader_id: self.my_id.clone(),
            leader_epoch: state.epoch,
            cluster_name: self.cluster_name.clone(),
        })
    }

    /// One election or renewal round over the current peer snapshot.
    /// Quarantined peers take no part in leadership.
    pub async fn campaign(&self) {
        let electorate: Vec<_> = self
            .registry
            .usable_peers()
            .into_values()
            .filter(|view| {
                view.info
                    .as_ref()
                    .and_then(|i| i.etcd_state.as_ref())
                    .is_none_or(|s| !s.quarantined)
            })
            .collect();

        if electorate.is_empty() {
            self.step_down("no usable peers");
            return;
        }
        let quorum = quorum_size(electorate.len());

        let (epoch, was_leader) = {
            let mut state = self.state.lock();
            let leading = state.lease_until.is_some_and(|until| Instant::now() < until);
            if leading {
                (state.epoch, true)
            } else {
                state.max_seen = state.max_seen.max(self.ledger.accepted_epoch());
                (state.max_seen + 1, false)
            }
        };

        let header = RpcHeader {
            leader_id: self.my_id.clone(),
            leader_epoch: epoch,
            cluster_name: self.cluster_name.clone(),
        };

        let mut proposals = JoinSet::new();
        for view in electorate {
            let client = self.registry.client_for(&view);
            let header = header.clone();
            proposals.spawn(async move { client.propose_leader(header, epoch).await });
        }

        let mut accepts = 0usize;
        let mut max_seen = epoch;
        while let Some(joined) = proposals.join_next().await {
            match joined {
                Ok(Ok(response)) => {
                    max_seen = max_seen.max(response.last_accepted_epoch);
                    if response.accepted {
                        accepts += 1;
                    }
                }
                Ok(Err(e)) => debug!("leadership proposal failed: {}", e),
                Err(e) => debug!("leadership proposal task failed: {}", e),
            }
        }

        let mut state = self.state.lock();
        state.max_seen = state.max_seen.max(max_seen);
        if accepts >= quorum {
            if !was_leader {
                info!(
                    "won leader election with {}/{} accepts at epoch {}",
                    accepts, quorum, epoch
                );
            }
            state.epoch = epoch;
            state.lease_until = Some(Instant::now() + self.lease);
        } else if was_leader {
            warn!(
                "lost leadership quorum ({} accepts, need {}); stepping down",
                accepts, quorum
            );
            state.lease_until = None;
        } else {
            debug!(
                "election attempt at epoch {} gathered {}/{} accepts",
                epoch, accepts, quorum
            );
        }
    }

    fn step_down(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.lease_until.is_some() {
            warn!("stepping down as leader: {}", reason);
            state.lease_until = None;
        }
    }

    /// Campaigns at a cadence that renews well before the lease midpoint.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let cadence = (self.lease / 3).max(Duration::from_secs(1));
        let mut interval = time::interval(cadence);
        loop {
            tokio::select! {
                _ = interval.tick() => self.campaign().await,
                _ = shutdown_rx.recv() => {
                    info!("leader elector shutting down");
                    return;
                }
            }
        }
    }
}
