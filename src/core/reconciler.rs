// src/core/reconciler.rs

//! The decision kernel and its tick loop.
//!
//! Runs only while this supervisor holds leadership. Each tick compares the
//! observed cluster state to the expected spec and selects exactly one
//! action; the reconfiguration driver executes it. The priority order is
//! fixed: the first matching condition wins.

use crate::core::commands::CommandStore;
use crate::core::driver::{ActionOutcome, ReconfigDriver};
use crate::core::election::LeaderElector;
use crate::core::observer::{EtcdClusterState, Observer};
use crate::core::protocol::{ClusterMember, ClusterSpec, Command, CommandKind, PeerId};
use crate::core::quorum_size;
use crate::core::specstore::SpecStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time;
use tracing::{error, info, warn};

/// What the controller is currently doing, surfaced for operators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ControllerStatus {
    /// Not the leader; reconciliation is halted here.
    #[default]
    Following,
    /// Observed state matches the spec.
    Idle,
    /// Observation was inconsistent; no reconfiguration this tick.
    DiagnosticOnly,
    /// Two cluster tokens observed; destructive actions are refused until
    /// the operator resolves the condition via command.
    SplitBrain { tokens: Vec<String> },
    /// An action is being driven.
    Reconciling(String),
}

/// Why a peer is being quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    SplitBrain,
    Unhealthy,
}

/// The single action a tick selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Restore(Command),
    StopCluster(Command),
    Quarantine {
        peer: PeerId,
        reason: QuarantineReason,
    },
    AddMember(PeerId),
    RemoveMember(u64),
    Upgrade(u64),
    None,
}

/// Everything `decide` looks at. Immutable; assembled fresh each tick.
pub struct DecisionContext<'a> {
    pub state: &'a EtcdClusterState,
    pub spec: &'a ClusterSpec,
    pub new_cluster_marker: bool,
    pub commands: &'a [Command],
    /// Consecutive ticks each member has failed its health check.
    pub unhealthy_streaks: &'a BTreeMap<u64, u32>,
    pub unhealthy_threshold: u32,
}

/// The decision kernel. Pure: no IO, no clocks.
pub fn decide(ctx: &DecisionContext) -> Action {
    let state = ctx.state;
    let desired = ctx.spec.member_count as usize;

    // 1. Nothing running anywhere, operator authorized a new cluster, and
    //    enough peers exist to reach the desired quorum.
    if state.running_peers().next().is_none()
        && ctx.new_cluster_marker
        && state.peers.len() >= quorum_size(desired)
    {
        return Action::Create;
    }

    // 2. A destructive operator command is queued.
    for command in ctx.commands {
        match &command.kind {
            CommandKind::RestoreBackup { .. } => return Action::Restore(command.clone()),
            CommandKind::Stop => return Action::StopCluster(command.clone()),
            // Version overrides are folded into the spec before deciding.
            CommandKind::ForceUpgrade { .. } => {}
        }
    }

    // 3. Split brain: running replicas disagree on the cluster token.
    let tokens = state.cluster_tokens();
    if tokens.len() > 1 {
        if let Some(offender) = split_brain_offender(state, &tokens) {
            return Action::Quarantine {
                peer: offender,
                reason: QuarantineReason::SplitBrain,
            };
        }
        // Every minority holder is already quarantined; just halt.
        return Action::None;
    }

    // 4. Grow toward the spec. Growth needs a running cluster to join;
    //    with nothing running, CREATE (gated on the marker) is the only
    //    way forward.
    if !state.members.is_empty()
        && state.members.len() < desired
        && let Some(candidate) = choose_join_candidate(state, ctx.spec)
    {
        return Action::AddMember(candidate);
    }

    // 5. Shrink toward the spec.
    if state.members.len() > desired
        && let Some(victim) = choose_remove_victim(state, ctx.spec)
    {
        return Action::RemoveMember(victim);
    }

    // 6. Version drift.
    if let Some(member_id) = first_version_mismatch(state, &ctx.spec.etcd_version) {
        return Action::Upgrade(member_id);
    }

    // 7. Persistent unhealth: replace when a spare peer exists, otherwise
    //    quarantine. An already-quarantined member is left alone.
    for (member_id, streak) in ctx.unhealthy_streaks {
        if *streak < ctx.unhealthy_threshold {
            continue;
        }
        let Some(member) = state.members.get(member_id) else {
            continue;
        };
        if member_quarantined(state, member) {
            continue;
        }
        if choose_join_candidate(state, ctx.spec).is_some() {
            return Action::RemoveMember(*member_id);
        }
        if let Some(peer_id) = state.peer_for_member(member) {
            return Action::Quarantine {
                peer: peer_id.clone(),
                reason: QuarantineReason::Unhealthy,
            };
        }
    }

    Action::None
}

fn member_quarantined(state: &EtcdClusterState, member: &ClusterMember) -> bool {
    state
        .peer_for_member(member)
        .and_then(|id| state.peers.get(id))
        .and_then(|p| p.etcd_state.as_ref())
        .is_some_and(|s| s.quarantined)
}

/// The canonical token is the one held by the most running replicas, ties
/// broken toward the lexicographically smallest. The offender is the first
/// not-yet-quarantined peer holding any other token.
fn split_brain_offender(state: &EtcdClusterState, tokens: &BTreeSet<String>) -> Option<PeerId> {
    let mut holders: BTreeMap<&String, usize> = tokens.iter().map(|t| (t, 0)).collect();
    for (_, info) in state.running_peers() {
        if let Some(etcd_state) = info.etcd_state.as_ref()
            && let Some(count) = holders.get_mut(&etcd_state.cluster_token)
        {
            *count += 1;
        }
    }
    let canonical = holders
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(token, _)| (*token).clone())?;

    state
        .running_peers()
        .filter_map(|(peer_id, info)| info.etcd_state.as_ref().map(|s| (peer_id, s)))
        .find(|(_, s)| s.cluster_token != canonical && !s.quarantined)
        .map(|(peer_id, _)| peer_id.clone())
}

fn member_names(state: &EtcdClusterState) -> BTreeSet<&str> {
    state.members.values().map(|m| m.name.as_str()).collect()
}

/// Zones currently under-represented among members, given an even spread of
/// the desired count over the zones usable peers live in.
fn zone_member_counts(state: &EtcdClusterState) -> BTreeMap<Option<String>, usize> {
    let names = member_names(state);
    let mut counts: BTreeMap<Option<String>, usize> = BTreeMap::new();
    for info in state.peers.values() {
        if names.contains(info.node_config.name.as_str()) {
            *counts.entry(info.zone.clone()).or_default() += 1;
        }
    }
    counts
}

fn zone_fair_share(state: &EtcdClusterState, spec: &ClusterSpec) -> usize {
    let zones: BTreeSet<_> = state.peers.values().map(|p| p.zone.clone()).collect();
    let zone_count = zones.len().max(1);
    (spec.member_count as usize).div_ceil(zone_count)
}

/// ADD chooses usable non-member peers that are not running a replica:
/// under-represented zone first, then lexicographic peer id.
fn choose_join_candidate(state: &EtcdClusterState, spec: &ClusterSpec) -> Option<PeerId> {
    let names = member_names(state);
    let zone_counts = zone_member_counts(state);
    let fair_share = zone_fair_share(state, spec);

    state
        .peers
        .iter()
        .filter(|(_, info)| {
            info.etcd_state.is_none() && !names.contains(info.node_config.name.as_str())
        })
        .min_by_key(|(peer_id, info)| {
            let zone_load = zone_counts.get(&info.zone).copied().unwrap_or(0);
            // Prefer zones with headroom.
            (zone_load >= fair_share, zone_load, (*peer_id).clone())
        })
        .map(|(peer_id, _)| peer_id.clone())
}

/// REMOVE prefers members in over-represented zones, then unhealthy
/// members, then the lexicographically greatest peer id. Quarantined
/// members are not eligible.
fn choose_remove_victim(state: &EtcdClusterState, spec: &ClusterSpec) -> Option<u64> {
    let zone_counts = zone_member_counts(state);
    let fair_share = zone_fair_share(state, spec);

    state
        .members
        .values()
        .filter(|member| !member_quarantined(state, member))
        .max_by_key(|member| {
            let peer = state.peer_for_member(member).and_then(|id| state.peers.get(id));
            let zone = peer.map(|p| p.zone.clone()).unwrap_or_default();
            let zone_load = zone_counts.get(&zone).copied().unwrap_or(0);
            let unhealthy = !state.healthy_members.contains(&member.member_id);
            (
                zone_load > fair_share,
                unhealthy,
                member.name.clone(),
            )
        })
        .map(|m| m.member_id)
}

/// Members are upgraded one at a time in member-id order.
fn first_version_mismatch(state: &EtcdClusterState, desired_version: &str) -> Option<u64> {
    state.members.values().find_map(|member| {
        let peer_id = state.peer_for_member(member)?;
        let etcd_state = state.peers.get(peer_id)?.etcd_state.as_ref()?;
        (etcd_state.etcd_version != desired_version).then_some(member.member_id)
    })
}

pub struct Reconciler {
    observer: Observer,
    elector: Arc<LeaderElector>,
    driver: ReconfigDriver,
    command_store: Arc<dyn CommandStore>,
    spec_store: Arc<dyn SpecStore>,
    bootstrap_spec: ClusterSpec,
    tick_interval: Duration,
    unhealthy_threshold: u32,
    unhealthy_streaks: Mutex<BTreeMap<u64, u32>>,
    status_tx: watch::Sender<ControllerStatus>,
    state_tx: watch::Sender<EtcdClusterState>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        observer: Observer,
        elector: Arc<LeaderElector>,
        driver: ReconfigDriver,
        command_store: Arc<dyn CommandStore>,
        spec_store: Arc<dyn SpecStore>,
        bootstrap_spec: ClusterSpec,
        tick_interval: Duration,
        unhealthy_threshold: u32,
    ) -> (Self, watch::Receiver<ControllerStatus>, watch::Receiver<EtcdClusterState>) {
        let (status_tx, status_rx) = watch::channel(ControllerStatus::Following);
        let (state_tx, state_rx) = watch::channel(EtcdClusterState::default());
        (
            Self {
                observer,
                elector,
                driver,
                command_store,
                spec_store,
                bootstrap_spec,
                tick_interval,
                unhealthy_threshold,
                unhealthy_streaks: Mutex::new(BTreeMap::new()),
                status_tx,
                state_tx,
            },
            status_rx,
            state_rx,
        )
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.elector.is_leader() {
                        self.status_tx.send_replace(ControllerStatus::Following);
                        continue;
                    }
                    if let Err(e) = self.tick().await {
                        if matches!(e, crate::core::KeeperError::Invariant(_)) {
                            // Fatal breaches are loud and stop the process.
                            error!("fatal: {}", e);
                            std::process::abort();
                        }
                        warn!("reconciliation tick failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("reconciler shutting down");
                    return;
                }
            }
        }
    }

    /// The expected spec for this tick: persisted spec or the static
    /// bootstrap, with any queued version override folded in.
    async fn expected_spec(&self, commands: &[Command]) -> Result<ClusterSpec, crate::core::KeeperError> {
        let mut spec = self
            .spec_store
            .get()
            .await?
            .unwrap_or_else(|| self.bootstrap_spec.clone());
        for command in commands {
            if let CommandKind::ForceUpgrade { etcd_version } = &command.kind {
                info!(
                    "command {} overrides desired etcd version to {}",
                    command.id, etcd_version
                );
                spec.etcd_version = etcd_version.clone();
            }
        }
        Ok(spec)
    }

    fn update_unhealthy_streaks(&self, state: &EtcdClusterState) {
        let mut streaks = self.unhealthy_streaks.lock();
        streaks.retain(|id, _| state.members.contains_key(id));
        for member_id in state.members.keys() {
            if state.healthy_members.contains(member_id) {
                streaks.remove(member_id);
            } else {
                *streaks.entry(*member_id).or_default() += 1;
            }
        }
    }

    pub async fn tick(&self) -> Result<(), crate::core::KeeperError> {
        let state = self.observer.observe().await;
        self.state_tx.send_replace(state.clone());
        self.update_unhealthy_streaks(&state);

        if state.diagnostic_only {
            self.status_tx.send_replace(ControllerStatus::DiagnosticOnly);
            return Ok(());
        }

        // A force-upgrade command is consumed once every member runs the
        // requested version; until then it keeps overriding the spec.
        let mut commands = Vec::new();
        for command in self.command_store.list().await? {
            if let CommandKind::ForceUpgrade { etcd_version } = &command.kind
                && !state.members.is_empty()
                && first_version_mismatch(&state, etcd_version).is_none()
            {
                info!("force-upgrade command {} satisfied; consuming it", command.id);
                self.command_store.remove(&command.id).await?;
                continue;
            }
            commands.push(command);
        }
        let spec = self.expected_spec(&commands).await?;
        let new_cluster_marker = self.command_store.is_new_cluster().await?;

        let tokens = state.cluster_tokens();
        if tokens.len() > 1 {
            warn!(
                "split brain: observed cluster tokens {:?}; refusing destructive actions",
                tokens
            );
            self.status_tx.send_replace(ControllerStatus::SplitBrain {
                tokens: tokens.iter().cloned().collect(),
            });
        }

        let action = {
            let streaks = self.unhealthy_streaks.lock();
            decide(&DecisionContext {
                state: &state,
                spec: &spec,
                new_cluster_marker,
                commands: &commands,
                unhealthy_streaks: &streaks,
                unhealthy_threshold: self.unhealthy_threshold,
            })
        };

        if action == Action::None {
            if tokens.len() <= 1 {
                self.status_tx.send_replace(ControllerStatus::Idle);
            }
            return Ok(());
        }

        info!("reconciler selected action {:?}", action);
        if tokens.len() <= 1 {
            self.status_tx
                .send_replace(ControllerStatus::Reconciling(format!("{action:?}")));
        }

        let consumed_command = match &action {
            Action::Restore(cmd) | Action::StopCluster(cmd) => Some(cmd.clone()),
            _ => None,
        };
        let was_create = action == Action::Create;

        let ActionOutcome { done } = self.driver.execute(action, &state, &spec).await?;
        if !done {
            return Ok(());
        }

        if was_create {
            // CREATE completed: persist the spec and consume the marker,
            // in that order, so a crash never leaves an authorized marker
            // behind a created cluster.
            self.spec_store.set(&spec).await?;
            self.command_store.mark_cluster_created().await?;
        }
        if let Some(command) = consumed_command {
            self.command_store.remove(&command.id).await?;
        }
        Ok(())
    }
}
