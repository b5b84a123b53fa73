// src/core/discovery.rs

//! Peer discovery providers.
//!
//! A provider answers one question: which supervisors exist right now, and
//! at which endpoints. The registry polls it at a fixed interval and treats
//! errors as staleness, never as eviction.

use crate::core::errors::KeeperError;
use crate::core::protocol::PeerId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Endpoints at which one discovered supervisor can be reached, plus the
/// failure-domain label when the provider knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub endpoints: Vec<String>,
    pub zone: Option<String>,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns the full set of currently known supervisors. The result
    /// replaces the previous one wholesale; absence is meaningful.
    async fn poll(&self) -> Result<BTreeMap<PeerId, DiscoveredPeer>, KeeperError>;
}

/// Discovery backed by a fixed node table from the configuration file.
pub struct StaticDiscovery {
    nodes: Vec<StaticEntry>,
    rpc_port: u16,
}

struct StaticEntry {
    id: PeerId,
    ips: Vec<String>,
    zone: Option<String>,
}

impl StaticDiscovery {
    pub fn new(nodes: &[crate::config::StaticNode], rpc_port: u16) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| StaticEntry {
                    id: PeerId(n.id.clone()),
                    ips: n.ips.clone(),
                    zone: n.zone.clone(),
                })
                .collect(),
            rpc_port,
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn poll(&self) -> Result<BTreeMap<PeerId, DiscoveredPeer>, KeeperError> {
        let mut peers = BTreeMap::new();
        for node in &self.nodes {
            peers.insert(
                node.id.clone(),
                DiscoveredPeer {
                    endpoints: node
                        .ips
                        .iter()
                        .map(|ip| format!("{ip}:{}", self.rpc_port))
                        .collect(),
                    zone: node.zone.clone(),
                },
            );
        }
        debug!("static discovery poll => {} peers", peers.len());
        Ok(peers)
    }
}
