// src/config.rs

//! Manages supervisor configuration: loading, defaulting, and validation.

use crate::core::protocol::{ClusterSpec, EtcdNode, PeerId};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level supervisor configuration, read from a TOML file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Logical cluster name; requests for a different cluster are rejected.
    pub cluster_name: String,

    /// Stable identity of this supervisor, also used as the etcd node name.
    pub peer_id: String,

    #[serde(default = "default_host")]
    pub host: String,

    /// Port the supervisor RPC listener binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address announced to peers; falls back to `host`.
    pub announce_ip: Option<String>,

    /// Failure-domain label used by ADD/REMOVE tie-breaks.
    pub zone: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// When set, the member map carries `<node-name><dns_suffix>` entries.
    pub dns_suffix: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub etcd: EtcdConfig,

    /// Static discovery table. Every supervisor in the cluster lists the
    /// same nodes here.
    #[serde(default)]
    pub nodes: Vec<StaticNode>,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// How the local etcd replica is built and addressed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EtcdConfig {
    pub version: String,

    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Port advertised instead of `client_port` while quarantined, so that
    /// normal clients cannot reach the replica.
    #[serde(default = "default_quarantined_client_port")]
    pub quarantined_client_port: u16,

    #[serde(default)]
    pub tls_enabled: bool,

    /// Directories searched for `etcd-v<version>/` binary installs.
    #[serde(default = "default_bin_roots")]
    pub bin_roots: Vec<PathBuf>,

    pub pki_peers_dir: Option<PathBuf>,
    pub pki_clients_dir: Option<PathBuf>,

    #[serde(default)]
    pub listen_metrics_urls: Vec<String>,
}

/// One entry of the static discovery table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StaticNode {
    pub id: String,
    pub ips: Vec<String>,
    pub zone: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackupConfig {
    #[serde(default = "default_backup_store_path")]
    pub store_path: PathBuf,

    #[serde(with = "humantime_serde", default = "default_backup_interval")]
    pub interval: Duration,

    #[serde(with = "humantime_serde", default = "default_backup_retention")]
    pub retention: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            store_path: default_backup_store_path(),
            interval: default_backup_interval(),
            retention: default_backup_retention(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_action_timeout")]
    pub action_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_leader_lease")]
    pub leader_lease: Duration,

    /// How long a peer holds an un-committed PREPARE before discarding it.
    #[serde(with = "humantime_serde", default = "default_prepare_lease")]
    pub prepare_lease: Duration,

    /// Graceful shutdown window before the etcd process is killed.
    #[serde(with = "humantime_serde", default = "default_stop_grace")]
    pub stop_grace: Duration,

    /// Consecutive discovery misses before a peer is evicted.
    #[serde(default = "default_eviction_polls")]
    pub eviction_polls: u32,

    /// Ticks a member may stay unhealthy before quarantine/replace.
    #[serde(default = "default_unhealthy_ticks")]
    pub unhealthy_ticks: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            poll_interval: default_poll_interval(),
            rpc_timeout: default_rpc_timeout(),
            action_timeout: default_action_timeout(),
            leader_lease: default_leader_lease(),
            prepare_lease: default_prepare_lease(),
            stop_grace: default_stop_grace(),
            eviction_polls: default_eviction_polls(),
            unhealthy_ticks: default_unhealthy_ticks(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    2480
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/etcdkeeper")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_peer_port() -> u16 {
    2380
}
fn default_client_port() -> u16 {
    2379
}
fn default_quarantined_client_port() -> u16 {
    3994
}
fn default_bin_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/opt"), PathBuf::from("/tmp")]
}
fn default_backup_store_path() -> PathBuf {
    PathBuf::from("/var/lib/etcdkeeper/backups")
}
fn default_backup_interval() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_backup_retention() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_action_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_leader_lease() -> Duration {
    Duration::from_secs(30)
}
fn default_prepare_lease() -> Duration {
    Duration::from_secs(60)
}
fn default_stop_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_eviction_polls() -> u32 {
    3
}
fn default_unhealthy_ticks() -> u32 {
    3
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(anyhow!("cluster_name cannot be empty"));
        }
        if self.peer_id.trim().is_empty() {
            return Err(anyhow!("peer_id cannot be empty"));
        }
        if self.etcd.version.trim().is_empty() {
            return Err(anyhow!("etcd.version cannot be empty"));
        }
        if self.etcd.client_port == self.etcd.quarantined_client_port {
            return Err(anyhow!(
                "etcd.client_port and etcd.quarantined_client_port must differ"
            ));
        }
        if !self.nodes.is_empty() && !self.nodes.iter().any(|n| n.id == self.peer_id) {
            return Err(anyhow!(
                "static node table does not contain this supervisor's peer_id {:?}",
                self.peer_id
            ));
        }
        if self.timing.eviction_polls == 0 {
            return Err(anyhow!("timing.eviction_polls cannot be 0"));
        }
        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.peer_id.clone())
    }

    /// The address this supervisor announces to its peers.
    pub fn announce_addr(&self) -> String {
        let ip = self.announce_ip.as_ref().unwrap_or(&self.host);
        format!("{}:{}", ip, self.port)
    }

    /// Synthesizes this node's proposed etcd member identity. URL schemes
    /// here reflect the local TLS flag; the controller rewrites them to the
    /// cluster-wide TLS policy before a proposal goes out.
    pub fn my_node_config(&self) -> EtcdNode {
        let ip = self.announce_ip.as_ref().unwrap_or(&self.host);
        let scheme = if self.etcd.tls_enabled {
            "https"
        } else {
            "http"
        };
        EtcdNode {
            name: self.peer_id.clone(),
            peer_urls: vec![format!("{scheme}://{ip}:{}", self.etcd.peer_port)],
            client_urls: vec![format!("{scheme}://{ip}:{}", self.etcd.client_port)],
            quarantined_client_urls: vec![format!(
                "{scheme}://{ip}:{}",
                self.etcd.quarantined_client_port
            )],
            tls_enabled: self.etcd.tls_enabled,
        }
    }

    /// The expected cluster spec when the spec store has nothing persisted:
    /// every statically configured node a member, running the configured
    /// version.
    pub fn bootstrap_spec(&self) -> ClusterSpec {
        ClusterSpec {
            member_count: self.nodes.len().max(1) as u32,
            etcd_version: self.etcd.version.clone(),
            backup_interval: Some(self.backup.interval),
            backup_retention: Some(self.backup.retention),
        }
    }
}
