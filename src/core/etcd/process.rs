// src/core/etcd/process.rs

//! Spawning and supervising the local etcd process.
//!
//! etcd is configured entirely through environment variables so operators
//! can override any setting: an `ETCD_*` variable already present in the
//! supervisor's own environment is passed through verbatim and wins.

use crate::core::errors::KeeperError;
use crate::core::protocol::{EtcdNode, initial_cluster_string};
use crate::core::urls;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Everything needed to launch one etcd replica.
#[derive(Debug, Clone)]
pub struct ProcessPlan {
    pub bin_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Working directory of the process; relative unix-socket client URLs
    /// are resolved against it.
    pub current_dir: PathBuf,
    pub etcd_version: String,
    pub cluster_token: String,
    pub nodes: Vec<EtcdNode>,
    pub my_node_name: String,
    /// `initial-cluster-state=new` instead of `existing`.
    pub create_new_cluster: bool,
    /// Passed during restore so the single restored member forms a cluster.
    pub force_new_cluster: bool,
    /// Advertise the quarantined client URLs instead of the normal ones.
    pub quarantined: bool,
    /// Address to bind listeners on; etcd requires an IP here.
    pub listen_address: String,
    pub listen_metrics_urls: Vec<String>,
    pub pki_peers_dir: Option<PathBuf>,
    pub pki_clients_dir: Option<PathBuf>,
}

impl ProcessPlan {
    pub fn my_node(&self) -> Option<&EtcdNode> {
        self.nodes.iter().find(|n| n.name == self.my_node_name)
    }

    /// Client URLs this process advertises, honoring quarantine.
    pub fn advertised_client_urls(&self) -> Result<Vec<String>, KeeperError> {
        let me = self.my_node().ok_or_else(|| {
            KeeperError::Process(format!(
                "node {:?} not in proposed cluster",
                self.my_node_name
            ))
        })?;
        Ok(if self.quarantined {
            me.quarantined_client_urls.clone()
        } else {
            me.client_urls.clone()
        })
    }

    /// Client URLs a local database client should use, with relative
    /// unix-socket paths made absolute.
    pub fn local_client_urls(&self) -> Result<Vec<String>, KeeperError> {
        let advertised = self.advertised_client_urls()?;
        Ok(urls::absolutize_unix_urls(&advertised, &self.current_dir))
    }

    /// Synthesizes the environment the process is started with. `ambient`
    /// is the supervisor's own environment; its `ETCD_*` entries are merged
    /// last so they win.
    pub fn build_env(
        &self,
        ambient: &[(String, String)],
    ) -> Result<BTreeMap<String, String>, KeeperError> {
        let me = self.my_node().ok_or_else(|| {
            KeeperError::Process(format!(
                "node {:?} not in proposed cluster",
                self.my_node_name
            ))
        })?;
        let client_urls = self.advertised_client_urls()?;

        let mut env = BTreeMap::new();
        env.insert("ETCD_DATA_DIR".into(), self.data_dir.display().to_string());
        env.insert("ETCD_LOGGER".into(), "zap".into());
        env.insert("ETCD_LOG_OUTPUTS".into(), "stdout".into());

        env.insert(
            "ETCD_LISTEN_PEER_URLS".into(),
            urls::change_host(&me.peer_urls, &self.listen_address).join(","),
        );
        env.insert(
            "ETCD_LISTEN_CLIENT_URLS".into(),
            urls::change_host(&client_urls, &self.listen_address).join(","),
        );
        env.insert("ETCD_ADVERTISE_CLIENT_URLS".into(), client_urls.join(","));
        env.insert(
            "ETCD_INITIAL_ADVERTISE_PEER_URLS".into(),
            me.peer_urls.join(","),
        );

        if !self.listen_metrics_urls.is_empty() {
            env.insert(
                "ETCD_LISTEN_METRICS_URLS".into(),
                self.listen_metrics_urls.join(","),
            );
        }

        env.insert(
            "ETCD_INITIAL_CLUSTER_STATE".into(),
            if self.create_new_cluster {
                "new".into()
            } else {
                "existing".into()
            },
        );

        // The v2 endpoint stays off regardless of etcd version.
        env.insert("ETCD_ENABLE_V2".into(), "false".into());

        env.insert("ETCD_NAME".into(), self.my_node_name.clone());
        if !self.cluster_token.is_empty() {
            env.insert(
                "ETCD_INITIAL_CLUSTER_TOKEN".into(),
                self.cluster_token.clone(),
            );
        }
        env.insert(
            "ETCD_INITIAL_CLUSTER".into(),
            initial_cluster_string(&self.nodes),
        );

        // Avoid quorum loss on careless reconfiguration.
        env.insert("ETCD_STRICT_RECONFIG_CHECK".into(), "true".into());

        if let Some(dir) = &self.pki_peers_dir {
            env.insert("ETCD_PEER_CLIENT_CERT_AUTH".into(), "true".into());
            env.insert(
                "ETCD_PEER_TRUSTED_CA_FILE".into(),
                dir.join("ca.crt").display().to_string(),
            );
            env.insert(
                "ETCD_PEER_CERT_FILE".into(),
                dir.join("me.crt").display().to_string(),
            );
            env.insert(
                "ETCD_PEER_KEY_FILE".into(),
                dir.join("me.key").display().to_string(),
            );
        } else {
            warn!("using insecure configuration for etcd peers");
        }

        if let Some(dir) = &self.pki_clients_dir {
            env.insert("ETCD_CLIENT_CERT_AUTH".into(), "true".into());
            env.insert(
                "ETCD_TRUSTED_CA_FILE".into(),
                dir.join("ca.crt").display().to_string(),
            );
            env.insert(
                "ETCD_CERT_FILE".into(),
                dir.join("server.crt").display().to_string(),
            );
            env.insert(
                "ETCD_KEY_FILE".into(),
                dir.join("server.key").display().to_string(),
            );
        } else {
            warn!("using insecure configuration for etcd clients");
        }

        // etcd 3.5 had corruption issues and recommends this check.
        if let Some((3, 5)) = parse_major_minor(&self.etcd_version) {
            env.insert(
                "ETCD_EXPERIMENTAL_INITIAL_CORRUPT_CHECK".into(),
                "true".into(),
            );
        }

        // Operator-provided environment wins; this must stay the last step.
        for (key, value) in ambient {
            if key.starts_with("ETCD_") {
                info!("overriding etcd setting {} from environment", key);
                env.insert(key.clone(), value.clone());
            }
        }

        Ok(env)
    }
}

fn parse_major_minor(version: &str) -> Option<(u64, u64)> {
    let trimmed = version.trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(trimmed) {
        return Some((v.major, v.minor));
    }
    // Tolerate two-component versions like "3.5".
    let mut parts = trimmed.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Locates the install directory holding `cmd` for the requested version.
pub async fn bindir_for_version(
    roots: &[PathBuf],
    etcd_version: &str,
    cmd: &str,
) -> Result<PathBuf, KeeperError> {
    let version = if etcd_version.starts_with('v') {
        etcd_version.to_string()
    } else {
        format!("v{etcd_version}")
    };
    let mut searched = Vec::new();
    for root in roots {
        let bin_dir = root.join(format!("etcd-{version}"));
        if tokio::fs::metadata(bin_dir.join(cmd)).await.is_ok() {
            return Ok(bin_dir);
        }
        searched.push(bin_dir);
    }
    Err(KeeperError::Process(format!(
        "etcd version {etcd_version}: {cmd} not found in {searched:?}"
    )))
}

/// A running etcd process owned exclusively by the local supervisor.
pub struct EtcdProcess {
    plan: ProcessPlan,
    pid: u32,
    exit_state: Arc<Mutex<Option<ExitStatus>>>,
    exited_rx: watch::Receiver<bool>,
}

impl EtcdProcess {
    /// Spawns etcd according to `plan` and a monitor task that captures the
    /// exit state.
    pub async fn start(plan: ProcessPlan) -> Result<Self, KeeperError> {
        let env = plan.build_env(&std::env::vars().collect::<Vec<_>>())?;

        let mut command = Command::new(plan.bin_dir.join("etcd"));
        command.current_dir(&plan.current_dir);
        if plan.force_new_cluster {
            command.arg("--force-new-cluster");
        }
        command.envs(&env);
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| KeeperError::Process(format!("starting etcd: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| KeeperError::Process("etcd exited before it could be tracked".into()))?;
        info!(
            "started etcd {} with datadir {:?}; pid={}",
            plan.etcd_version, plan.data_dir, pid
        );

        let exit_state = Arc::new(Mutex::new(None));
        let (exited_tx, exited_rx) = watch::channel(false);
        let monitor_exit_state = exit_state.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!("etcd process exited (pid={}): {}", pid, status);
                    *monitor_exit_state.lock() = Some(status);
                }
                Err(e) => warn!("waiting for etcd process (pid={}): {}", pid, e),
            }
            let _ = exited_tx.send(true);
        });

        Ok(Self {
            plan,
            pid,
            exit_state,
            exited_rx,
        })
    }

    pub fn plan(&self) -> &ProcessPlan {
        &self.plan
    }

    pub fn is_running(&self) -> bool {
        self.exit_state.lock().is_none()
    }

    pub fn exit_state(&self) -> Option<ExitStatus> {
        *self.exit_state.lock()
    }

    /// Stops the process: SIGTERM, then SIGKILL once `grace` has elapsed.
    pub async fn stop(&self, grace: Duration) -> Result<(), KeeperError> {
        if !self.is_running() {
            warn!("received stop when etcd (pid={}) not running", self.pid);
            return Ok(());
        }
        // SAFETY: plain kill(2) on a pid we spawned and still monitor.
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
        let mut exited = self.exited_rx.clone();
        if timeout(grace, exited.wait_for(|done| *done)).await.is_ok() {
            return Ok(());
        }
        warn!(
            "etcd (pid={}) did not exit within {:?}; sending SIGKILL",
            self.pid, grace
        );
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
        let mut exited = self.exited_rx.clone();
        if timeout(Duration::from_secs(10), exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            return Err(KeeperError::Process(format!(
                "etcd (pid={}) survived SIGKILL",
                self.pid
            )));
        }
        Ok(())
    }
}

/// Runs `etcdctl snapshot save`, writing the snapshot blob to `out`.
pub async fn snapshot_save(
    bin_dir: &Path,
    endpoints: &[String],
    out: &Path,
) -> Result<(), KeeperError> {
    let output = Command::new(bin_dir.join("etcdctl"))
        .arg("snapshot")
        .arg("save")
        .arg(out)
        .arg("--endpoints")
        .arg(endpoints.join(","))
        .env("ETCDCTL_API", "3")
        .output()
        .await
        .map_err(|e| KeeperError::Process(format!("running etcdctl snapshot save: {e}")))?;
    if !output.status.success() {
        return Err(KeeperError::Process(format!(
            "etcdctl snapshot save failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Runs `etcdctl snapshot restore`, producing a fresh data directory that
/// belongs to the new cluster incarnation named by `cluster_token`.
pub async fn snapshot_restore(
    bin_dir: &Path,
    snapshot_file: &Path,
    my_node: &EtcdNode,
    nodes: &[EtcdNode],
    cluster_token: &str,
    data_dir: &Path,
) -> Result<(), KeeperError> {
    let output = Command::new(bin_dir.join("etcdctl"))
        .arg("snapshot")
        .arg("restore")
        .arg(snapshot_file)
        .arg("--name")
        .arg(&my_node.name)
        .arg("--initial-cluster")
        .arg(initial_cluster_string(nodes))
        .arg("--initial-cluster-token")
        .arg(cluster_token)
        .arg("--initial-advertise-peer-urls")
        .arg(my_node.peer_urls.join(","))
        .arg("--data-dir")
        .arg(data_dir)
        .env("ETCDCTL_API", "3")
        .output()
        .await
        .map_err(|e| KeeperError::Process(format!("running etcdctl snapshot restore: {e}")))?;
    if !output.status.success() {
        return Err(KeeperError::Process(format!(
            "etcdctl snapshot restore failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    info!("snapshot restore complete into {:?}", data_dir);
    Ok(())
}
