// src/core/specstore.rs

//! Persistence for the expected cluster specification.
//!
//! The controller reads the spec every tick and writes it back after a
//! successful reconfiguration. The spec is additionally mirrored into the
//! database itself so a restored cluster can be cross-checked against what
//! the supervisors believe.

use crate::core::errors::KeeperError;
use crate::core::protocol::ClusterSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Key under which the spec is mirrored inside the database.
pub const SPEC_MIRROR_KEY: &str = "/etcdkeeper/cluster-spec";

#[async_trait]
pub trait SpecStore: Send + Sync {
    async fn get(&self) -> Result<Option<ClusterSpec>, KeeperError>;
    async fn set(&self, spec: &ClusterSpec) -> Result<(), KeeperError>;
}

/// Spec store over a single JSON file under the data directory.
pub struct FsSpecStore {
    path: PathBuf,
}

impl FsSpecStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("cluster-spec.json"),
        }
    }
}

#[async_trait]
impl SpecStore for FsSpecStore {
    async fn get(&self) -> Result<Option<ClusterSpec>, KeeperError> {
        let body = match fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let spec = serde_json::from_slice(&body)
            .map_err(|e| KeeperError::Storage(format!("decoding cluster spec: {e}")))?;
        Ok(Some(spec))
    }

    async fn set(&self, spec: &ClusterSpec) -> Result<(), KeeperError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(spec)
            .map_err(|e| KeeperError::Storage(format!("encoding cluster spec: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &self.path).await?;
        info!(
            "persisted cluster spec: {} members at {}",
            spec.member_count, spec.etcd_version
        );
        Ok(())
    }
}
