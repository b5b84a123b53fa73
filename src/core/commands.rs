// src/core/commands.rs

//! Durable queue of operator-issued commands, plus the new-cluster marker.
//!
//! Commands are consumed exactly once: the reconciler lists them, executes
//! at most one per tick, and removes it only after the action completed.
//! The new-cluster marker is a filesystem sentinel under the data directory
//! whose presence authorizes a destructive CREATE; only the operator
//! creates it and the controller removes it exactly once.

use crate::core::errors::KeeperError;
use crate::core::protocol::{Command, CommandKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// Name of the sentinel file authorizing a destructive CREATE.
const NEW_CLUSTER_MARKER_FILE: &str = "please-create-new-cluster";

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Idempotent on command id.
    async fn add(&self, command: &Command) -> Result<(), KeeperError>;
    /// Oldest first.
    async fn list(&self) -> Result<Vec<Command>, KeeperError>;
    /// Removing an unknown id is not an error.
    async fn remove(&self, command_id: &str) -> Result<(), KeeperError>;

    async fn is_new_cluster(&self) -> Result<bool, KeeperError>;
    /// Consumes the marker after CREATE completed.
    async fn mark_cluster_created(&self) -> Result<(), KeeperError>;
}

/// Command store over a directory of JSON files, one per command.
pub struct FsCommandStore {
    commands_dir: PathBuf,
    data_dir: PathBuf,
}

impl FsCommandStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            commands_dir: data_dir.join("commands"),
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn command_path(&self, id: &str) -> PathBuf {
        self.commands_dir.join(format!("{id}.json"))
    }

    fn marker_path(&self) -> PathBuf {
        self.data_dir.join(NEW_CLUSTER_MARKER_FILE)
    }
}

/// Builds a fresh restore command for the given backup.
pub fn restore_command(backup_ref: &str) -> Command {
    Command {
        id: uuid::Uuid::new_v4().to_string(),
        kind: CommandKind::RestoreBackup {
            backup_ref: backup_ref.to_string(),
        },
        created_at: chrono::Utc::now().timestamp(),
    }
}

#[async_trait]
impl CommandStore for FsCommandStore {
    async fn add(&self, command: &Command) -> Result<(), KeeperError> {
        fs::create_dir_all(&self.commands_dir).await?;
        let path = self.command_path(&command.id);
        let body = serde_json::to_vec_pretty(command)
            .map_err(|e| KeeperError::Storage(format!("encoding command: {e}")))?;
        // Write-then-rename so a crash never leaves a half-written command.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &path).await?;
        info!("persisted command {} ({:?})", command.id, command.kind);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Command>, KeeperError> {
        let mut commands = Vec::new();
        let mut dir = match fs::read_dir(&self.commands_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(commands),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let body = fs::read(&path).await?;
            match serde_json::from_slice::<Command>(&body) {
                Ok(command) => commands.push(command),
                Err(e) => warn!("skipping unreadable command file {:?}: {}", path, e),
            }
        }
        commands.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(commands)
    }

    async fn remove(&self, command_id: &str) -> Result<(), KeeperError> {
        match fs::remove_file(self.command_path(command_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_new_cluster(&self) -> Result<bool, KeeperError> {
        match fs::metadata(self.marker_path()).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_cluster_created(&self) -> Result<(), KeeperError> {
        let path = self.marker_path();
        fs::remove_file(&path).await.map_err(|e| {
            KeeperError::Storage(format!("deleting marker file {:?}: {e}", path))
        })?;
        info!("new-cluster marker consumed");
        Ok(())
    }
}
