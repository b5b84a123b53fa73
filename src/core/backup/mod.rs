// src/core/backup/mod.rs

//! Backup store abstraction and snapshot retention policy.
//!
//! The store is a flat keyspace with read-your-writes consistency per key;
//! no cross-key ordering is assumed. Keys are derived from
//! `{cluster_token}/{timestamp}` so one logical cluster incarnation groups
//! its snapshots under a common prefix.

pub mod controller;

pub use controller::BackupController;

use crate::core::errors::KeeperError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// Timestamp layout used inside backup keys. Filesystem-safe and sortable.
const KEY_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), KeeperError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, KeeperError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KeeperError>;
    async fn delete(&self, key: &str) -> Result<(), KeeperError>;
}

/// Derives the store key for a snapshot of the given cluster incarnation.
pub fn backup_key(cluster_token: &str, taken_at: DateTime<Utc>) -> String {
    format!("{cluster_token}/{}", taken_at.format(KEY_TIME_FORMAT))
}

/// Recovers the snapshot timestamp from a store key, if it has the
/// expected shape.
pub fn parse_backup_key(key: &str) -> Option<DateTime<Utc>> {
    let (_, ts) = key.rsplit_once('/')?;
    NaiveDateTime::parse_from_str(ts, KEY_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Returns the keys that should be deleted under the retention policy:
/// everything newer than `retention` is kept; older snapshots survive only
/// as the newest of their hourly bucket (for one day), daily bucket (for
/// one week), or weekly bucket (for four weeks).
pub fn plan_retention(
    entries: &[(String, DateTime<Utc>)],
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<String> {
    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;
    const WEEK: i64 = 7 * DAY;

    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);

    // bucket id -> newest (timestamp, key) seen in that bucket
    let mut keep_newest: BTreeMap<(i64, i64), (DateTime<Utc>, String)> = BTreeMap::new();
    let mut candidates = Vec::new();

    for (key, taken_at) in entries {
        let age = now.signed_duration_since(*taken_at);
        if age <= retention {
            continue;
        }
        let bucket = if age.num_seconds() < DAY {
            Some((HOUR, taken_at.timestamp() / HOUR))
        } else if age.num_seconds() < WEEK {
            Some((DAY, taken_at.timestamp() / DAY))
        } else if age.num_seconds() < 4 * WEEK {
            Some((WEEK, taken_at.timestamp() / WEEK))
        } else {
            None
        };
        match bucket {
            Some(bucket) => {
                candidates.push((key.clone(), *taken_at, bucket));
                let newest = keep_newest.entry(bucket).or_insert((*taken_at, key.clone()));
                if *taken_at > newest.0 {
                    *newest = (*taken_at, key.clone());
                }
            }
            // Older than every bucket horizon: always deleted.
            None => candidates.push((key.clone(), *taken_at, (0, 0))),
        }
    }

    candidates
        .into_iter()
        .filter(|(key, _, bucket)| {
            keep_newest
                .get(bucket)
                .is_none_or(|(_, newest_key)| newest_key != key)
        })
        .map(|(key, _, _)| key)
        .collect()
}

/// Backup store over a local or network-mounted directory.
pub struct FsBackupStore {
    root: PathBuf,
}

impl FsBackupStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BackupStore for FsBackupStore {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), KeeperError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, blob).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, KeeperError> {
        fs::read(self.path_for(key))
            .await
            .map_err(|e| KeeperError::Storage(format!("reading backup {key:?}: {e}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KeeperError> {
        let mut keys = Vec::new();
        let mut tokens = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(token_dir) = tokens.next_entry().await? {
            if !token_dir.file_type().await?.is_dir() {
                continue;
            }
            let token = token_dir.file_name().to_string_lossy().to_string();
            let mut snapshots = fs::read_dir(token_dir.path()).await?;
            while let Some(snapshot) = snapshots.next_entry().await? {
                let name = snapshot.file_name().to_string_lossy().to_string();
                if name.ends_with(".tmp") {
                    warn!("ignoring unfinished backup upload {:?}", snapshot.path());
                    continue;
                }
                let key = format!("{token}/{name}");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), KeeperError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
