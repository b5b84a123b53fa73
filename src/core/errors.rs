// src/core/errors.rs

//! Defines the primary error type for the supervisor.

use thiserror::Error;

/// The main error enum, representing all failure kinds the supervisor
/// distinguishes. The taxonomy matters more than the payloads: transient
/// transport errors are retried on the next tick, protocol rejections abort
/// the current action without retry, precondition failures are benign, and
/// invariant breaches are fatal.
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("rejected: stale leader epoch (got {got}, accepted {accepted})")]
    StaleEpoch { got: u64, accepted: u64 },

    #[error("rejected: request for cluster {got:?} but local cluster is {expected:?}")]
    ClusterMismatch { got: String, expected: String },

    #[error("rejected: cluster token mismatch: {0}")]
    TokenMismatch(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("split brain detected: {0}")]
    SplitBrain(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("etcd process error: {0}")]
    Process(String),

    #[error("invariant breach: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl KeeperError {
    /// True for failures that are expected to clear on their own and are
    /// therefore retried at the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KeeperError::Io(_)
                | KeeperError::Transport(_)
                | KeeperError::Timeout(_)
                | KeeperError::Storage(_)
        )
    }
}
