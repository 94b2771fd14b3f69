//! Custom error types for the restore agent.

use thiserror::Error;

use crate::control::{ControlError, RepairError};
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Storage unreachable: {0}")]
    Storage(#[from] StorageError),

    #[error("Backup not found: {0}")]
    BackupMissing(String),

    #[error("Backup incompatible: {0}")]
    BackupIncompatible(String),

    #[error("Database binary missing: {0}")]
    EngineBinaryMissing(String),

    #[error("Engine version mismatch: {0}")]
    EngineVersionMismatch(String),

    #[error("Node is not a replica-set member: {0}")]
    NotAMember(String),

    #[error("Another operation is holding the restore lock")]
    LockContended,

    #[error("A restore is already in progress on this node")]
    Busy,

    #[error("Local database stuck: {0}")]
    LocalDbStuck(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{node} failed: {msg}")]
    PeerFailed { node: String, msg: String },

    #[error("peer stuck, last beat ts: {0}")]
    PeerStuck(i64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No data for this shard in the backup")]
    NoDataForShard,

    #[error("Control database error: {0}")]
    Control(#[from] ControlError),

    #[error("Repair session error: {0}")]
    Repair(#[from] RepairError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RestoreError {
    /// True for failures that leave the node's own data untouched and must
    /// not abort the cluster-wide restore (this node's replica set simply
    /// has no section in the backup).
    pub fn is_no_data_for_shard(&self) -> bool {
        matches!(self, RestoreError::NoDataForShard)
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
