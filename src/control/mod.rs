//! Capability surfaces the engine consumes from the control database, the
//! local database process, and the supervised repair boots.
//!
//! The restore engine never talks a wire protocol itself: everything it
//! needs from the database side goes through these narrow traits. Concrete
//! implementations (driver-backed) live with the embedding daemon.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RestoreTuning;
use crate::meta::{BackupMeta, MongodOpts, NodeInfo, RestoreMeta, RsConfig, Shard};

/// Database holding the persistent config document and the shard identity.
pub const ADMIN_DB: &str = "admin";

/// Collection carrying the backup tool's persistent config document
/// (including the `pitr` sub-document the reconciler flips off).
pub const CONFIG_COLL: &str = "backupConfig";

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("not found")]
    NotFound,

    #[error("node is stepping down")]
    SteppingDown,

    #[error("control database error: {0}")]
    Db(String),
}

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("background operation in progress for {0}")]
    BackgroundOpInProgress(String),

    #[error("{0}")]
    Op(String),
}

impl RepairError {
    pub fn is_background_op(&self) -> bool {
        matches!(self, RepairError::BackgroundOpInProgress(_))
    }
}

/// Persistent config document read from the control database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub restore: RestoreTuning,
    #[serde(default)]
    pub pitr: PitrConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PitrConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// A named mutual-exclusion lock on the control database, keyed by
/// `(replica set, node)`. Fences concurrent operation kinds.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub kind: String,
    pub replset: String,
    pub node: String,
    pub opid: String,
    pub epoch: i64,
}

/// Control-database surface.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn config(&self) -> Result<ControlConfig, ControlError>;

    async fn backup_meta(&self, name: &str) -> Result<BackupMeta, ControlError>;

    /// Record which backup a restore operates on.
    async fn set_restore_backup(&self, restore: &str, backup: &str) -> Result<(), ControlError>;

    /// Create the restore descriptor (leader, at init).
    async fn create_restore_meta(&self, meta: &RestoreMeta) -> Result<(), ControlError>;

    /// Every replica set in the cluster, config server included.
    async fn cluster_members(&self) -> Result<Vec<Shard>, ControlError>;

    /// Data shards only.
    async fn shards(&self) -> Result<Vec<Shard>, ControlError>;

    /// Try to acquire the named lock. `Ok(false)` means contended.
    async fn acquire_lock(&self, req: &LockRequest) -> Result<bool, ControlError>;

    async fn release_lock(&self, req: &LockRequest) -> Result<(), ControlError>;
}

/// Replica-set status as seen by the local node.
#[derive(Debug, Clone)]
pub struct RsStatus {
    /// Hosts of all members, arbiters included.
    pub members: Vec<String>,
}

/// Surface of the local, still-running database process. Valid until the
/// flush shuts it down.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn info(&self) -> Result<NodeInfo, ControlError>;

    async fn rs_config(&self) -> Result<RsConfig, ControlError>;

    async fn rs_status(&self) -> Result<RsStatus, ControlError>;

    /// Stored engine options: data path, port, security section.
    async fn mongod_opts(&self) -> Result<MongodOpts, ControlError>;

    async fn engine_version(&self) -> Result<String, ControlError>;

    /// Connection string of the config-server replica set, as recorded in
    /// this shard's identity document.
    async fn conf_svr_conn(&self) -> Result<String, ControlError>;

    /// Ask the local process to shut down. Implementations swallow the
    /// benign connection-reset this causes and surface `SteppingDown` when
    /// the node refuses because a step-down is in flight.
    async fn signal_shutdown(&self) -> Result<(), ControlError>;
}

/// Dials the supervised loopback-only boot.
#[async_trait]
pub trait RepairConnector: Send + Sync {
    async fn connect(
        &self,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn RepairSession>, RepairError>;
}

/// Admin operations against a supervised standalone boot. Documents are
/// plain JSON values; implementations map them onto the wire format.
#[async_trait]
pub trait RepairSession: Send + Sync {
    async fn drop_collection(&self, db: &str, coll: &str) -> Result<(), RepairError>;

    async fn delete_many(&self, db: &str, coll: &str, filter: Value) -> Result<u64, RepairError>;

    async fn insert_one(&self, db: &str, coll: &str, doc: Value) -> Result<(), RepairError>;

    async fn update_many(
        &self,
        db: &str,
        coll: &str,
        filter: Value,
        update: Value,
    ) -> Result<u64, RepairError>;

    async fn find(&self, db: &str, coll: &str, filter: Value) -> Result<Vec<Value>, RepairError>;

    /// Collection names in `db` starting with `prefix`.
    async fn list_collections(&self, db: &str, prefix: &str) -> Result<Vec<String>, RepairError>;

    /// Atomically replace the whole collection content: delete everything,
    /// then bulk-insert `docs`.
    async fn replace_all(&self, db: &str, coll: &str, docs: Vec<Value>) -> Result<(), RepairError>;

    /// Send the shutdown command. The connection is gone afterwards.
    async fn shutdown(&self) -> Result<(), RepairError>;
}
