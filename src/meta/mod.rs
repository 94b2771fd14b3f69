//! Backup and restore descriptors, restore statuses and cluster topology
//! types shared across the engine.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::{self, ObjectStore};
use crate::utils::errors::{RestoreError, Result};

/// Version of this tool, recorded in descriptors it writes.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Restore/backup lifecycle status. Written verbatim into rendezvous
/// object names, so the string forms are part of the on-storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "running")]
    Running,
    /// Data shards have stopped. Config-server replica set only waits on it.
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "partly-done")]
    PartlyDone,
    #[serde(rename = "error")]
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "init",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Down => "down",
            Status::Done => "done",
            Status::PartlyDone => "partly-done",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    #[serde(rename = "logical")]
    Logical,
    #[serde(rename = "physical")]
    Physical,
    #[serde(rename = "incremental")]
    Incremental,
}

/// Compression codec of backup artifacts. The suffix is appended to the
/// stored object names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "zstd")]
    Zstd,
}

impl Compression {
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }
}

/// Engine timestamp: seconds + an ordinal within the second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct OpTime {
    pub ts: u32,
    pub inc: u32,
}

impl OpTime {
    pub fn new(ts: u32, inc: u32) -> Self {
        Self { ts, inc }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ts, self.inc)
    }
}

/// One storage-engine file recorded in a backup.
///
/// `offset == -1 && length == -1` marks a file that is unchanged since the
/// previous backup in the chain: the target backup lists it so the restore
/// knows to pull its bytes from an ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub length: i64,
    /// Logical file size to truncate to after copy. 0 means "leave as is".
    #[serde(default)]
    pub size: i64,
    /// Unix permission bits for the destination file.
    #[serde(default = "default_fmode")]
    pub fmode: u32,
}

fn default_fmode() -> u32 {
    0o600
}

impl BackupFile {
    pub fn restorable(&self) -> bool {
        self.offset >= 0 && self.length >= 0
    }
}

impl fmt::Display for BackupFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 && self.length == 0 {
            f.write_str(&self.name)
        } else {
            write!(f, "{} [{}:{}]", self.name, self.offset, self.length)
        }
    }
}

/// Per-replica-set section of a backup descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplsetMeta {
    pub name: String,
    #[serde(default)]
    pub files: Vec<BackupFile>,
    #[serde(default)]
    pub journal: Vec<BackupFile>,
    #[serde(default)]
    pub last_write_ts: OpTime,
    /// Engine options recorded at backup time (directory-per-db etc.),
    /// reused for the supervised boots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongod_opts: Option<MongodOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_config_svr: Option<bool>,
}

/// Backup descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    pub name: String,
    pub kind: BackupKind,
    #[serde(default)]
    pub compression: Compression,
    /// Ancestor for incremental backups; empty for a full base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_backup: Option<String>,
    /// Replica-set name -> shard name, for shards named differently from
    /// their replica set at backup time.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub shard_remap: HashMap<String, String>,
    #[serde(default)]
    pub replsets: Vec<ReplsetMeta>,
    #[serde(default)]
    pub last_write_ts: OpTime,
    /// major.minor[.patch] of the engine the backup was taken from.
    pub engine_version: String,
    pub tool_version: String,
    pub status: Status,
    #[serde(default)]
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupMeta {
    pub fn replset(&self, name: &str) -> Option<&ReplsetMeta> {
        self.replsets.iter().find(|r| r.name == name)
    }
}

/// Condition log entry of a restore descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub timestamp: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReplset {
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub last_transition_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Restore descriptor. Created by the leader at init, finalized at a
/// terminal state; the on-storage rendezvous objects stay authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMeta {
    pub name: String,
    pub opid: String,
    pub backup: String,
    pub kind: BackupKind,
    pub status: Status,
    #[serde(default)]
    pub replsets: Vec<RestoreReplset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default)]
    pub start_ts: i64,
    #[serde(default)]
    pub last_transition_ts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_chain: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_version: String,
}

/// This node's view of itself and the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `host:port` this node is known by in the replica-set config.
    pub me: String,
    pub set_name: String,
    pub is_primary: bool,
    pub is_config_svr: bool,
    pub is_sharded: bool,
}

impl NodeInfo {
    /// Replica-set leader: drives rs-level rendezvous writes.
    pub fn is_rs_leader(&self) -> bool {
        self.is_primary
    }

    /// Cluster leader: the config-server primary in a sharded cluster, the
    /// primary otherwise.
    pub fn is_cluster_leader(&self) -> bool {
        self.is_primary && (self.is_config_svr || !self.is_sharded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsMember {
    #[serde(rename = "_id")]
    pub id: i32,
    pub host: String,
    #[serde(default)]
    pub arbiter_only: bool,
    #[serde(default)]
    pub priority: Option<f64>,
}

/// Replica-set configuration as stored in the local system collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsConfig {
    #[serde(rename = "_id")]
    pub id: String,
    pub version: i32,
    pub members: Vec<RsMember>,
    #[serde(default)]
    pub configsvr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
}

/// One shard as listed by the control database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    /// Replica-set name backing the shard.
    pub rs: String,
    /// Connection URI, `rs-name/host1:port,host2:port`.
    pub host: String,
}

/// Minimal engine options synthesized for the supervised boots. Serialized
/// as the YAML configuration file the database binary consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongodOpts {
    pub storage: StorageOpts,
    #[serde(default)]
    pub net: NetOpts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageOpts {
    #[serde(default)]
    pub db_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "directoryPerDB")]
    pub directory_per_db: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetOpts {
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
}

/// Forward replica-set rename: backup-side name to target-side name.
pub fn map_rs_name(map: &HashMap<String, String>, from: &str) -> String {
    map.get(from).cloned().unwrap_or_else(|| from.to_string())
}

/// Reverse rename: target-side name back to the name recorded in the backup.
pub fn reverse_rs_name(map: &HashMap<String, String>, target: &str) -> String {
    map.iter()
        .find(|(_, v)| v.as_str() == target)
        .map(|(k, _)| k.clone())
        .unwrap_or_else(|| target.to_string())
}

/// `major.minor` of a version string, tolerating a leading `v`.
pub fn majmin(v: &str) -> String {
    let v = v.trim_start_matches('v');
    let mut it = v.split('.');
    match (it.next(), it.next()) {
        (Some(maj), Some(min)) => format!("{maj}.{min}"),
        (Some(maj), None) => maj.to_string(),
        _ => String::new(),
    }
}

/// Restorable-backup predicate for tool versions: the backup must come from
/// the same major version of this tool.
pub fn compatible_tool_version(backup_tool: &str) -> bool {
    let ours = TOOL_VERSION.split('.').next().unwrap_or("0");
    backup_tool.trim_start_matches('v').split('.').next() == Some(ours)
}

/// Root prefix of all restore metadata and rendezvous objects on storage.
pub const RESTORE_DIR: &str = ".restore";

/// Location of a backup descriptor mirrored to storage.
pub fn backup_meta_object(name: &str) -> String {
    format!("{name}.backup.json")
}

/// Fetch a backup descriptor from its storage mirror. Used when the control
/// database has no record of the backup (e.g. restoring into a new cluster).
pub async fn backup_meta_from_store(stg: &dyn ObjectStore, name: &str) -> Result<BackupMeta> {
    let body = storage::read_to_vec(stg, &backup_meta_object(name))
        .await
        .map_err(|_| RestoreError::BackupMissing(name.to_string()))?;
    Ok(serde_json::from_slice(&body)?)
}
