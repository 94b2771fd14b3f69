//! Shared in-memory fakes for tests: object store, control plane, local
//! node, repair sessions, plus a stand-in database binary.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use crate::config::RestoreTuning;
use crate::control::{
    ControlConfig, ControlError, ControlPlane, LockRequest, NodeClient, RepairConnector,
    RepairError, RepairSession, RsStatus,
};
use crate::meta::{BackupMeta, MongodOpts, NodeInfo, RestoreMeta, RsConfig, Shard};
use crate::storage::{FileStat, ObjReader, ObjectStore, StorageError};

// ---------------------------------------------------------------------------
// object store

pub struct MemStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), data.into());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn save(&self, name: &str, mut data: ObjReader, _size: i64) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;
        self.objects.lock().unwrap().insert(name.to_string(), buf);
        Ok(())
    }

    async fn source_reader(&self, name: &str) -> Result<ObjReader, StorageError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(StorageError::NotExist)?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn file_stat(&self, name: &str) -> Result<FileStat, StorageError> {
        let guard = self.objects.lock().unwrap();
        let data = guard.get(name).ok_or(StorageError::NotExist)?;
        if data.is_empty() {
            return Err(StorageError::Empty);
        }
        Ok(FileStat {
            size: data.len() as i64,
        })
    }
}

// ---------------------------------------------------------------------------
// control plane

pub struct FakeControl {
    pub cfg: ControlConfig,
    pub backups: Mutex<HashMap<String, BackupMeta>>,
    pub members: Vec<Shard>,
    pub data_shards: Vec<Shard>,
    pub locks: Mutex<HashSet<String>>,
    pub restores: Mutex<Vec<RestoreMeta>>,
}

impl FakeControl {
    pub fn new(members: Vec<Shard>, data_shards: Vec<Shard>) -> Self {
        Self {
            cfg: ControlConfig {
                restore: RestoreTuning::default(),
                ..Default::default()
            },
            backups: Mutex::new(HashMap::new()),
            members,
            data_shards,
            locks: Mutex::new(HashSet::new()),
            restores: Mutex::new(Vec::new()),
        }
    }

    pub fn add_backup(&self, meta: BackupMeta) {
        self.backups.lock().unwrap().insert(meta.name.clone(), meta);
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn config(&self) -> Result<ControlConfig, ControlError> {
        Ok(self.cfg.clone())
    }

    async fn backup_meta(&self, name: &str) -> Result<BackupMeta, ControlError> {
        self.backups
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(ControlError::NotFound)
    }

    async fn set_restore_backup(&self, _restore: &str, _backup: &str) -> Result<(), ControlError> {
        Ok(())
    }

    async fn create_restore_meta(&self, meta: &RestoreMeta) -> Result<(), ControlError> {
        self.restores.lock().unwrap().push(meta.clone());
        Ok(())
    }

    async fn cluster_members(&self) -> Result<Vec<Shard>, ControlError> {
        Ok(self.members.clone())
    }

    async fn shards(&self) -> Result<Vec<Shard>, ControlError> {
        Ok(self.data_shards.clone())
    }

    async fn acquire_lock(&self, req: &LockRequest) -> Result<bool, ControlError> {
        Ok(self.locks.lock().unwrap().insert(req.replset.clone()))
    }

    async fn release_lock(&self, req: &LockRequest) -> Result<(), ControlError> {
        self.locks.lock().unwrap().remove(&req.replset);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// local node

pub struct FakeNode {
    pub info: Mutex<NodeInfo>,
    pub rs_conf: RsConfig,
    pub status: RsStatus,
    pub opts: MongodOpts,
    pub version: String,
    pub cfg_conn: String,
    /// Flip `is_primary` off after this many `info()` calls (step-down).
    pub demote_after: Option<usize>,
    info_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
}

impl FakeNode {
    pub fn new(info: NodeInfo, rs_conf: RsConfig, opts: MongodOpts) -> Self {
        let members = rs_conf.members.iter().map(|m| m.host.clone()).collect();
        Self {
            info: Mutex::new(info),
            rs_conf,
            status: RsStatus { members },
            opts,
            version: "7.0.0".to_string(),
            cfg_conn: String::new(),
            demote_after: None,
            info_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn info(&self) -> Result<NodeInfo, ControlError> {
        let n = self.info_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(after) = self.demote_after {
            if n >= after {
                self.info.lock().unwrap().is_primary = false;
            }
        }
        Ok(self.info.lock().unwrap().clone())
    }

    async fn rs_config(&self) -> Result<RsConfig, ControlError> {
        Ok(self.rs_conf.clone())
    }

    async fn rs_status(&self) -> Result<RsStatus, ControlError> {
        Ok(self.status.clone())
    }

    async fn mongod_opts(&self) -> Result<MongodOpts, ControlError> {
        Ok(self.opts.clone())
    }

    async fn engine_version(&self) -> Result<String, ControlError> {
        Ok(self.version.clone())
    }

    async fn conf_svr_conn(&self) -> Result<String, ControlError> {
        Ok(self.cfg_conn.clone())
    }

    async fn signal_shutdown(&self) -> Result<(), ControlError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// repair sessions

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOp {
    Drop {
        db: String,
        coll: String,
    },
    DeleteMany {
        db: String,
        coll: String,
        filter: Value,
    },
    Insert {
        db: String,
        coll: String,
        doc: Value,
    },
    UpdateMany {
        db: String,
        coll: String,
        filter: Value,
        update: Value,
    },
    ReplaceAll {
        db: String,
        coll: String,
        docs: Vec<Value>,
    },
    Shutdown,
}

#[derive(Default)]
pub struct RepairState {
    pub ops: Mutex<Vec<RepairOp>>,
    /// Canned results for `find`, keyed by `db.coll`.
    pub find_results: Mutex<HashMap<String, Vec<Value>>>,
    /// Canned collection listings, keyed by db.
    pub collections: Mutex<HashMap<String, Vec<String>>>,
    /// Times the sessions-collection drop should fail with a background op.
    pub busy_session_drops: AtomicUsize,
}

impl RepairState {
    pub fn ops(&self) -> Vec<RepairOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn has_drop(&self, db: &str, coll: &str) -> bool {
        self.ops().iter().any(|o| {
            matches!(o, RepairOp::Drop { db: d, coll: c } if d == db && c == coll)
        })
    }
}

pub struct FakeSession(pub Arc<RepairState>);

#[async_trait]
impl RepairSession for FakeSession {
    async fn drop_collection(&self, db: &str, coll: &str) -> Result<(), RepairError> {
        if db == "config" && coll == "system.sessions" {
            let left = self.0.busy_session_drops.load(Ordering::SeqCst);
            if left > 0 {
                self.0.busy_session_drops.store(left - 1, Ordering::SeqCst);
                return Err(RepairError::BackgroundOpInProgress(format!("{db}.{coll}")));
            }
        }
        self.0.ops.lock().unwrap().push(RepairOp::Drop {
            db: db.to_string(),
            coll: coll.to_string(),
        });
        Ok(())
    }

    async fn delete_many(&self, db: &str, coll: &str, filter: Value) -> Result<u64, RepairError> {
        self.0.ops.lock().unwrap().push(RepairOp::DeleteMany {
            db: db.to_string(),
            coll: coll.to_string(),
            filter,
        });
        Ok(0)
    }

    async fn insert_one(&self, db: &str, coll: &str, doc: Value) -> Result<(), RepairError> {
        self.0.ops.lock().unwrap().push(RepairOp::Insert {
            db: db.to_string(),
            coll: coll.to_string(),
            doc,
        });
        Ok(())
    }

    async fn update_many(
        &self,
        db: &str,
        coll: &str,
        filter: Value,
        update: Value,
    ) -> Result<u64, RepairError> {
        self.0.ops.lock().unwrap().push(RepairOp::UpdateMany {
            db: db.to_string(),
            coll: coll.to_string(),
            filter,
            update,
        });
        Ok(1)
    }

    async fn find(&self, db: &str, coll: &str, _filter: Value) -> Result<Vec<Value>, RepairError> {
        Ok(self
            .0
            .find_results
            .lock()
            .unwrap()
            .get(&format!("{db}.{coll}"))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_collections(&self, db: &str, prefix: &str) -> Result<Vec<String>, RepairError> {
        Ok(self
            .0
            .collections
            .lock()
            .unwrap()
            .get(db)
            .map(|colls| {
                colls
                    .iter()
                    .filter(|c| c.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_all(&self, db: &str, coll: &str, docs: Vec<Value>) -> Result<(), RepairError> {
        self.0.ops.lock().unwrap().push(RepairOp::ReplaceAll {
            db: db.to_string(),
            coll: coll.to_string(),
            docs,
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RepairError> {
        self.0.ops.lock().unwrap().push(RepairOp::Shutdown);
        Ok(())
    }
}

pub struct FakeConnector {
    pub state: Arc<RepairState>,
    /// Number of connect attempts to reject before succeeding.
    pub fail_connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(state: Arc<RepairState>) -> Self {
        Self {
            state,
            fail_connects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RepairConnector for FakeConnector {
    async fn connect(
        &self,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn RepairSession>, RepairError> {
        let left = self.fail_connects.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_connects.store(left - 1, Ordering::SeqCst);
            return Err(RepairError::Connect("connection refused".to_string()));
        }
        Ok(Box::new(FakeSession(self.state.clone())))
    }
}

// ---------------------------------------------------------------------------
// stand-in database binary

/// Write an executable shell script that mimics the database binary well
/// enough for boot supervision: reports a version, exits cleanly otherwise.
pub fn fake_mongod(dir: &Path, version: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("mongod");
    std::fs::write(
        &path,
        format!("#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"db version v{version}\"\n  exit 0\nfi\nexit 0\n"),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
