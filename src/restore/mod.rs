//! Physical restore of the local node, coordinated with the rest of the
//! cluster through storage.
//!
//! Every node of every replica set takes part. Each node stores its current
//! replica-set config and port, validates the backup, stops the local
//! database, wipes the data path, streams the planned artifacts into place,
//! runs three supervised repair boots and reinstates the replica-set
//! config, rendezvousing with its peers at `starting`, `running` and `done`.
//!
//! Failures before the data path is wiped leave the node intact. After that
//! point an error wipes the data path again so the node can cold-join via
//! initial sync once the rest of the cluster comes up. A node that finished
//! its local restore is never marked failed, whatever happens later.

pub mod boot;
pub mod copy;
pub mod reconcile;
pub mod rendezvous;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::RestoreTuning;
use crate::control::{ControlError, ControlPlane, NodeClient, RepairConnector};
use crate::meta::{
    backup_meta_from_store, compatible_tool_version, majmin, reverse_rs_name, BackupKind,
    BackupMeta, Condition, MongodOpts, NetOpts, NodeInfo, RestoreMeta, RestoreReplset, RsConfig,
    Shard, Status, RESTORE_DIR, TOOL_VERSION,
};
use crate::plan::{self, Plan};
use crate::restore::boot::{BootSpec, BOOT_LOG_FILE};
use crate::restore::reconcile::{shard_rename_mapping, RepairBoots, ResetContext};
use crate::restore::rendezvous::{
    cluster_sync_path, node_log_path, node_stat_path, node_sync_path, rs_sync_path, Rendezvous,
    HB_PERIOD, POLL_PERIOD,
};
use crate::storage::{exists, save_bytes, ObjectStore};
use crate::utils::errors::{RestoreError, Result};
use crate::utils::logbuf::StorageLog;
use crate::utils::unix_now;

const DEFAULT_RS_DBPATH: &str = "/data/db";
const DEFAULT_CSRS_DBPATH: &str = "/data/configdb";
const DEFAULT_PORT: u16 = 27017;

/// Operator command starting a restore.
#[derive(Debug, Clone)]
pub struct RestoreCmd {
    /// Restore name, the rendezvous namespace key.
    pub name: String,
    pub backup_name: String,
    /// Backup-side replica-set name -> target-side name.
    pub rs_remap: HashMap<String, String>,
}

/// Local milestones that change failure handling.
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    /// Data path wiped; an error from here on must wipe it again.
    started: bool,
    /// Local data fully restored; the node is never marked failed past this.
    done: bool,
}

pub struct PhysicalRestore {
    ctl: Arc<dyn ControlPlane>,
    node: Arc<dyn NodeClient>,
    stg: Arc<dyn ObjectStore>,
    connector: Arc<dyn RepairConnector>,

    node_info: NodeInfo,
    rs_conf: RsConfig,
    dbpath: PathBuf,
    tmp_port: u16,
    security: Option<serde_json::Value>,
    /// Target shard name -> host URI; empty on an unsharded cluster.
    shards: HashMap<String, String>,
    cfg_conn: String,
    rs_map: HashMap<String, String>,
    fallback_tuning: RestoreTuning,

    // set by init()
    name: String,
    start_ts: i64,
    binary: String,
    tuning: RestoreTuning,
    members: Vec<Shard>,
    /// Target rs name -> rs-scoped sync prefix, every participating set.
    shard_sync: HashMap<String, String>,
    /// Rs-scoped sync prefixes of the data shards (config server only).
    data_shard_sync: HashSet<String>,
    stat_path: String,
    tmp_conf: Option<NamedTempFile>,
    rendezvous: Option<Arc<Rendezvous>>,
    rlog: Option<Arc<StorageLog>>,
    hb_cancel: CancellationToken,

    /// Fired once the command stream is about to die with the local
    /// database; lets the embedding daemon stop its ingestion loop.
    pub offline_tx: Option<oneshot::Sender<()>>,

    pub poll: Duration,
    pub hb_period: Duration,
}

impl PhysicalRestore {
    pub async fn new(
        ctl: Arc<dyn ControlPlane>,
        node: Arc<dyn NodeClient>,
        stg: Arc<dyn ObjectStore>,
        connector: Arc<dyn RepairConnector>,
        rs_map: HashMap<String, String>,
        fallback_tuning: RestoreTuning,
    ) -> Result<Self> {
        let node_info = node.info().await?;
        if node_info.set_name.is_empty() {
            return Err(RestoreError::NotAMember(
                "standalone node has no oplog to recover from".to_string(),
            ));
        }

        let opts = node.mongod_opts().await?;
        let dbpath = if opts.storage.db_path.is_empty() {
            PathBuf::from(if node_info.is_config_svr {
                DEFAULT_CSRS_DBPATH
            } else {
                DEFAULT_RS_DBPATH
            })
        } else {
            PathBuf::from(&opts.storage.db_path)
        };
        let port = if opts.net.port == 0 {
            DEFAULT_PORT
        } else {
            opts.net.port
        };

        let rs_conf = node.rs_config().await?;

        let mut shards = HashMap::new();
        let mut cfg_conn = String::new();
        if node_info.is_sharded {
            for s in ctl.shards().await? {
                shards.insert(s.id, s.host);
            }
            if !node_info.is_config_svr {
                cfg_conn = node.conf_svr_conn().await?;
            }
        }

        let tmp_port = boot::pick_tmp_port(port)?;

        Ok(Self {
            ctl,
            node,
            stg,
            connector,
            node_info,
            rs_conf,
            dbpath,
            tmp_port,
            security: opts.security,
            shards,
            cfg_conn,
            rs_map,
            fallback_tuning,
            name: String::new(),
            start_ts: 0,
            binary: String::new(),
            tuning: RestoreTuning::default(),
            members: Vec::new(),
            shard_sync: HashMap::new(),
            data_shard_sync: HashSet::new(),
            stat_path: String::new(),
            tmp_conf: None,
            rendezvous: None,
            rlog: None,
            hb_cancel: CancellationToken::new(),
            offline_tx: None,
            poll: POLL_PERIOD,
            hb_period: HB_PERIOD,
        })
    }

    /// Restore this node from the physical snapshot and rendezvous with the
    /// cluster until a terminal state.
    pub async fn snapshot(
        mut self,
        cmd: &RestoreCmd,
        opid: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let now = unix_now();
        let mut meta = RestoreMeta {
            name: cmd.name.clone(),
            opid: opid.to_string(),
            backup: cmd.backup_name.clone(),
            kind: BackupKind::Physical,
            status: Status::Init,
            replsets: vec![RestoreReplset {
                name: self.rs_conf.id.clone(),
                status: Status::Init,
                last_transition_ts: now,
                error: None,
            }],
            leader: self
                .node_info
                .is_cluster_leader()
                .then(|| format!("{}/{}", self.node_info.me, self.rs_conf.id)),
            start_ts: now,
            last_transition_ts: now,
            backup_chain: Vec::new(),
            conditions: vec![Condition {
                timestamp: now,
                status: Status::Init,
                error: None,
            }],
            error: None,
            tool_version: TOOL_VERSION.to_string(),
        };

        let mut progress = Progress::default();
        let res = self.run(cmd, opid, &mut meta, &mut progress, &cancel).await;
        self.finish(res, progress).await
    }

    async fn run(
        &mut self,
        cmd: &RestoreCmd,
        opid: &str,
        meta: &mut RestoreMeta,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rv = self.init(&cmd.name, opid).await?;

        if self.node_info.is_cluster_leader() {
            self.ctl.create_restore_meta(meta).await?;
        }

        let (bcp, plan) = self.prepare_backup(cmd).await?;
        meta.kind = bcp.kind;
        if bcp.kind == BackupKind::Incremental {
            meta.backup_chain = plan.chain();
        }

        self.set_tmp_conf(&bcp)?;

        rv.to_state(Status::Starting, cancel).await?;

        // From here the control database is about to become unreachable:
        // mirror log lines into the storage buffer.
        if let Some(rlog) = &self.rlog {
            rlog.set_offline();
        }

        rv.to_state(Status::Running, cancel).await?;

        if let Some(tx) = self.offline_tx.take() {
            let _ = tx.send(());
        }

        self.log_info("stopping the database and flushing old data")
            .await;
        self.flush(&rv, cancel).await?;

        // Point of no return: the data path is wiped. Any failure from here
        // must leave it wiped so the node can cold-join by initial sync.
        progress.started = true;

        self.log_info("copying backup data").await;
        let backup_rs = reverse_rs_name(&self.rs_map, &self.node_info.set_name);
        let dstat = copy::copy_files(
            self.stg.as_ref(),
            &plan,
            &backup_rs,
            &self.dbpath,
            self.tuning.download_chunk_mb,
            cancel,
        )
        .await?;
        self.write_stat(&dstat).await;

        let conf_path = self
            .tmp_conf
            .as_ref()
            .map(|f| f.path().to_path_buf())
            .ok_or_else(|| RestoreError::ConfigInvalid("boot config not prepared".to_string()))?;
        let spec = BootSpec {
            binary: self.binary.clone(),
            conf: conf_path,
            dbpath: self.dbpath.clone(),
            port: self.tmp_port,
        };
        let boots = RepairBoots {
            spec: &spec,
            connector: self.connector.as_ref(),
            cancel,
        };

        self.log_info("preparing data").await;
        boots.prepare_data(bcp.last_write_ts).await?;

        self.log_info("recovering oplog as standalone").await;
        boots.recover_standalone().await?;

        self.log_info("clean-up and reset replica-set config").await;
        let ctx = ResetContext {
            node: self.node_info.clone(),
            rs_conf: self.rs_conf.clone(),
            shards: self.shards.clone(),
            shard_map: shard_rename_mapping(&bcp, &self.shards, &self.rs_map),
            cfg_conn: self.cfg_conn.clone(),
            disable_pitr: self.node_info.is_cluster_leader(),
        };
        boots.reset_replset(&ctx).await?;

        self.log_info("restore on node succeeded").await;
        progress.done = true;

        let observed = rv.to_state(Status::Done, cancel).await?;

        self.log_info("writing restore summary").await;
        self.dump_meta(meta, observed).await?;

        Ok(())
    }

    /// Resolve tuning and binary, lay out the rendezvous namespace and start
    /// heartbeating.
    async fn init(&mut self, name: &str, opid: &str) -> Result<Arc<Rendezvous>> {
        self.tuning = match self.ctl.config().await {
            Ok(cfg) => cfg.restore,
            Err(e) => {
                tracing::warn!("read control config: {e}; using local restore tuning");
                self.fallback_tuning.clone()
            }
        };
        self.binary = self.tuning.mongod_for(&self.node_info.me);

        self.name = name.to_string();
        self.start_ts = unix_now();
        tracing::debug!("restore `{name}`, operation {opid}, port: {}", self.tmp_port);

        self.members = self.ctl.cluster_members().await?;
        self.shard_sync = self
            .members
            .iter()
            .map(|s| (s.rs.clone(), rs_sync_path(RESTORE_DIR, name, &s.rs)))
            .collect();

        if self.node_info.is_config_svr {
            self.data_shard_sync = self
                .ctl
                .shards()
                .await?
                .iter()
                .map(|s| rs_sync_path(RESTORE_DIR, name, &s.rs))
                .collect();
        }

        let rs = &self.rs_conf.id;
        let me = &self.node_info.me;
        self.stat_path = node_stat_path(RESTORE_DIR, name, rs, me);
        self.rlog = Some(Arc::new(StorageLog::new(
            self.stg.clone(),
            node_log_path(RESTORE_DIR, name, rs, me),
        )));

        let peers = self
            .rs_conf
            .members
            .iter()
            .filter(|m| !m.arbiter_only)
            .map(|m| node_sync_path(RESTORE_DIR, name, rs, &m.host))
            .collect();

        let rv = Arc::new(Rendezvous {
            stg: self.stg.clone(),
            node_path: node_sync_path(RESTORE_DIR, name, rs, me),
            rs_path: rs_sync_path(RESTORE_DIR, name, rs),
            cluster_path: cluster_sync_path(RESTORE_DIR, name),
            peers,
            shards: self.shard_sync.values().cloned().collect(),
            is_rs_leader: self.node_info.is_rs_leader(),
            is_cluster_leader: self.node_info.is_cluster_leader(),
            start_ts: self.start_ts,
            poll: self.poll,
            hb_period: self.hb_period,
        });

        if let Err(e) = rv.beat().await {
            tracing::error!("send init heartbeat: {e}");
        }
        rv.clone().spawn_heartbeat(self.hb_cancel.child_token());

        self.rendezvous = Some(rv.clone());
        Ok(rv)
    }

    /// Fetch and validate the backup, then compute the artifact plan.
    async fn prepare_backup(&mut self, cmd: &RestoreCmd) -> Result<(BackupMeta, Plan)> {
        let bcp = match self.ctl.backup_meta(&cmd.backup_name).await {
            Ok(b) => b,
            Err(ControlError::NotFound) => {
                backup_meta_from_store(self.stg.as_ref(), &cmd.backup_name).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.ctl.set_restore_backup(&self.name, &bcp.name).await?;

        if bcp.status != Status::Done {
            return Err(RestoreError::BackupIncompatible(format!(
                "backup wasn't successful: status: {}, error: {}",
                bcp.status,
                bcp.error.as_deref().unwrap_or("")
            )));
        }

        if !compatible_tool_version(&bcp.tool_version) {
            return Err(RestoreError::BackupIncompatible(format!(
                "backup tool version ({}) is not compatible with {}",
                bcp.tool_version, TOOL_VERSION
            )));
        }

        let engine = self.node.engine_version().await?;
        if majmin(&bcp.engine_version) != majmin(&engine) {
            return Err(RestoreError::EngineVersionMismatch(format!(
                "backup's engine version ({}) is not compatible with {engine}",
                bcp.engine_version
            )));
        }

        let bin_version = boot::check_binary(&self.binary, &bcp.engine_version).await?;
        tracing::debug!("database binary: {}, version: {bin_version}", self.binary);

        // every replica set the backup names must exist in this cluster
        let present: HashSet<String> = self
            .members
            .iter()
            .map(|s| reverse_rs_name(&self.rs_map, &s.rs))
            .collect();
        let unknown: Vec<&str> = bcp
            .replsets
            .iter()
            .filter(|r| !present.contains(&r.name))
            .map(|r| r.name.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(RestoreError::BackupIncompatible(format!(
                "extra/unknown replica set found in the backup: {}",
                unknown.join(",")
            )));
        }

        let backup_rs = reverse_rs_name(&self.rs_map, &self.node_info.set_name);
        let plan = match plan::build(self.ctl.as_ref(), &bcp, &backup_rs).await {
            Err(RestoreError::NoDataForShard) if self.node_info.is_cluster_leader() => {
                return Err(RestoreError::BackupIncompatible(
                    "no data for the config server or sole replica set in backup".to_string(),
                ))
            }
            other => other?,
        };

        Ok((bcp, plan))
    }

    /// Synthesize the minimal boot configuration: loopback bind, ephemeral
    /// port, this data path, preserved security options, and the storage
    /// engine options recorded in the backup.
    fn set_tmp_conf(&mut self, bcp: &BackupMeta) -> Result<()> {
        let backup_rs = reverse_rs_name(&self.rs_map, &self.node_info.set_name);
        let mut opts = MongodOpts::default();
        if let Some(stored) = bcp.replset(&backup_rs).and_then(|r| r.mongod_opts.as_ref()) {
            opts.storage = stored.storage.clone();
        }
        opts.storage.db_path = self.dbpath.to_string_lossy().to_string();
        opts.net = NetOpts {
            port: self.tmp_port,
            bind_ip: Some("localhost".to_string()),
        };
        opts.security = self.security.clone();

        self.tmp_conf = Some(boot::write_tmp_conf(&opts)?);
        Ok(())
    }

    /// Stop the local database and wipe its data path.
    ///
    /// The config-server replica set first waits for every data shard to
    /// publish `down`, fencing live shards from writing oplog that could
    /// not be reconciled. A primary waits out its step-down unless it is
    /// the only member.
    async fn flush(&self, rv: &Rendezvous, cancel: &CancellationToken) -> Result<()> {
        let rs_status = self.node.rs_status().await?;

        if self.node_info.is_config_svr && !self.data_shard_sync.is_empty() {
            self.log_debug("waiting for shards to shutdown").await;
            rv.wait_for(Status::Down, self.data_shard_sync.clone(), cancel)
                .await?;
        }

        loop {
            let inf = self.node.info().await?;
            if !inf.is_primary || rs_status.members.len() == 1 {
                match self.node.signal_shutdown().await {
                    Ok(()) => {}
                    Err(ControlError::SteppingDown) => {
                        return Err(ControlError::SteppingDown.into())
                    }
                    // shutdown tears the connection down; the lock-file
                    // drain below verifies the stop either way
                    Err(e) => self.log_warn(&format!("shutdown signal: {e}")).await,
                }
                break;
            }
            self.log_debug("waiting to become secondary").await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            }
        }

        self.log_debug("waiting for the node to shutdown").await;
        boot::wait_lock_drain(&self.dbpath, cancel).await?;

        if self.node_info.is_primary {
            rv.write_status(&rv.rs_path, Status::Down).await?;
        }

        self.log_debug("removing old data").await;
        wipe_dbpath(&self.dbpath).await
    }

    /// Best-effort download statistics for the node's `stat.<host>` object.
    async fn write_stat(&self, stat: &copy::DownloadStat) {
        let body = json!({ "d": stat });
        let data = match serde_json::to_vec(&body) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("encode download stat: {e}");
                return;
            }
        };
        if let Err(e) = save_bytes(self.stg.as_ref(), &self.stat_path, data).await {
            self.log_warn(&format!("write download stat: {e}")).await;
        }
    }

    /// Human-readable summary at `<root>/<restore-name>.json`, probed from
    /// the rendezvous namespace. Best effort: agents may still be reporting;
    /// a resync over the namespace rebuilds the authoritative state.
    async fn dump_meta(&self, meta: &RestoreMeta, observed: Status) -> Result<()> {
        let obj = format!("{RESTORE_DIR}/{}.json", self.name);
        if exists(self.stg.as_ref(), &obj).await? {
            self.log_warn(&format!(
                "restore summary `{obj}` already exists, skipping write of {observed}"
            ))
            .await;
            return Ok(());
        }

        let now = unix_now();
        let mut out = meta.clone();
        out.status = observed;
        out.last_transition_ts = now;
        out.conditions.push(Condition {
            timestamp: now,
            status: observed,
            error: None,
        });

        let mut replsets = Vec::new();
        let mut names: Vec<&String> = self.shard_sync.keys().collect();
        names.sort();
        for rs in names {
            replsets.push(self.probe_rs_status(rs).await);
        }
        out.replsets = replsets;

        save_bytes(self.stg.as_ref(), &obj, serde_json::to_vec_pretty(&out)?).await?;
        Ok(())
    }

    /// Latest observable status of one replica set.
    async fn probe_rs_status(&self, rs: &str) -> RestoreReplset {
        let path = rs_sync_path(RESTORE_DIR, &self.name, rs);
        let probe_order = [
            Status::Done,
            Status::PartlyDone,
            Status::Error,
            Status::Down,
            Status::Running,
            Status::Starting,
        ];

        for st in probe_order {
            let obj = format!("{path}.{st}");
            if let Ok(true) = exists(self.stg.as_ref(), &obj).await {
                let (ts, err) = match crate::storage::read_to_string(self.stg.as_ref(), &obj).await
                {
                    Ok(body) => {
                        let (ts, msg) = crate::storage::parse_body(&body);
                        (ts, msg.map(|m| m.to_string()))
                    }
                    Err(_) => (0, None),
                };
                return RestoreReplset {
                    name: rs.to_string(),
                    status: st,
                    last_transition_ts: ts,
                    error: err,
                };
            }
        }

        RestoreReplset {
            name: rs.to_string(),
            status: Status::Init,
            last_transition_ts: 0,
            error: None,
        }
    }

    /// Publish `error` for this node and, before the point of no return,
    /// for the scopes this node leads.
    async fn mark_failed(&self, err: &RestoreError, mark_cluster: bool) {
        let Some(rv) = &self.rendezvous else {
            return;
        };

        if let Err(e) = rv.write_error(&rv.node_path, &err.to_string()).await {
            tracing::error!("write error state `{err}` to storage: {e}");
        }

        if self.node_info.is_primary && mark_cluster {
            if let Err(e) = rv.write_error(&rv.rs_path, &err.to_string()).await {
                tracing::error!("write replset error state `{err}`: {e}");
            }
        }
        if self.node_info.is_cluster_leader() && mark_cluster {
            if let Err(e) = rv.write_error(&rv.cluster_path, &err.to_string()).await {
                tracing::error!("write cluster error state `{err}`: {e}");
            }
        }
    }

    /// Failure bookkeeping and resource cleanup, any outcome.
    async fn finish(&mut self, res: Result<()>, progress: Progress) -> Result<()> {
        if let Err(e) = &res {
            if !progress.done && !e.is_no_data_for_shard() {
                self.mark_failed(e, !progress.started).await;
            }
        }

        self.hb_cancel.cancel();

        // temp boot config is removed on drop
        self.tmp_conf = None;

        if res.is_ok() {
            let _ = tokio::fs::remove_file(self.dbpath.join(BOOT_LOG_FILE)).await;
        } else if progress.started && !progress.done {
            if let Err(e) = wipe_dbpath(&self.dbpath).await {
                tracing::error!("clean up data path {}: {e}", self.dbpath.display());
            }
        }

        if let Some(rlog) = &self.rlog {
            rlog.flush().await;
        }

        res
    }

    async fn log_info(&self, msg: &str) {
        match &self.rlog {
            Some(l) => l.info(msg).await,
            None => tracing::info!("{msg}"),
        }
    }

    async fn log_debug(&self, msg: &str) {
        match &self.rlog {
            Some(l) => l.debug(msg).await,
            None => tracing::debug!("{msg}"),
        }
    }

    async fn log_warn(&self, msg: &str) {
        match &self.rlog {
            Some(l) => l.warn(msg).await,
            None => tracing::warn!("{msg}"),
        }
    }
}

/// Delete everything under the data path except the supervised-boot log.
async fn wipe_dbpath(dbpath: &Path) -> Result<()> {
    let mut rd = tokio::fs::read_dir(dbpath).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_name().to_string_lossy() == BOOT_LOG_FILE {
            continue;
        }
        let p = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&p).await?;
        } else {
            tokio::fs::remove_file(&p).await?;
        }
        tracing::debug!("removed {}", p.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{
        BackupFile, Compression, OpTime, ReplsetMeta, RsMember, StorageOpts,
    };
    use crate::testutil::{
        fake_mongod, FakeConnector, FakeControl, FakeNode, MemStore, RepairOp, RepairState,
    };
    use tempfile::TempDir;

    struct Cluster {
        dir: TempDir,
        dbpath: PathBuf,
        stg: Arc<MemStore>,
        ctl: Arc<FakeControl>,
        state: Arc<RepairState>,
    }

    fn one_rs_cluster() -> Cluster {
        let dir = TempDir::new().unwrap();
        let dbpath = dir.path().join("db");
        std::fs::create_dir(&dbpath).unwrap();
        std::fs::write(dbpath.join("mongod.lock"), b"").unwrap();
        std::fs::write(dbpath.join("stale.wt"), b"old bytes").unwrap();

        let binary = fake_mongod(dir.path(), "7.0.0");

        let mut ctl = FakeControl::new(
            vec![Shard {
                id: "rs0".to_string(),
                rs: "rs0".to_string(),
                host: "rs0/n1:27017".to_string(),
            }],
            vec![],
        );
        ctl.cfg.restore.mongod_location = Some(binary.to_string_lossy().to_string());

        Cluster {
            dir,
            dbpath,
            stg: Arc::new(MemStore::new()),
            ctl: Arc::new(ctl),
            state: Arc::new(RepairState::default()),
        }
    }

    fn node_info(me: &str, primary: bool) -> NodeInfo {
        NodeInfo {
            me: me.to_string(),
            set_name: "rs0".to_string(),
            is_primary: primary,
            is_config_svr: false,
            is_sharded: false,
        }
    }

    fn rs_conf(hosts: &[&str]) -> RsConfig {
        RsConfig {
            id: "rs0".to_string(),
            version: 3,
            members: hosts
                .iter()
                .enumerate()
                .map(|(i, h)| RsMember {
                    id: i as i32,
                    host: h.to_string(),
                    arbiter_only: false,
                    priority: None,
                })
                .collect(),
            configsvr: false,
            settings: None,
        }
    }

    fn backup(cluster: &Cluster, status: Status) -> BackupMeta {
        cluster.stg.put("bcp1/rs0/collection-0.wt", b"data pages".to_vec());
        BackupMeta {
            name: "bcp1".to_string(),
            kind: BackupKind::Physical,
            compression: Compression::None,
            src_backup: None,
            shard_remap: HashMap::new(),
            replsets: vec![ReplsetMeta {
                name: "rs0".to_string(),
                files: vec![BackupFile {
                    name: "collection-0.wt".to_string(),
                    offset: 0,
                    length: 0,
                    size: 0,
                    fmode: 0o600,
                }],
                journal: vec![],
                last_write_ts: OpTime::new(100, 1),
                mongod_opts: Some(MongodOpts {
                    storage: StorageOpts {
                        db_path: "/was/recorded/elsewhere".to_string(),
                        directory_per_db: None,
                    },
                    ..Default::default()
                }),
                is_config_svr: None,
            }],
            last_write_ts: OpTime::new(100, 1),
            engine_version: "7.0.0".to_string(),
            tool_version: TOOL_VERSION.to_string(),
            status,
            start_ts: 1,
            error: None,
        }
    }

    async fn restore(
        cluster: &Cluster,
        node: FakeNode,
    ) -> PhysicalRestore {
        let mut r = PhysicalRestore::new(
            cluster.ctl.clone(),
            Arc::new(node),
            cluster.stg.clone(),
            Arc::new(FakeConnector::new(cluster.state.clone())),
            HashMap::new(),
            RestoreTuning::default(),
        )
        .await
        .unwrap();
        r.poll = Duration::from_millis(10);
        r
    }

    fn cmd(name: &str) -> RestoreCmd {
        RestoreCmd {
            name: name.to_string(),
            backup_name: "bcp1".to_string(),
            rs_remap: HashMap::new(),
        }
    }

    fn opts_for(dbpath: &Path) -> MongodOpts {
        MongodOpts {
            storage: StorageOpts {
                db_path: dbpath.to_string_lossy().to_string(),
                directory_per_db: None,
            },
            net: NetOpts {
                port: 27017,
                bind_ip: None,
            },
            security: None,
        }
    }

    // Single-node replica set, clean restore end to end: all rendezvous
    // objects land, data is replaced, repair ops run, summary is written.
    #[tokio::test]
    async fn test_snapshot_single_node_clean() {
        let cluster = one_rs_cluster();
        cluster.ctl.add_backup(backup(&cluster, Status::Done));

        let node = FakeNode::new(
            node_info("n1:27017", true),
            rs_conf(&["n1:27017"]),
            opts_for(&cluster.dbpath),
        );
        let r = restore(&cluster, node).await;

        r.snapshot(&cmd("r1"), "op1", CancellationToken::new())
            .await
            .unwrap();

        let names = cluster.stg.names();
        for obj in [
            ".restore/r1/rs.rs0/node.n1:27017.starting",
            ".restore/r1/rs.rs0/node.n1:27017.running",
            ".restore/r1/rs.rs0/node.n1:27017.done",
            ".restore/r1/rs.rs0/rs.down",
            ".restore/r1/rs.rs0/rs.done",
            ".restore/r1/cluster.done",
            ".restore/r1/rs.rs0/stat.n1:27017",
        ] {
            assert!(names.contains(&obj.to_string()), "missing {obj}: {names:?}");
        }

        // local data replaced
        assert!(!cluster.dbpath.join("stale.wt").exists());
        assert_eq!(
            std::fs::read(cluster.dbpath.join("collection-0.wt")).unwrap(),
            b"data pages"
        );

        // repair boots ran: oplog cut picked, replset config reinstated,
        // slicing disabled by the cluster leader
        let ops = cluster.state.ops();
        assert!(ops.iter().any(|op| matches!(op, RepairOp::Insert { coll, doc, .. }
            if coll == "replset.oplogTruncateAfterPoint"
                && doc["oplogTruncateAfterPoint"]["t"] == json!(100))));
        assert!(ops.iter().any(|op| matches!(op, RepairOp::Insert { coll, doc, .. }
            if coll == "system.replset" && doc["version"] == json!(1))));
        assert!(ops.iter().any(|op| matches!(op, RepairOp::UpdateMany { coll, update, .. }
            if coll == crate::control::CONFIG_COLL
                && update["$set"]["pitr.enabled"] == json!(false))));

        // leader wrote the summary and created the restore descriptor
        let summary = cluster.stg.get(".restore/r1.json").expect("summary");
        let summary: RestoreMeta = serde_json::from_slice(&summary).unwrap();
        assert_eq!(summary.status, Status::Done);
        assert_eq!(summary.replsets.len(), 1);
        assert_eq!(summary.replsets[0].status, Status::Done);
        assert_eq!(cluster.ctl.restores.lock().unwrap().len(), 1);
    }

    // Cancellation while waiting for a peer at `starting`: the node writes
    // `error` and its data directory is left intact.
    #[tokio::test]
    async fn test_cancel_before_point_of_no_return() {
        let cluster = one_rs_cluster();
        cluster.ctl.add_backup(backup(&cluster, Status::Done));

        let node = FakeNode::new(
            node_info("n1:27017", true),
            rs_conf(&["n1:27017", "n2:27017"]),
            opts_for(&cluster.dbpath),
        );
        let r = restore(&cluster, node).await;

        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            c.cancel();
        });

        let err = r.snapshot(&cmd("r2"), "op2", cancel).await.unwrap_err();
        assert!(matches!(err, RestoreError::Cancelled), "got {err}");

        assert!(cluster
            .stg
            .get(".restore/r2/rs.rs0/node.n1:27017.error")
            .is_some());
        assert!(cluster.dbpath.join("stale.wt").exists());
        assert!(cluster.dbpath.join("mongod.lock").exists());
    }

    // An unrestorable backup aborts before the flush: no state transitions
    // beyond init, data intact, `backup-incompatible` surfaced.
    #[tokio::test]
    async fn test_incompatible_backup_aborts_before_flush() {
        let cluster = one_rs_cluster();
        cluster.ctl.add_backup(backup(&cluster, Status::Error));

        let node = FakeNode::new(
            node_info("n1:27017", true),
            rs_conf(&["n1:27017"]),
            opts_for(&cluster.dbpath),
        );
        let r = restore(&cluster, node).await;

        let err = r
            .snapshot(&cmd("r3"), "op3", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::BackupIncompatible(_)), "got {err}");

        let names = cluster.stg.names();
        assert!(!names.iter().any(|n| n.ends_with(".starting")));
        assert!(cluster.dbpath.join("stale.wt").exists());
    }

    // A replica set absent from the backup is not an error on a non-leader:
    // no `error` object is published, the caller sees `no-data-for-shard`.
    #[tokio::test]
    async fn test_no_data_for_shard_is_soft() {
        let mut cluster = one_rs_cluster();
        // two-shard cluster; the backup only covers rs1
        let members = vec![
            Shard {
                id: "rs0".to_string(),
                rs: "rs0".to_string(),
                host: "rs0/n1:27017".to_string(),
            },
            Shard {
                id: "rs1".to_string(),
                rs: "rs1".to_string(),
                host: "rs1/m1:27017".to_string(),
            },
        ];
        let mut ctl = FakeControl::new(members.clone(), members);
        ctl.cfg.restore.mongod_location =
            cluster.ctl.cfg.restore.mongod_location.clone();
        cluster.ctl = Arc::new(ctl);

        let mut bcp = backup(&cluster, Status::Done);
        bcp.replsets[0].name = "rs1".to_string();
        cluster.ctl.add_backup(bcp);

        // a sharded secondary: neither rs leader nor cluster leader
        let mut info = node_info("n1:27017", false);
        info.is_sharded = true;
        let node = FakeNode::new(info, rs_conf(&["n1:27017"]), opts_for(&cluster.dbpath));
        let r = restore(&cluster, node).await;

        let err = r
            .snapshot(&cmd("r4"), "op4", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_no_data_for_shard(), "got {err}");

        assert!(!cluster
            .stg
            .names()
            .iter()
            .any(|n| n.contains(".error")));
        assert!(cluster.dbpath.join("stale.wt").exists());
    }

    // Version gate: a backup from another engine line never gets to touch
    // the node.
    #[tokio::test]
    async fn test_engine_version_mismatch() {
        let cluster = one_rs_cluster();
        let mut bcp = backup(&cluster, Status::Done);
        bcp.engine_version = "6.0.14".to_string();
        cluster.ctl.add_backup(bcp);

        let node = FakeNode::new(
            node_info("n1:27017", true),
            rs_conf(&["n1:27017"]),
            opts_for(&cluster.dbpath),
        );
        let r = restore(&cluster, node).await;

        let err = r
            .snapshot(&cmd("r5"), "op5", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::EngineVersionMismatch(_)), "got {err}");
        assert!(cluster.dbpath.join("stale.wt").exists());
    }

    // Two data-bearing members restore in parallel against the same
    // storage; the replica set converges to `done` and both data paths hold
    // the restored bytes.
    #[tokio::test]
    async fn test_two_member_replica_set_converges() {
        let cluster = one_rs_cluster();
        cluster.ctl.add_backup(backup(&cluster, Status::Done));

        let db2 = cluster.dir.path().join("db2");
        std::fs::create_dir(&db2).unwrap();
        std::fs::write(db2.join("mongod.lock"), b"").unwrap();

        let conf = rs_conf(&["n1:27017", "n2:27017"]);

        let mut primary = FakeNode::new(
            node_info("n1:27017", true),
            conf.clone(),
            opts_for(&cluster.dbpath),
        );
        // steps down once its peer is mid-restore
        primary.demote_after = Some(2);

        let secondary = FakeNode::new(
            node_info("n2:27017", false),
            conf,
            opts_for(&db2),
        );

        let r1 = restore(&cluster, primary).await;
        let r2 = restore(&cluster, secondary).await;

        let c1 = CancellationToken::new();
        let c2 = CancellationToken::new();
        let cmd_r6_a = cmd("r6");
        let cmd_r6_b = cmd("r6");
        let (a, b) = tokio::join!(
            r1.snapshot(&cmd_r6_a, "op6", c1),
            r2.snapshot(&cmd_r6_b, "op6", c2),
        );
        a.unwrap();
        b.unwrap();

        let names = cluster.stg.names();
        assert!(names.contains(&".restore/r6/rs.rs0/node.n1:27017.done".to_string()));
        assert!(names.contains(&".restore/r6/rs.rs0/node.n2:27017.done".to_string()));
        assert!(names.contains(&".restore/r6/cluster.done".to_string()));

        assert_eq!(
            std::fs::read(cluster.dbpath.join("collection-0.wt")).unwrap(),
            b"data pages"
        );
        assert_eq!(std::fs::read(db2.join("collection-0.wt")).unwrap(), b"data pages");
    }
}
