//! The three repair boots that turn copied backup files back into a working
//! replica-set member, and the sharding-metadata reconciliation run on the
//! config-server leader.
//!
//! Boot order matters: the engine honors the oplog truncate-after point
//! only once a single-writer checkpoint exists (boot 1 establishes it),
//! boot 2 replays the journal up to that point so all members end up
//! bit-identical, and boot 3 reinstates replica-set identity under a config
//! version the surviving members accept on restart.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::control::{RepairConnector, RepairSession, ADMIN_DB, CONFIG_COLL};
use crate::meta::{reverse_rs_name, BackupMeta, NodeInfo, OpTime, RsConfig};
use crate::restore::boot::{self, BootSpec};
use crate::utils::errors::Result;

const SESSIONS_DROP_RETRIES: usize = 5;

/// Pre-shutdown cluster snapshot boot 3 needs to rewire metadata.
pub struct ResetContext {
    pub node: NodeInfo,
    /// Original replica-set config, reinserted with `version = 1`.
    pub rs_conf: RsConfig,
    /// Target shard name -> host URI, captured before shutdown.
    pub shards: HashMap<String, String>,
    /// Source shard name -> target shard name rename mapping.
    pub shard_map: HashMap<String, String>,
    /// Config-server connection string for the shard identity document.
    pub cfg_conn: String,
    /// Cluster leader only: turn off incremental log slicing.
    pub disable_pitr: bool,
}

pub struct RepairBoots<'a> {
    pub spec: &'a BootSpec,
    pub connector: &'a dyn RepairConnector,
    pub cancel: &'a CancellationToken,
}

impl RepairBoots<'_> {
    async fn boot(&self, set_params: &[&str]) -> Result<Box<dyn RepairSession>> {
        self.spec.start(set_params).await?;
        self.spec.connect(self.connector, self.cancel).await
    }

    /// Boot 1: reset replication bookkeeping and pick the oplog cut.
    pub async fn prepare_data(&self, last_write: OpTime) -> Result<()> {
        let sess = self.boot(&["disableLogicalSessionCacheRefresh=true"]).await?;

        sess.drop_collection("local", "replset.minvalid").await?;
        sess.drop_collection("local", "replset.oplogTruncateAfterPoint")
            .await?;
        sess.drop_collection("local", "replset.election").await?;
        sess.delete_many("local", "system.replset", json!({})).await?;

        sess.insert_one(
            "local",
            "replset.minvalid",
            json!({"t": -1, "ts": {"t": 0, "i": 1}}),
        )
        .await?;

        tracing::debug!("oplog truncate-after point: {last_write}");
        sess.insert_one(
            "local",
            "replset.oplogTruncateAfterPoint",
            json!({
                "_id": "oplogTruncateAfterPoint",
                "oplogTruncateAfterPoint": {"t": last_write.ts, "i": last_write.inc},
            }),
        )
        .await?;

        boot::shutdown(sess, &self.spec.dbpath, self.cancel).await
    }

    /// Boot 2: replay the journal up to the truncate-after point and write a
    /// fresh checkpoint. All the work happens inside the engine.
    pub async fn recover_standalone(&self) -> Result<()> {
        let sess = self
            .boot(&[
                "recoverFromOplogAsStandalone=true",
                "takeUnstableCheckpointOnShutdown=true",
            ])
            .await?;

        boot::shutdown(sess, &self.spec.dbpath, self.cancel).await
    }

    /// Boot 3: clean caches, rewire sharding metadata and reinstate the
    /// replica-set config.
    pub async fn reset_replset(&self, ctx: &ResetContext) -> Result<()> {
        let sess = self
            .boot(&[
                "disableLogicalSessionCacheRefresh=true",
                "skipShardingConfigurationChecks=true",
            ])
            .await?;

        if ctx.node.is_config_svr {
            self.reconcile_sharding(sess.as_ref(), ctx).await?;
        } else if !ctx.shards.is_empty() {
            // point this shard's identity at the restored topology
            let shard_name = ctx
                .shards
                .iter()
                .find(|(_, uri)| uri.split('/').next() == Some(ctx.node.set_name.as_str()))
                .map(|(s, _)| s.clone())
                .unwrap_or_default();

            sess.update_many(
                ADMIN_DB,
                "system.version",
                json!({"_id": "shardIdentity"}),
                json!({"$set": {
                    "shardName": shard_name,
                    "configsvrConnectionString": ctx.cfg_conn,
                }}),
            )
            .await?;
        }

        for coll in sess.list_collections("config", "cache.").await? {
            sess.drop_collection("config", &coll).await?;
        }

        drop_sessions_collection(sess.as_ref()).await?;

        sess.delete_many("local", "system.replset", json!({})).await?;
        let mut conf = ctx.rs_conf.clone();
        conf.version = 1;
        conf.configsvr = ctx.node.is_config_svr;
        sess.insert_one("local", "system.replset", serde_json::to_value(&conf)?)
            .await?;

        // Slicing must not resume over a cluster sitting at the backup's
        // recovery time: it would overwrite chunks made after the backup.
        if ctx.disable_pitr {
            sess.update_many(
                ADMIN_DB,
                CONFIG_COLL,
                json!({}),
                json!({"$set": {"pitr.enabled": false}}),
            )
            .await?;
        }

        boot::shutdown(sess, &self.spec.dbpath, self.cancel).await
    }

    /// Config-server leader: rebuild the shard map and router tables.
    async fn reconcile_sharding(
        &self,
        sess: &dyn RepairSession,
        ctx: &ResetContext,
    ) -> Result<()> {
        sess.drop_collection("config", "mongos").await?;
        sess.drop_collection("config", "lockpings").await?;

        let docs = sess.find("config", "shards", json!({})).await?;
        let mut rewritten = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if let Value::Object(map) = &mut doc {
                let id = map
                    .get("_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let target = ctx.shard_map.get(&id).cloned().unwrap_or(id);
                if let Some(host) = ctx.shards.get(&target) {
                    map.insert("host".to_string(), json!(host));
                }
                map.insert("_id".to_string(), json!(target));
            }
            rewritten.push(doc);
        }
        sess.replace_all("config", "shards", rewritten).await?;

        if !ctx.shard_map.is_empty() {
            tracing::debug!("updating router config");
            update_router_tables(sess, &ctx.shard_map).await?;
        }

        Ok(())
    }
}

/// Rewrite chunk-owner records after a shard rename.
async fn update_router_tables(
    sess: &dyn RepairSession,
    mapping: &HashMap<String, String>,
) -> Result<()> {
    for (from, to) in mapping {
        sess.update_many(
            "config",
            "databases",
            json!({"primary": from}),
            json!({"$set": {"primary": to}}),
        )
        .await?;
        sess.update_many(
            "config",
            "chunks",
            json!({"shard": from}),
            json!({"$set": {"shard": to}}),
        )
        .await?;
    }
    Ok(())
}

/// The sessions collection may be mid-compaction; retry its drop with a
/// linear backoff.
async fn drop_sessions_collection(sess: &dyn RepairSession) -> Result<()> {
    for i in 0..SESSIONS_DROP_RETRIES {
        match sess.drop_collection("config", "system.sessions").await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_background_op() && i + 1 < SESSIONS_DROP_RETRIES => {
                tracing::debug!("drop config.system.sessions: {e}, retrying");
                tokio::time::sleep(Duration::from_secs(i as u64 + 1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Shard rename mapping: join the backup's shard-remap table against the
/// shard list discovered before shutdown. Only shards whose name actually
/// changed end up in the mapping.
pub fn shard_rename_mapping(
    bcp: &BackupMeta,
    shards: &HashMap<String, String>,
    rs_map: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut source = HashMap::new();
    for rs in &bcp.replsets {
        if let Some(s) = bcp.shard_remap.get(&rs.name) {
            source.insert(rs.name.clone(), s.clone());
        }
    }

    let mut mapping = HashMap::new();
    for (target_shard, uri) in shards {
        let target_rs = uri.split('/').next().unwrap_or(uri);
        let source_rs = reverse_rs_name(rs_map, target_rs);
        if let Some(source_shard) = source.get(&source_rs) {
            if source_shard != target_shard {
                mapping.insert(source_shard.clone(), target_shard.clone());
            }
        }
    }

    mapping
}
