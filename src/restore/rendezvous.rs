//! Cluster-wide state machine over shared storage.
//!
//! While the database fleet is down there is no channel between nodes;
//! object creation on the shared store is the only event primitive. Every
//! scope (node, replica set, cluster) owns a path prefix, and a status is
//! reported by creating `<prefix>.<status>`. Statuses are never retracted.
//!
//! Status `done` is special: if at least one node of a replica set reached
//! `done` the set can still converge to `partly-done`, and the cluster is
//! `partly-done` if at least one set is. For any other status a peer error
//! is fatal to the waiter.
//!
//! Layout under `<root>/<restore-name>/`:
//!
//! ```text
//! cluster.<status>  cluster.hb
//! rs.<rs-id>/rs.<status>  rs.<rs-id>/rs.hb
//! rs.<rs-id>/node.<host>.<status>  rs.<rs-id>/node.<host>.hb
//! rs.<rs-id>/stat.<host>  rs.<rs-id>/log/<host>.<n>.log
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::meta::Status;
use crate::storage::{
    err_body, exists, ok_body, parse_body, read_to_string, save_bytes, ObjectStore, StorageError,
};
use crate::utils::errors::{RestoreError, Result};
use crate::utils::unix_now;

/// Heartbeat refresh period. A peer is declared stuck once its latest beat
/// is older than twice this.
pub const HB_PERIOD: Duration = Duration::from_secs(120);

/// Poll tick of every waiter.
pub const POLL_PERIOD: Duration = Duration::from_secs(5);

const HB_SUFFIX: &str = "hb";

pub fn node_sync_path(root: &str, name: &str, rs: &str, node: &str) -> String {
    format!("{root}/{name}/rs.{rs}/node.{node}")
}

pub fn node_stat_path(root: &str, name: &str, rs: &str, node: &str) -> String {
    format!("{root}/{name}/rs.{rs}/stat.{node}")
}

pub fn node_log_path(root: &str, name: &str, rs: &str, node: &str) -> String {
    format!("{root}/{name}/rs.{rs}/log/{node}")
}

pub fn rs_sync_path(root: &str, name: &str, rs: &str) -> String {
    format!("{root}/{name}/rs.{rs}/rs")
}

pub fn cluster_sync_path(root: &str, name: &str) -> String {
    format!("{root}/{name}/cluster")
}

/// Drives this node through the shared state machine.
pub struct Rendezvous {
    pub stg: Arc<dyn ObjectStore>,
    pub node_path: String,
    pub rs_path: String,
    pub cluster_path: String,
    /// Node-scoped prefixes of all data-bearing members of this replica set.
    pub peers: HashSet<String>,
    /// Rs-scoped prefixes of every replica set participating in the restore.
    pub shards: HashSet<String>,
    pub is_rs_leader: bool,
    pub is_cluster_leader: bool,
    /// Restore start, the staleness reference until first heartbeats land.
    pub start_ts: i64,
    pub poll: Duration,
    pub hb_period: Duration,
}

impl Rendezvous {
    /// Advance this node to `target` and wait for the cluster to follow.
    /// Returns the observed cluster status, which may be `partly-done` when
    /// `target` is `done`.
    pub async fn to_state(&self, target: Status, cancel: &CancellationToken) -> Result<Status> {
        let res = self.advance(target, cancel).await;

        // A failed leader must not leave its scope silent: peers would poll
        // until their heartbeat staleness cutoff instead of failing fast.
        if let Err(e) = &res {
            if target != Status::Done {
                if self.is_rs_leader {
                    let _ = self.write_error(&self.rs_path, &e.to_string()).await;
                }
                if self.is_cluster_leader {
                    let _ = self.write_error(&self.cluster_path, &e.to_string()).await;
                }
            }
        }

        res
    }

    async fn advance(&self, target: Status, cancel: &CancellationToken) -> Result<Status> {
        tracing::info!("moving to state {target}");
        self.write_status(&self.node_path, target).await?;

        if self.is_rs_leader || target == Status::Done {
            tracing::info!("waiting for `{target}` in rs nodes {:?}", self.peers);
            let st = self
                .wait_objects(target, self.peers.clone(), false, cancel)
                .await?;
            self.write_status(&self.rs_path, st).await?;
        }

        if self.is_cluster_leader || target == Status::Done {
            tracing::info!("waiting for `{target}` in replica sets {:?}", self.shards);
            let st = self
                .wait_objects(target, self.shards.clone(), true, cancel)
                .await?;
            self.write_status(&self.cluster_path, st).await?;
        }

        tracing::info!("waiting for cluster");
        let observed = self
            .wait_objects(
                target,
                HashSet::from([self.cluster_path.clone()]),
                true,
                cancel,
            )
            .await?;

        tracing::debug!("converged to state {observed}");
        Ok(observed)
    }

    /// Wait for a specific status on an explicit set of prefixes, outside
    /// the regular node -> rs -> cluster advancement. Used by the
    /// config-server replica set to hold its own shutdown until every data
    /// shard has published `down`.
    pub async fn wait_for(
        &self,
        target: Status,
        objs: HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Status> {
        self.wait_objects(target, objs, false, cancel).await
    }

    /// Wait for every prefix in `objs` to reach `target`.
    ///
    /// Per awaited prefix and poll tick: surface the `.error` sibling
    /// (fatal unless waiting for `done`); accept the `.<target>` object
    /// (and `.partly-done` when waiting for `done`); otherwise require a
    /// fresh heartbeat. The set shrinks as peers settle; `cluster` selects
    /// the demotion rule for mixed outcomes.
    async fn wait_objects(
        &self,
        target: Status,
        mut objs: HashSet<String>,
        cluster: bool,
        cancel: &CancellationToken,
    ) -> Result<Status> {
        if objs.is_empty() {
            return Err(RestoreError::ConfigInvalid(
                "empty rendezvous wait set".to_string(),
            ));
        }

        let mut tick = tokio::time::interval(self.poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut ret = target;
        let mut peer_err: Option<RestoreError> = None;
        let mut have_done = false;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            }

            for f in objs.clone() {
                let errfile = format!("{f}.{}", Status::Error);
                if exists(self.stg.as_ref(), &errfile).await? {
                    let body = read_to_string(self.stg.as_ref(), &errfile).await?;
                    let (_, msg) = parse_body(&body);
                    let e = RestoreError::PeerFailed {
                        node: basename(&f),
                        msg: msg.unwrap_or(&body).to_string(),
                    };
                    if target != Status::Done {
                        return Err(e);
                    }
                    peer_err = Some(e);
                    objs.remove(&f);
                    continue;
                }

                // A settled peer is accepted before its heartbeat is
                // consulted: a node that finished and stopped beating must
                // not demote the result.
                if exists(self.stg.as_ref(), &format!("{f}.{target}")).await? {
                    have_done = true;
                    objs.remove(&f);
                    continue;
                }
                if target == Status::Done
                    && exists(self.stg.as_ref(), &format!("{f}.{}", Status::PartlyDone)).await?
                {
                    ret = Status::PartlyDone;
                    have_done = true;
                    objs.remove(&f);
                    continue;
                }

                if let Err(e) = self.check_hb(&format!("{f}.{HB_SUFFIX}")).await {
                    if target != Status::Done {
                        return Err(e);
                    }
                    peer_err = Some(e);
                    objs.remove(&f);
                    continue;
                }
            }

            if objs.is_empty() {
                return match peer_err {
                    None => Ok(ret),
                    Some(_) if have_done && !cluster => Ok(Status::PartlyDone),
                    Some(e) => Err(e),
                };
            }
        }
    }

    /// Freshness check of one heartbeat object. Waits out two heartbeat
    /// frames past the restore start for objects not yet created.
    async fn check_hb(&self, file: &str) -> Result<()> {
        let now = unix_now();
        let frame = self.hb_period.as_secs() as i64;

        match self.stg.file_stat(file).await {
            Err(StorageError::NotExist) | Err(StorageError::Empty) => {
                if self.start_ts + frame * 2 < now {
                    return Err(RestoreError::PeerStuck(self.start_ts));
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let body = read_to_string(self.stg.as_ref(), file).await?;
        let ts: i64 = body.trim().parse().map_err(|_| {
            RestoreError::Storage(StorageError::Backend(format!(
                "decode heartbeat object {file}"
            )))
        })?;

        if ts + frame * 2 < now {
            return Err(RestoreError::PeerStuck(ts));
        }

        Ok(())
    }

    pub async fn write_status(&self, prefix: &str, status: Status) -> Result<()> {
        save_bytes(
            self.stg.as_ref(),
            &format!("{prefix}.{status}"),
            ok_body().into_bytes(),
        )
        .await?;
        Ok(())
    }

    pub async fn write_error(&self, prefix: &str, msg: &str) -> Result<()> {
        save_bytes(
            self.stg.as_ref(),
            &format!("{prefix}.{}", Status::Error),
            err_body(msg).into_bytes(),
        )
        .await?;
        Ok(())
    }

    /// Refresh the node, replica-set and cluster heartbeat objects.
    pub async fn beat(&self) -> Result<()> {
        let ts = unix_now().to_string();
        for p in [&self.node_path, &self.rs_path, &self.cluster_path] {
            save_bytes(
                self.stg.as_ref(),
                &format!("{p}.{HB_SUFFIX}"),
                ts.clone().into_bytes(),
            )
            .await?;
        }
        Ok(())
    }

    /// Periodic heartbeat task for the duration of the restore. Stops when
    /// `cancel` fires.
    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let rv = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(rv.hb_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = rv.beat().await {
                            tracing::warn!("send heartbeat: {e}");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("heartbeats stopped");
                        return;
                    }
                }
            }
        })
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::save_bytes;
    use crate::testutil::MemStore;

    const ROOT: &str = ".restore";

    fn rendezvous(
        stg: Arc<MemStore>,
        me: &str,
        peers: &[&str],
        rs_leader: bool,
        cluster_leader: bool,
    ) -> Rendezvous {
        Rendezvous {
            stg,
            node_path: node_sync_path(ROOT, "r1", "rs0", me),
            rs_path: rs_sync_path(ROOT, "r1", "rs0"),
            cluster_path: cluster_sync_path(ROOT, "r1"),
            peers: peers
                .iter()
                .map(|p| node_sync_path(ROOT, "r1", "rs0", p))
                .collect(),
            shards: HashSet::from([rs_sync_path(ROOT, "r1", "rs0")]),
            is_rs_leader: rs_leader,
            is_cluster_leader: cluster_leader,
            start_ts: unix_now(),
            poll: Duration::from_millis(10),
            hb_period: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_single_node_advances_all_scopes() {
        let stg = Arc::new(MemStore::new());
        let rv = rendezvous(stg.clone(), "n1:27017", &["n1:27017"], true, true);
        let cancel = CancellationToken::new();

        let got = rv.to_state(Status::Starting, &cancel).await.unwrap();
        assert_eq!(got, Status::Starting);

        let names = stg.names();
        assert!(names.contains(&format!("{ROOT}/r1/rs.rs0/node.n1:27017.starting")));
        assert!(names.contains(&format!("{ROOT}/r1/rs.rs0/rs.starting")));
        assert!(names.contains(&format!("{ROOT}/r1/cluster.starting")));
    }

    #[tokio::test]
    async fn test_to_state_is_idempotent() {
        let stg = Arc::new(MemStore::new());
        let rv = rendezvous(stg.clone(), "n1:27017", &["n1:27017"], true, true);
        let cancel = CancellationToken::new();

        assert_eq!(
            rv.to_state(Status::Running, &cancel).await.unwrap(),
            Status::Running
        );
        let first = stg.names();

        assert_eq!(
            rv.to_state(Status::Running, &cancel).await.unwrap(),
            Status::Running
        );
        assert_eq!(stg.names(), first);
    }

    #[tokio::test]
    async fn test_follower_waits_for_peer_then_leader_writes_rs() {
        let stg = Arc::new(MemStore::new());
        let rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            true,
            true,
        );
        let cancel = CancellationToken::new();

        // peer settles shortly after we start waiting
        let peer_stg = stg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            save_bytes(
                &*peer_stg,
                &format!("{ROOT}/r1/rs.rs0/node.n2:27017.running"),
                ok_body().into_bytes(),
            )
            .await
            .unwrap();
        });

        let got = rv.to_state(Status::Running, &cancel).await.unwrap();
        assert_eq!(got, Status::Running);
    }

    #[tokio::test]
    async fn test_peer_error_fatal_before_done() {
        let stg = Arc::new(MemStore::new());
        stg.put(
            &format!("{ROOT}/r1/rs.rs0/node.n2:27017.error"),
            err_body("copy failed"),
        );

        let rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            true,
            true,
        );
        let cancel = CancellationToken::new();

        let err = rv.to_state(Status::Running, &cancel).await.unwrap_err();
        match err {
            RestoreError::PeerFailed { node, msg } => {
                assert_eq!(node, "node.n2:27017");
                assert_eq!(msg, "copy failed");
            }
            other => panic!("unexpected error: {other}"),
        }

        // the failed leader propagated the error to its scopes
        assert!(stg.get(&format!("{ROOT}/r1/rs.rs0/rs.error")).is_some());
        assert!(stg.get(&format!("{ROOT}/r1/cluster.error")).is_some());
    }

    #[tokio::test]
    async fn test_peer_error_demotes_done_to_partly_done() {
        let stg = Arc::new(MemStore::new());
        stg.put(
            &format!("{ROOT}/r1/rs.rs0/node.n2:27017.error"),
            err_body("reset failed"),
        );

        let rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            true,
            true,
        );
        let cancel = CancellationToken::new();

        let got = rv.to_state(Status::Done, &cancel).await.unwrap();
        assert_eq!(got, Status::PartlyDone);
        assert!(stg
            .get(&format!("{ROOT}/r1/rs.rs0/rs.partly-done"))
            .is_some());
        assert!(stg.get(&format!("{ROOT}/r1/cluster.partly-done")).is_some());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_stuck_peer() {
        let stg = Arc::new(MemStore::new());
        // peer beat long ago and never reported running
        stg.put(
            &format!("{ROOT}/r1/rs.rs0/node.n2:27017.hb"),
            (unix_now() - 1000).to_string(),
        );

        let mut rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            true,
            true,
        );
        rv.hb_period = Duration::from_secs(60);
        let cancel = CancellationToken::new();

        let err = rv.to_state(Status::Running, &cancel).await.unwrap_err();
        assert!(matches!(err, RestoreError::PeerStuck(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_finished_peer_with_stale_heartbeat_does_not_demote() {
        let stg = Arc::new(MemStore::new());
        stg.put(
            &format!("{ROOT}/r1/rs.rs0/node.n2:27017.hb"),
            (unix_now() - 1000).to_string(),
        );
        stg.put(
            &format!("{ROOT}/r1/rs.rs0/node.n2:27017.done"),
            ok_body(),
        );

        let mut rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            true,
            true,
        );
        rv.hb_period = Duration::from_secs(60);
        let cancel = CancellationToken::new();

        let got = rv.to_state(Status::Done, &cancel).await.unwrap();
        assert_eq!(got, Status::Done);
    }

    #[tokio::test]
    async fn test_missing_peer_past_grace_demotes_done() {
        let stg = Arc::new(MemStore::new());
        let mut rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            true,
            true,
        );
        rv.hb_period = Duration::from_secs(60);
        rv.start_ts = unix_now() - 1000; // peer never wrote anything
        let cancel = CancellationToken::new();

        let got = rv.to_state(Status::Done, &cancel).await.unwrap();
        assert_eq!(got, Status::PartlyDone);
    }

    // Union rule across replica sets: the cluster is `partly-done` as soon
    // as one set is, even when every other set finished clean.
    #[tokio::test]
    async fn test_cluster_union_rule_with_partly_done_shard() {
        let stg = Arc::new(MemStore::new());
        // the second shard's leader already aggregated a mixed outcome
        stg.put(&format!("{ROOT}/r1/rs.rs1/rs.partly-done"), ok_body());

        let mut rv = rendezvous(stg.clone(), "n1:27017", &["n1:27017"], true, true);
        rv.shards = HashSet::from([
            rs_sync_path(ROOT, "r1", "rs0"),
            rs_sync_path(ROOT, "r1", "rs1"),
        ]);
        let cancel = CancellationToken::new();

        let got = rv.to_state(Status::Done, &cancel).await.unwrap();
        assert_eq!(got, Status::PartlyDone);
        assert!(stg.get(&format!("{ROOT}/r1/cluster.partly-done")).is_some());
        // this node itself finished clean
        assert!(stg
            .get(&format!("{ROOT}/r1/rs.rs0/node.n1:27017.done"))
            .is_some());
    }

    #[tokio::test]
    async fn test_cancellation_exits_wait() {
        let stg = Arc::new(MemStore::new());
        let rv = rendezvous(
            stg.clone(),
            "n1:27017",
            &["n1:27017", "n2:27017"],
            false,
            false,
        );
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            c.cancel();
        });

        // non-leader still waits for the cluster object that never comes
        let err = rv.to_state(Status::Starting, &cancel).await.unwrap_err();
        assert!(matches!(err, RestoreError::Cancelled));
    }

    // The config server holds its own shutdown until every data shard has
    // published `down`.
    #[tokio::test]
    async fn test_wait_for_shards_down() {
        let stg = Arc::new(MemStore::new());
        let rv = rendezvous(stg.clone(), "c1:27019", &["c1:27019"], true, true);
        let cancel = CancellationToken::new();

        let gate: HashSet<String> = [
            rs_sync_path(ROOT, "r1", "rs0"),
            rs_sync_path(ROOT, "r1", "rs1"),
        ]
        .into();

        let writer = stg.clone();
        tokio::spawn(async move {
            save_bytes(
                &*writer,
                &format!("{ROOT}/r1/rs.rs0/rs.down"),
                ok_body().into_bytes(),
            )
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            save_bytes(
                &*writer,
                &format!("{ROOT}/r1/rs.rs1/rs.down"),
                ok_body().into_bytes(),
            )
            .await
            .unwrap();
        });

        let got = rv.wait_for(Status::Down, gate, &cancel).await.unwrap();
        assert_eq!(got, Status::Down);
    }

    #[tokio::test]
    async fn test_heartbeat_task_writes_all_scopes() {
        let stg = Arc::new(MemStore::new());
        let mut rv = rendezvous(stg.clone(), "n1:27017", &["n1:27017"], true, true);
        rv.hb_period = Duration::from_millis(10);
        let rv = Arc::new(rv);

        let cancel = CancellationToken::new();
        let h = rv.spawn_heartbeat(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        h.await.unwrap();

        let names = stg.names();
        assert!(names.contains(&format!("{ROOT}/r1/rs.rs0/node.n1:27017.hb")));
        assert!(names.contains(&format!("{ROOT}/r1/rs.rs0/rs.hb")));
        assert!(names.contains(&format!("{ROOT}/r1/cluster.hb")));
    }
}
