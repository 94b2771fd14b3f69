//! Per-node supervisor of restore operations.
//!
//! The embedding daemon feeds operator commands into [`Agent::run_restore`]
//! and owns the command stream, credentials and backend wiring; the agent
//! owns the local lifecycle of one restore at a time: the busy guard, the
//! control-database lock fence, and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::{ControlPlane, LockRequest, NodeClient, RepairConnector};
use crate::restore::rendezvous::{HB_PERIOD, POLL_PERIOD};
use crate::restore::{PhysicalRestore, RestoreCmd};
use crate::storage::ObjectStore;
use crate::utils::errors::{RestoreError, Result};

#[derive(Clone)]
pub struct Agent {
    ctl: Arc<dyn ControlPlane>,
    node: Arc<dyn NodeClient>,
    stg: Arc<dyn ObjectStore>,
    connector: Arc<dyn RepairConnector>,
    config: Config,
    busy: Arc<AtomicBool>,

    /// Rendezvous pacing; overridable for tests.
    pub poll: Duration,
    pub hb_period: Duration,
}

/// Clears the busy flag when the running restore ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Agent {
    pub fn new(
        ctl: Arc<dyn ControlPlane>,
        node: Arc<dyn NodeClient>,
        stg: Arc<dyn ObjectStore>,
        connector: Arc<dyn RepairConnector>,
        config: Config,
    ) -> Self {
        Self {
            ctl,
            node,
            stg,
            connector,
            config,
            busy: Arc::new(AtomicBool::new(false)),
            poll: POLL_PERIOD,
            hb_period: HB_PERIOD,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run a physical restore to completion. Blocks for the duration; at
    /// most one restore may be in progress per node.
    ///
    /// Every node of the replica set takes part, but only the primary takes
    /// the control-database lock, fencing concurrent operation kinds. The
    /// lock is released again before the database stops: from then on the
    /// whole coordination happens through storage, and the lock record
    /// would go down with the database anyway.
    pub async fn run_restore(
        &self,
        cmd: RestoreCmd,
        opid: &str,
        epoch: i64,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RestoreError::Busy);
        }
        let _guard = BusyGuard(self.busy.clone());

        info!("restore `{}` from backup `{}`", cmd.name, cmd.backup_name);

        let node_info = self.node.info().await?;

        let mut rstr = PhysicalRestore::new(
            self.ctl.clone(),
            self.node.clone(),
            self.stg.clone(),
            self.connector.clone(),
            cmd.rs_remap.clone(),
            self.config.restore.clone(),
        )
        .await?;
        rstr.poll = self.poll;
        rstr.hb_period = self.hb_period;

        if node_info.is_primary {
            let lock = LockRequest {
                kind: "restore".to_string(),
                replset: node_info.set_name.clone(),
                node: node_info.me.clone(),
                opid: opid.to_string(),
                epoch,
            };

            if !self.ctl.acquire_lock(&lock).await? {
                info!("skip: lock not acquired");
                return Err(RestoreError::LockContended);
            }
            if let Err(e) = self.ctl.release_lock(&lock).await {
                warn!("release lock: {e}");
            }
        }

        info!("restore started");
        match rstr.snapshot(&cmd, opid, cancel).await {
            Ok(()) => {
                info!("restore finished successfully");
                Ok(())
            }
            Err(e) if e.is_no_data_for_shard() => {
                info!("no data for the shard in backup, skipping");
                Ok(())
            }
            Err(e) => {
                tracing::error!("restore failed: {e}");
                Err(e)
            }
        }
    }
}
