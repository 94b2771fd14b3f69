//! Supervised boots of the database binary during a restore.
//!
//! The engine is started three times on a loopback-only ephemeral port with
//! a synthesized minimal configuration. Each boot is followed by a graceful
//! shutdown and a wait on the storage-engine lock file; a process that
//! exited with a non-empty lock file has not finished its cleanup and later
//! boots would corrupt state.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::control::{RepairConnector, RepairSession};
use crate::meta::{majmin, MongodOpts};
use crate::utils::errors::{RestoreError, Result};

/// Storage-engine lock file; zero length once the engine unmounted cleanly.
pub const ENGINE_LOCK_FILE: &str = "mongod.lock";

/// Log file of the supervised boots. Lives inside the data path and is the
/// one entry the wipe spares.
pub const BOOT_LOG_FILE: &str = "restore.mongod.log";

const PORT_RANGE: u16 = 1111;
const PORT_TRIES: usize = 150;

const CONN_TRIES: usize = 5;
const CONN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pick a free port in `(current, current + 1111]`, verified by binding.
pub fn pick_tmp_port(current: u16) -> Result<u16> {
    let mut rng = rand::thread_rng();

    for _ in 0..PORT_TRIES {
        let p = current as u32 + rng.gen_range(1..=PORT_RANGE) as u32;
        if p > u16::MAX as u32 {
            continue;
        }
        if std::net::TcpListener::bind(("127.0.0.1", p as u16)).is_ok() {
            return Ok(p as u16);
        }
    }

    Err(RestoreError::ConfigInvalid(format!(
        "can't find unused port in range ({}, {}]",
        current,
        current as u32 + PORT_RANGE as u32
    )))
}

/// Write the minimal boot configuration to a temp file. The file is removed
/// when the returned handle drops.
pub fn write_tmp_conf(opts: &MongodOpts) -> Result<NamedTempFile> {
    let yaml = serde_yaml::to_string(opts)
        .map_err(|e| RestoreError::ConfigInvalid(format!("encode boot config: {e}")))?;

    let mut f = tempfile::Builder::new()
        .prefix("restoreMongodConf")
        .tempfile()?;
    f.write_all(yaml.as_bytes())?;
    f.flush()?;
    Ok(f)
}

/// One supervised boot target.
pub struct BootSpec {
    pub binary: String,
    pub conf: PathBuf,
    pub dbpath: PathBuf,
    pub port: u16,
}

impl BootSpec {
    /// Spawn the database process detached. `set_params` are passed as
    /// repeated `--setParameter key=value` flags.
    pub async fn start(&self, set_params: &[&str]) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f")
            .arg(&self.conf)
            .arg("--logpath")
            .arg(self.dbpath.join(BOOT_LOG_FILE));
        for p in set_params {
            cmd.arg("--setParameter").arg(p);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RestoreError::EngineBinaryMissing(self.binary.clone())
            } else {
                RestoreError::Io(e)
            }
        })?;

        // reap the process whenever it exits
        tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(out) if !out.status.success() => {
                    tracing::warn!(
                        "database process exited with {}: {}",
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    );
                }
                Err(e) => tracing::warn!("wait for database process: {e}"),
                _ => {}
            }
        });

        Ok(())
    }

    /// Connect to the booted process. Failed attempts scan the engine log
    /// and abort early on error/fatal records instead of burning the
    /// remaining tries.
    pub async fn connect(
        &self,
        connector: &dyn RepairConnector,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RepairSession>> {
        let logpath = self.dbpath.join(BOOT_LOG_FILE);
        let mut last_err = String::new();

        for _ in 0..CONN_TRIES {
            if cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }

            match connector.connect(self.port, CONN_TIMEOUT).await {
                Ok(sess) => return Ok(sess),
                Err(e) => last_err = e.to_string(),
            }

            if let Ok(logs) = tokio::fs::read_to_string(&logpath).await {
                if let Some(fatal) = scan_engine_log(&logs) {
                    return Err(RestoreError::LocalDbStuck(format!(
                        "engine failed with {fatal}, connect err: {last_err}"
                    )));
                }
            }
        }

        Err(RestoreError::LocalDbStuck(format!(
            "failed to connect after {CONN_TRIES} tries: {last_err}"
        )))
    }
}

/// First error or fatal record of the engine's JSON-lines log.
fn scan_engine_log(text: &str) -> Option<String> {
    for line in text.lines() {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let s = v.get("s").and_then(|s| s.as_str()).unwrap_or("");
        if s == "E" || s == "F" {
            let msg = v.get("msg").and_then(|m| m.as_str()).unwrap_or("");
            return Some(format!("[{s}] {msg}"));
        }
    }
    None
}

/// Graceful shutdown of a supervised boot: send the command, then wait for
/// the engine to unmount.
pub async fn shutdown(
    sess: Box<dyn RepairSession>,
    dbpath: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    sess.shutdown().await?;
    wait_lock_drain(dbpath, cancel).await
}

/// Poll the engine lock file until it is empty. A missing file counts as
/// unmounted: a wiped data path has nothing mounted.
pub async fn wait_lock_drain(dbpath: &Path, cancel: &CancellationToken) -> Result<()> {
    let lock = dbpath.join(ENGINE_LOCK_FILE);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
        }

        match tokio::fs::metadata(&lock).await {
            Ok(md) if md.len() == 0 => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Ensure the database binary is runnable and matches the backup's engine
/// version (major.minor). Returns the binary's reported version.
pub async fn check_binary(binary: &str, need_version: &str) -> Result<String> {
    let out = Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RestoreError::EngineBinaryMissing(binary.to_string())
            } else {
                RestoreError::Io(e)
            }
        })?;

    if !out.status.success() {
        return Err(RestoreError::EngineBinaryMissing(format!(
            "{binary}: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&out.stdout);
    let first = stdout.lines().next().unwrap_or("");
    let v = first
        .split("db version ")
        .nth(1)
        .map(|v| v.trim().to_string())
        .ok_or_else(|| {
            RestoreError::EngineBinaryMissing(format!("parse version from output `{first}`"))
        })?;

    if majmin(need_version) != majmin(&v) {
        return Err(RestoreError::EngineVersionMismatch(format!(
            "backup's engine version ({need_version}) is not compatible with {v}"
        )));
    }

    Ok(v)
}
