//! Log mirroring for the offline phase of a restore.
//!
//! Once the local database is stopped, the control database can no longer
//! receive log entries. Lines logged through [`StorageLog`] still go to the
//! process logger, and, while offline mode is on, accumulate in a memory
//! buffer that is dumped to `rs.<rs-id>/log/<host>.<n>.log` on storage when
//! it exceeds the flush limit and once more on exit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::storage::{save_bytes, ObjectStore};
use crate::utils::unix_now;

const FLUSH_LIMIT: usize = 1 << 20; // 1 MiB

pub struct StorageLog {
    stg: Arc<dyn ObjectStore>,
    /// Object name prefix, `<root>/<restore>/rs.<rs-id>/log/<host>`.
    path: String,
    buf: Mutex<String>,
    cnt: AtomicUsize,
    offline: AtomicBool,
    limit: usize,
}

impl StorageLog {
    pub fn new(stg: Arc<dyn ObjectStore>, path: String) -> Self {
        Self {
            stg,
            path,
            buf: Mutex::new(String::new()),
            cnt: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            limit: FLUSH_LIMIT,
        }
    }

    /// Start mirroring to the storage buffer. Called right before the local
    /// database goes down.
    pub fn set_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub async fn info(&self, msg: &str) {
        tracing::info!("{msg}");
        self.append("I", msg).await;
    }

    pub async fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
        self.append("D", msg).await;
    }

    pub async fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
        self.append("W", msg).await;
    }

    pub async fn error(&self, msg: &str) {
        tracing::error!("{msg}");
        self.append("E", msg).await;
    }

    async fn append(&self, level: &str, msg: &str) {
        if !self.offline.load(Ordering::SeqCst) {
            return;
        }

        let full = {
            let mut buf = self.buf.lock().unwrap();
            buf.push_str(&format!("{} {} {}\n", unix_now(), level, msg));
            if buf.len() > self.limit {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };

        if let Some(chunk) = full {
            self.write_chunk(chunk).await;
        }
    }

    /// Dump whatever is buffered. Called on restore exit, any outcome.
    pub async fn flush(&self) {
        let chunk = std::mem::take(&mut *self.buf.lock().unwrap());
        if !chunk.is_empty() {
            self.write_chunk(chunk).await;
        }
    }

    async fn write_chunk(&self, chunk: String) {
        let n = self.cnt.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}.{}.log", self.path, n);
        if let Err(e) = save_bytes(self.stg.as_ref(), &name, chunk.into_bytes()).await {
            tracing::warn!("dump log buffer to {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::read_to_string;
    use crate::testutil::MemStore;

    #[tokio::test]
    async fn test_buffers_only_when_offline() {
        let stg = Arc::new(MemStore::new());
        let log = StorageLog::new(stg.clone(), "r/rs.rs0/log/n1:27017".to_string());

        log.info("still online").await;
        log.flush().await;
        assert!(stg.names().is_empty());

        log.set_offline();
        log.info("copying data").await;
        log.flush().await;

        let body = read_to_string(&*stg, "r/rs.rs0/log/n1:27017.0.log")
            .await
            .unwrap();
        assert!(body.contains("I copying data"));
    }

    #[tokio::test]
    async fn test_rolls_over_at_limit() {
        let stg = Arc::new(MemStore::new());
        let mut log = StorageLog::new(stg.clone(), "r/rs.rs0/log/n1:27017".to_string());
        log.limit = 64;
        log.set_offline();

        for i in 0..8 {
            log.info(&format!("line {i} padded to make it long enough"))
                .await;
        }
        log.flush().await;

        let names = stg.names();
        assert!(names.len() >= 2, "expected rolled chunks, got {names:?}");
        assert!(names.contains(&"r/rs.rs0/log/n1:27017.0.log".to_string()));
        assert!(names.contains(&"r/rs.rs0/log/n1:27017.1.log".to_string()));
    }
}
