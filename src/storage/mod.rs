//! Object-store capability surface the restore engine consumes.
//!
//! Concrete backends (S3, Azure, filesystem) live outside this crate; the
//! engine only ever needs the three operations below. All rendezvous
//! objects are tiny (< 1 KiB); artifact reads stream.

use std::io::Cursor;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::unix_now;

/// Streaming reader returned by the store.
pub type ObjReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object does not exist")]
    NotExist,

    #[error("object is empty")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object. `size` may be -1 when unknown.
    async fn save(&self, name: &str, data: ObjReader, size: i64) -> Result<(), StorageError>;

    /// Open an object for streaming reads.
    async fn source_reader(&self, name: &str) -> Result<ObjReader, StorageError>;

    /// Stat an object. Returns `NotExist` / `Empty` as errors.
    async fn file_stat(&self, name: &str) -> Result<FileStat, StorageError>;
}

/// Store a small in-memory object.
pub async fn save_bytes(
    stg: &dyn ObjectStore,
    name: &str,
    data: Vec<u8>,
) -> Result<(), StorageError> {
    let size = data.len() as i64;
    stg.save(name, Box::new(Cursor::new(data)), size).await
}

/// Read a whole object into memory. Only for rendezvous-sized objects.
pub async fn read_to_vec(stg: &dyn ObjectStore, name: &str) -> Result<Vec<u8>, StorageError> {
    let mut r = stg.source_reader(name).await?;
    let mut buf = Vec::new();
    r.read_to_end(&mut buf).await?;
    Ok(buf)
}

pub async fn read_to_string(stg: &dyn ObjectStore, name: &str) -> Result<String, StorageError> {
    let buf = read_to_vec(stg, name).await?;
    String::from_utf8(buf).map_err(|e| StorageError::Backend(e.to_string()))
}

/// Presence probe. A missing or empty object counts as absent.
pub async fn exists(stg: &dyn ObjectStore, name: &str) -> Result<bool, StorageError> {
    match stg.file_stat(name).await {
        Ok(_) => Ok(true),
        Err(StorageError::NotExist) | Err(StorageError::Empty) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Body of a successful status object: `<unix-ts>`.
pub fn ok_body() -> String {
    unix_now().to_string()
}

/// Body of an error status object: `<unix-ts>:<message>`.
pub fn err_body(msg: &str) -> String {
    format!("{}:{}", unix_now(), msg)
}

/// Split a status body into its timestamp and optional error text.
pub fn parse_body(body: &str) -> (i64, Option<&str>) {
    match body.split_once(':') {
        Some((ts, msg)) => (ts.trim().parse().unwrap_or(0), Some(msg)),
        None => (body.trim().parse().unwrap_or(0), None),
    }
}
