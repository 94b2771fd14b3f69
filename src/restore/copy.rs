//! Artifact copy phase: stream the planned backup files from storage into
//! the wiped data path.
//!
//! Frames are applied in reverse emission order, base first, so diffs
//! overwrite byte ranges of the base. Each descriptor may carry an offset
//! (seek before writing) and a logical size (truncate after writing).

use std::path::Path;
use std::time::Instant;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::meta::Compression;
use crate::plan::Plan;
use crate::storage::ObjectStore;
use crate::utils::errors::{RestoreError, Result};

/// Best-effort download statistics reported to the node's `stat.<host>`
/// object after the copy.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DownloadStat {
    pub files: u64,
    pub bytes: u64,
    pub elapsed_secs: u64,
}

/// Source object name of one planned file.
pub fn source_object(backup: &str, rs: &str, file_name: &str, cmpr: Compression, off: i64, len: i64) -> String {
    let mut src = format!("{backup}/{rs}/{file_name}{}", cmpr.suffix());
    if len != 0 {
        src.push_str(&format!(".{off}-{len}"));
    }
    src
}

pub async fn copy_files(
    stg: &dyn ObjectStore,
    plan: &Plan,
    rs_name: &str,
    dbpath: &Path,
    chunk_mb: usize,
    cancel: &CancellationToken,
) -> Result<DownloadStat> {
    let started = Instant::now();
    let mut stat = DownloadStat::default();
    let buf_size = chunk_mb.max(1) * 1024 * 1024;

    for frame in plan.frames.iter().rev() {
        for f in &frame.files {
            if cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }

            // strip the recorded data-path prefix, if any
            let mut name = f.name.as_str();
            if let Some(prefix) = &frame.dbpath {
                name = name.strip_prefix(prefix.as_str()).unwrap_or(name);
            }
            let dst = dbpath.join(name.trim_start_matches('/'));

            if let Some(parent) = dst.parent() {
                mkdir_all(parent).await?;
            }

            // directory-only records just need their parent to exist
            if frame.is_dir_only() {
                tracing::info!("create dir <{}>", dst.parent().unwrap_or(dbpath).display());
                continue;
            }

            let src = source_object(
                &frame.backup,
                rs_name,
                &f.name,
                frame.compression,
                f.offset,
                f.length,
            );
            tracing::info!("copy <{}> to <{}>", src, dst.display());

            let reader = stg.source_reader(&src).await?;
            let mut data: Box<dyn AsyncRead + Send + Unpin> = match frame.compression {
                Compression::None => reader,
                Compression::Gzip => Box::new(GzipDecoder::new(BufReader::new(reader))),
                Compression::Zstd => Box::new(ZstdDecoder::new(BufReader::new(reader))),
            };

            let mut fw = open_destination(&dst, f.fmode).await?;
            if f.offset != 0 {
                fw.seek(std::io::SeekFrom::Start(f.offset as u64)).await?;
            }

            let mut buffered = BufReader::with_capacity(buf_size, &mut data);
            let n = tokio::io::copy_buf(&mut buffered, &mut fw).await?;

            if f.size > 0 {
                fw.set_len(f.size as u64).await?;
            }
            fw.sync_all().await?;

            stat.files += 1;
            stat.bytes += n;
        }
    }

    stat.elapsed_secs = started.elapsed().as_secs();
    Ok(stat)
}

async fn mkdir_all(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await?;
    Ok(())
}

async fn open_destination(dst: &Path, fmode: u32) -> Result<tokio::fs::File> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true);
    #[cfg(unix)]
    opts.mode(fmode);
    Ok(opts.open(dst).await?)
}
