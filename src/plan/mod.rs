//! Artifact planner: given a target backup and this node's replica-set name
//! it computes the ordered list of files and byte-ranges to fetch.
//!
//! For non-incremental backups the plan is just the target's file list plus
//! journal. For incrementals it walks the `src_backup` chain back in time to
//! the closest full base, keeping only files the target still lists.
//! A file recorded with `offset == -1 && length == -1` carries no bytes in
//! that backup; it marks "unchanged, look further down the chain".
//!
//! Frames are emitted target-first. Restoration applies them in reverse, so
//! the base lands first and later diffs overwrite its byte ranges.

use std::collections::{HashMap, HashSet};

use crate::control::ControlPlane;
use crate::meta::{BackupFile, BackupMeta, Compression};
use crate::utils::errors::{RestoreError, Result};

/// Marker backup name of the synthetic directory-only frame.
pub const DIR_FRAME: &str = "__dir__";

/// Files to fetch from one backup of the chain.
#[derive(Debug, Clone)]
pub struct Frame {
    pub backup: String,
    pub compression: Compression,
    pub files: Vec<BackupFile>,
    /// Stored path prefix to cut from destinations, for backups whose file
    /// names were recorded as absolute paths (detected via the journal
    /// directory, which always sits in the data-path root).
    pub dbpath: Option<String>,
}

impl Frame {
    pub fn is_dir_only(&self) -> bool {
        self.backup == DIR_FRAME
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Emission order: target backup first, base last, then the optional
    /// directory-only frame.
    pub frames: Vec<Frame>,
}

impl Plan {
    /// Backup names base-first, the order restoration applies them in.
    pub fn chain(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .filter(|f| !f.is_dir_only())
            .map(|f| f.backup.clone())
            .collect()
    }
}

/// Build the artifact plan for `rs_name` (the backup-side replica-set name).
pub async fn build(ctl: &dyn ControlPlane, target: &BackupMeta, rs_name: &str) -> Result<Plan> {
    let mut rs = target
        .replset(rs_name)
        .ok_or(RestoreError::NoDataForShard)?
        .clone();

    // Names the target declares; value flips once some frame carries bytes.
    let mut emitted: HashMap<String, bool> = HashMap::new();
    let mut name_order: Vec<String> = Vec::new();
    for f in rs.files.iter().chain(rs.journal.iter()) {
        if emitted.insert(f.name.clone(), false).is_none() {
            name_order.push(f.name.clone());
        }
    }

    let mut plan = Plan::default();
    let mut bcp = target.clone();

    loop {
        let mut frame = Frame {
            backup: bcp.name.clone(),
            compression: bcp.compression,
            files: Vec::new(),
            dbpath: None,
        };

        for f in rs.files.iter().chain(rs.journal.iter()) {
            if let Some(was) = emitted.get_mut(&f.name) {
                if f.restorable() {
                    frame.files.push(f.clone());
                    *was = true;

                    if frame.dbpath.is_none() {
                        frame.dbpath = find_dbpath(&f.name);
                    }
                }
            }
        }

        if frame.dbpath.is_some() {
            tracing::debug!(
                "absolute file names in backup {}, data path prefix {:?}",
                frame.backup,
                frame.dbpath
            );
        }

        plan.frames.push(frame);

        let src = match &bcp.src_backup {
            Some(s) if !s.is_empty() => s.clone(),
            _ => break,
        };

        tracing::debug!("fetching source backup {src}");
        bcp = ctl
            .backup_meta(&src)
            .await
            .map_err(|_| RestoreError::BackupMissing(src.clone()))?;
        rs = bcp
            .replset(rs_name)
            .ok_or_else(|| {
                RestoreError::BackupIncompatible(format!(
                    "no section for replica set {rs_name} in source backup {}",
                    bcp.name
                ))
            })?
            .clone();
    }

    // Names never materialized anywhere in the chain belong to collections
    // created after the last checkpoint. The engine re-creates the files on
    // start but, with per-database directories, not the directories; emit
    // one synthetic record per missing parent dir so copy creates them.
    let mut dirs = Vec::new();
    let mut seen_dirs = HashSet::new();
    for name in &name_order {
        if emitted[name] {
            continue;
        }
        if let Some(idx) = name.rfind('/') {
            let dir = &name[..idx];
            if !dir.is_empty() && seen_dirs.insert(dir.to_string()) {
                dirs.push(BackupFile {
                    name: name.clone(),
                    offset: -1,
                    length: -1,
                    size: -1,
                    fmode: 0o700,
                });
            }
        }
    }

    if !dirs.is_empty() {
        plan.frames.push(Frame {
            backup: DIR_FRAME.to_string(),
            compression: Compression::None,
            files: dirs,
            dbpath: None,
        });
    }

    Ok(plan)
}

/// Detect the recorded data-path prefix in an absolute file name. Only the
/// journal directory gives away the exact prefix: it always lives in the
/// data-path root and contains no subdirectories.
fn find_dbpath(name: &str) -> Option<String> {
    if !name.starts_with('/') {
        return None;
    }

    let dir = &name[..=name.rfind('/')?];
    let parent = dir.strip_suffix("journal/")?;
    if parent.ends_with('/') || parent.is_empty() {
        let p = if parent.is_empty() { "/" } else { parent };
        return Some(p.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BackupKind, ReplsetMeta, Status};
    use crate::testutil::FakeControl;

    fn file(name: &str, off: i64, len: i64, size: i64) -> BackupFile {
        BackupFile {
            name: name.to_string(),
            offset: off,
            length: len,
            size,
            fmode: 0o600,
        }
    }

    fn backup(name: &str, src: Option<&str>, files: Vec<BackupFile>) -> BackupMeta {
        BackupMeta {
            name: name.to_string(),
            kind: if src.is_some() {
                BackupKind::Incremental
            } else {
                BackupKind::Physical
            },
            compression: Compression::None,
            src_backup: src.map(|s| s.to_string()),
            shard_remap: Default::default(),
            replsets: vec![ReplsetMeta {
                name: "rs0".to_string(),
                files,
                ..Default::default()
            }],
            last_write_ts: Default::default(),
            engine_version: "7.0.0".to_string(),
            tool_version: "0.1.0".to_string(),
            status: Status::Done,
            start_ts: 0,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_full_backup_single_frame() {
        let ctl = FakeControl::new(vec![], vec![]);
        let target = backup(
            "b1",
            None,
            vec![file("collection-0.wt", 0, 0, 4096), file("ghost.wt", -1, -1, -1)],
        );

        let plan = build(&ctl, &target, "rs0").await.unwrap();
        assert_eq!(plan.frames.len(), 1);
        assert_eq!(plan.frames[0].files.len(), 1);
        assert_eq!(plan.frames[0].files[0].name, "collection-0.wt");
        assert_eq!(plan.chain(), vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_incremental_chain_intersects_with_target() {
        let ctl = FakeControl::new(vec![], vec![]);
        // base carries a file the target no longer lists; it must not be
        // fetched.
        ctl.add_backup(backup(
            "base",
            None,
            vec![
                file("collection-7.wt", 0, 1 << 20, 1 << 20),
                file("dropped.wt", 0, 512, 512),
            ],
        ));
        ctl.add_backup(backup(
            "diff1",
            Some("base"),
            vec![file("collection-7.wt", 0, 1 << 20, 0)],
        ));
        let target = backup(
            "diff2",
            Some("diff1"),
            vec![file("collection-7.wt", 1 << 19, 1 << 20, 3 << 19)],
        );

        let plan = build(&ctl, &target, "rs0").await.unwrap();
        let names: Vec<&str> = plan.frames.iter().map(|f| f.backup.as_str()).collect();
        assert_eq!(names, vec!["diff2", "diff1", "base"]);
        assert_eq!(plan.chain(), vec!["base", "diff1", "diff2"]);

        for frame in &plan.frames {
            assert_eq!(frame.files.len(), 1, "frame {}", frame.backup);
            assert_eq!(frame.files[0].name, "collection-7.wt");
        }
    }

    #[tokio::test]
    async fn test_chain_stops_at_base_and_unchanged_files_resolve() {
        let ctl = FakeControl::new(vec![], vec![]);
        ctl.add_backup(backup(
            "base",
            None,
            vec![file("index-1.wt", 0, 8192, 8192)],
        ));
        // target lists the file as unchanged; bytes come from the base
        let target = backup("inc", Some("base"), vec![file("index-1.wt", -1, -1, 8192)]);

        let plan = build(&ctl, &target, "rs0").await.unwrap();
        assert_eq!(plan.frames.len(), 2);
        assert!(plan.frames[0].files.is_empty());
        assert_eq!(plan.frames[1].files[0].name, "index-1.wt");
    }

    #[tokio::test]
    async fn test_missing_dirs_synthesized() {
        let ctl = FakeControl::new(vec![], vec![]);
        let target = backup(
            "b1",
            None,
            vec![
                file("db1/collection-1.wt", -1, -1, -1),
                file("db1/collection-2.wt", -1, -1, -1),
                file("db2/index-9.wt", -1, -1, -1),
                file("rootfile.wt", -1, -1, -1),
                file("present.wt", 0, 128, 128),
            ],
        );

        let plan = build(&ctl, &target, "rs0").await.unwrap();
        assert_eq!(plan.frames.len(), 2);

        let dir_frame = &plan.frames[1];
        assert!(dir_frame.is_dir_only());
        // one record per distinct parent dir; root-level names contribute none
        assert_eq!(dir_frame.files.len(), 2);
        assert_eq!(dir_frame.files[0].name, "db1/collection-1.wt");
        assert_eq!(dir_frame.files[1].name, "db2/index-9.wt");
    }

    #[tokio::test]
    async fn test_absolute_names_detect_data_path() {
        let ctl = FakeControl::new(vec![], vec![]);
        let target = backup(
            "b1",
            None,
            vec![
                file("/data/db/collection-3.wt", 0, 64, 64),
                file("/data/db/journal/WiredTigerLog.0000000001", 0, 128, 128),
            ],
        );

        let plan = build(&ctl, &target, "rs0").await.unwrap();
        assert_eq!(plan.frames[0].dbpath.as_deref(), Some("/data/db/"));
    }

    #[test]
    fn test_find_dbpath() {
        assert_eq!(find_dbpath("collection-1.wt"), None);
        assert_eq!(find_dbpath("journal/WiredTigerLog.01"), None);
        assert_eq!(
            find_dbpath("/var/lib/db/journal/WiredTigerLog.01"),
            Some("/var/lib/db/".to_string())
        );
        assert_eq!(find_dbpath("/journal/WiredTigerLog.01"), Some("/".to_string()));
        // absolute but not a journal file: prefix not detectable
        assert_eq!(find_dbpath("/var/lib/db/collection-1.wt"), None);
    }

    #[tokio::test]
    async fn test_no_section_for_replset() {
        let ctl = FakeControl::new(vec![], vec![]);
        let target = backup("b1", None, vec![file("a.wt", 0, 1, 1)]);

        let err = build(&ctl, &target, "rs9").await.unwrap_err();
        assert!(matches!(err, RestoreError::NoDataForShard));
    }
}
