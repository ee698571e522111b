// Copyright (C) 2024 SentryShot Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Disk space reclamation (§4.E): periodically deletes the oldest
//! recordings, balanced round-robin across monitors, until total usage
//! drops back under budget.
//!
//! Each monitor's most recently started recording is treated as
//! currently-open and is never a deletion candidate — the recorder always
//! names files by a strictly increasing, lexicographically-sortable
//! timestamp path, so "last in sorted order" and "currently open"
//! coincide in practice.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{wrap, Error, ErrorInt, Source};

pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// One on-disk recording discovered under the `YYYY/MM/DD/<monitor-id>/`
/// hierarchy (§6). `base` sorts chronologically within a monitor because
/// every path component is fixed-width and zero-padded.
#[derive(Clone, Debug)]
struct RecordingEntry {
    base: PathBuf,
    size_bytes: u64,
}

pub struct DiskManager {
    recordings_root: PathBuf,
    max_disk_usage_bytes: u64,
    prune_interval: Duration,
}

impl DiskManager {
    pub fn new(recordings_root: PathBuf, max_disk_usage_bytes: u64) -> Self {
        DiskManager {
            recordings_root,
            max_disk_usage_bytes,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Runs the periodic prune loop until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        loop {
            if let Err(e) = self.prune_once().await {
                log::warn!("disk manager: prune pass failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.prune_interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Runs one prune pass, returning the bases of every recording deleted,
    /// oldest-first round-robin across monitors (§4.E, §8 scenario 6).
    /// Monitors are visited in ascending id order so the round-robin
    /// sequence is deterministic rather than dependent on filesystem
    /// iteration order.
    pub async fn prune_once(&self) -> Result<Vec<PathBuf>, Error> {
        if !tokio::fs::try_exists(&self.recordings_root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let per_monitor = self.list_recordings().await?;
        let mut total: u64 = per_monitor.values().flatten().map(|r| r.size_bytes).sum();

        let mut queues: Vec<VecDeque<RecordingEntry>> = per_monitor
            .into_values()
            .map(|mut recs| {
                recs.sort_by(|a, b| a.base.cmp(&b.base));
                recs.pop(); // exclude the currently-open recording
                recs.into()
            })
            .collect();

        let mut deleted = Vec::new();
        'outer: loop {
            if total <= self.max_disk_usage_bytes {
                break;
            }
            let mut made_progress = false;
            for queue in queues.iter_mut() {
                if total <= self.max_disk_usage_bytes {
                    break 'outer;
                }
                let Some(entry) = queue.pop_front() else {
                    continue;
                };
                self.delete_recording(&entry).await?;
                total = total.saturating_sub(entry.size_bytes);
                deleted.push(entry.base.clone());
                made_progress = true;
            }
            if !made_progress {
                break;
            }
        }
        self.remove_empty_dirs().await;
        Ok(deleted)
    }

    /// Walks the `YYYY/MM/DD/<monitor-id>/` hierarchy under the recordings
    /// root and groups every recording by monitor id. A `BTreeMap` key
    /// gives ascending, deterministic monitor ordering for free.
    async fn list_recordings(&self) -> Result<BTreeMap<String, Vec<RecordingEntry>>, Error> {
        let mut by_monitor = BTreeMap::new();
        self.collect_recordings(self.recordings_root.clone(), &mut by_monitor)
            .await?;
        Ok(by_monitor)
    }

    /// A directory is treated as a monitor directory, rather than a date
    /// directory to recurse through, as soon as it directly contains at
    /// least one `.meta` file.
    fn collect_recordings<'a>(
        &'a self,
        dir: PathBuf,
        by_monitor: &'a mut BTreeMap<String, Vec<RecordingEntry>>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| io_fatal(&dir, e))?;
            let mut subdirs = Vec::new();
            let mut metas = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_fatal(&dir, e))? {
                let path = entry.path();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    subdirs.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) == Some("meta") {
                    metas.push(path);
                }
            }

            if !metas.is_empty() {
                let monitor_id = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let mut recs = Vec::with_capacity(metas.len());
                for meta_path in metas {
                    let base = meta_path.with_extension("");
                    let size_bytes = recording_size_bytes(&base).await;
                    recs.push(RecordingEntry { base, size_bytes });
                }
                by_monitor.entry(monitor_id).or_insert_with(Vec::new).extend(recs);
            }

            for subdir in subdirs {
                self.collect_recordings(subdir, by_monitor).await?;
            }
            Ok(())
        })
    }

    async fn delete_recording(&self, entry: &RecordingEntry) -> Result<(), Error> {
        for ext in ["meta", "mdat", "jpeg"] {
            let _ = tokio::fs::remove_file(entry.base.with_extension(ext)).await;
        }
        Ok(())
    }

    /// Recursively removes now-empty directories under the recordings
    /// root (monitor directories, then the `DD`/`MM`/`YYYY` date
    /// directories above them once they too hold nothing) — §4.E step 4.
    async fn remove_empty_dirs(&self) {
        Self::remove_empty_dirs_under(self.recordings_root.clone()).await;
    }

    fn remove_empty_dirs_under(dir: PathBuf) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                return;
            };
            let mut subdirs = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    subdirs.push(entry.path());
                }
            }
            for subdir in subdirs {
                Self::remove_empty_dirs_under(subdir.clone()).await;
                let is_empty = match tokio::fs::read_dir(&subdir).await {
                    Ok(mut d) => matches!(d.next_entry().await, Ok(None)),
                    Err(_) => false,
                };
                if is_empty {
                    let _ = tokio::fs::remove_dir(&subdir).await;
                }
            }
        })
    }
}

async fn recording_size_bytes(base: &Path) -> u64 {
    let mut total = 0u64;
    for ext in ["meta", "mdat", "jpeg"] {
        if let Ok(meta) = tokio::fs::metadata(base.with_extension(ext)).await {
            total += meta.len();
        }
    }
    total
}

fn io_fatal(path: &Path, cause: std::io::Error) -> Error {
    wrap!(ErrorInt::IoFatal {
        source_tag: Source::Disk,
        monitor_id: String::new(),
        description: format!("{} failed", path.display()),
        cause: Some(cause),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_recording(monitor_dir: &Path, start_time: i64, payload_size: usize) {
        tokio::fs::create_dir_all(monitor_dir).await.unwrap();
        let base = monitor_dir.join(start_time.to_string());
        tokio::fs::write(base.with_extension("meta"), vec![0u8; 4]).await.unwrap();
        tokio::fs::write(base.with_extension("mdat"), vec![0u8; payload_size]).await.unwrap();
    }

    fn date_dir(root: &Path, monitor: &str) -> PathBuf {
        root.join("2024").join("01").join("01").join(monitor)
    }

    #[tokio::test]
    async fn round_robins_oldest_first_across_monitors() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for monitor in ["m1", "m2", "m3"] {
            let monitor_dir = date_dir(root, monitor);
            for i in 0..10 {
                make_recording(&monitor_dir, i, 96).await; // 100 bytes/recording (4 + 96)
            }
        }
        let per_recording = 100u64;
        // 30 recordings total; budget leaves room for 25, forcing exactly 5
        // round-robin deletions (scenario 6's ordering, under a budget that
        // is internally consistent with "30 equal-size recordings").
        let manager = DiskManager::new(root.to_path_buf(), per_recording * 25);
        let deleted = manager.prune_once().await.unwrap();

        assert_eq!(deleted.len(), 5);
        let names: Vec<String> = deleted
            .iter()
            .map(|p| {
                let monitor = p.parent().unwrap().file_name().unwrap().to_str().unwrap();
                let stamp = p.file_name().unwrap().to_str().unwrap();
                format!("{monitor}/{stamp}")
            })
            .collect();
        assert_eq!(
            names,
            vec!["m1/0", "m2/0", "m3/0", "m1/1", "m2/1"],
            "round-robin ordering must be deterministic (monitors visited in id order), \
             not an artifact of read_dir's unspecified iteration order"
        );
    }

    #[tokio::test]
    async fn never_deletes_the_newest_recording_per_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let monitor_dir = date_dir(root, "m1");
        for i in 0..3 {
            make_recording(&monitor_dir, i, 96).await;
        }
        let manager = DiskManager::new(root.to_path_buf(), 0);
        let deleted = manager.prune_once().await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(tokio::fs::try_exists(monitor_dir.join("2.meta")).await.unwrap());
    }

    #[tokio::test]
    async fn removes_empty_date_hierarchy_once_a_monitor_is_fully_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let monitor_dir = date_dir(root, "m1");
        for i in 0..2 {
            make_recording(&monitor_dir, i, 96).await;
        }
        let manager = DiskManager::new(root.to_path_buf(), 0);
        manager.prune_once().await.unwrap();
        // The newest recording ("1") survives, so the hierarchy is intact.
        assert!(monitor_dir.exists());

        let _ = tokio::fs::remove_file(monitor_dir.join("1.meta")).await;
        let _ = tokio::fs::remove_file(monitor_dir.join("1.mdat")).await;
        manager.prune_once().await.unwrap();

        assert!(!monitor_dir.exists());
        assert!(!root.join("2024").exists());
    }
}
