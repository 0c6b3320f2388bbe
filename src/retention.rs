//! Retention / Archiver (C8): ages rows out of the store, optionally
//! archiving them to dated JSON batches first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::error::CwResult;
use crate::model::MetricRow;
use crate::store::{MetricStore, RowFilter};

#[derive(Debug, Clone)]
pub struct Policy {
    pub retention_days: i64,
    pub archive_before_delete: bool,
    pub batch_size: usize,
    pub only_failed: bool,
}

impl Policy {
    pub fn basic() -> Self {
        Policy {
            retention_days: 30,
            archive_before_delete: true,
            batch_size: 500,
            only_failed: false,
        }
    }

    pub fn aggressive() -> Self {
        Policy {
            retention_days: 7,
            archive_before_delete: false,
            batch_size: 500,
            only_failed: false,
        }
    }

    pub fn emergency() -> Self {
        Policy {
            retention_days: 1,
            archive_before_delete: false,
            batch_size: 500,
            only_failed: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub cleaned: usize,
    pub archived: usize,
    pub cleanup_time_s: f64,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ArchiveSummary {
    date: String,
    batches: usize,
    rows: usize,
    policy_retention_days: i64,
}

pub struct Archiver {
    store: Arc<dyn MetricStore>,
    archive_dir: PathBuf,
    prune_after_days: i64,
}

impl Archiver {
    pub fn new(store: Arc<dyn MetricStore>, archive_dir: impl Into<PathBuf>, prune_after_days: i64) -> Self {
        Archiver {
            store,
            archive_dir: archive_dir.into(),
            prune_after_days,
        }
    }

    pub fn cleanup(&self, policy: &Policy) -> CwResult<CleanupStats> {
        let started = Instant::now();
        let cutoff = Utc::now() - ChronoDuration::days(policy.retention_days);
        let filter = RowFilter {
            target_id: None,
            before: Some(cutoff),
            collection_success: if policy.only_failed { Some(false) } else { None },
        };

        let mut errors = Vec::new();
        let mut archived = 0;

        if policy.archive_before_delete {
            let to_archive = self.store.scan_all_before(cutoff);
            match self.write_archive(&to_archive, policy.batch_size, cutoff, policy.retention_days) {
                Ok(n) => archived = n,
                Err(e) => errors.push(e.to_string()),
            }
        }

        let removed = self.store.delete_matching(&filter);

        Ok(CleanupStats {
            cleaned: removed.len(),
            archived,
            cleanup_time_s: started.elapsed().as_secs_f64(),
            errors,
        })
    }

    fn write_archive(
        &self,
        rows: &[MetricRow],
        batch_size: usize,
        cutoff: DateTime<Utc>,
        retention_days: i64,
    ) -> CwResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let dir = self.archive_dir.join(format!("metrics_{}", cutoff.format("%Y%m%d")));
        std::fs::create_dir_all(&dir)
            .map_err(|e| crate::error::CwError::Storage(format!("cannot create archive dir: {e}")))?;

        let mut batches = 0;
        for (i, chunk) in rows.chunks(batch_size.max(1)).enumerate() {
            let path = dir.join(format!("batch_{i:04}.json"));
            let json = serde_json::to_vec_pretty(chunk)
                .map_err(|e| crate::error::CwError::Storage(format!("cannot serialize archive batch: {e}")))?;
            std::fs::write(&path, json)
                .map_err(|e| crate::error::CwError::Storage(format!("cannot write archive batch: {e}")))?;
            batches += 1;
        }

        let summary = ArchiveSummary {
            date: cutoff.format("%Y%m%d").to_string(),
            batches,
            rows: rows.len(),
            policy_retention_days: retention_days,
        };
        let summary_path = dir.join("archive_summary.json");
        let json = serde_json::to_vec_pretty(&summary)
            .map_err(|e| crate::error::CwError::Storage(format!("cannot serialize archive summary: {e}")))?;
        std::fs::write(&summary_path, json)
            .map_err(|e| crate::error::CwError::Storage(format!("cannot write archive summary: {e}")))?;

        Ok(rows.len())
    }

    /// Deletes archive-directory trees whose `metrics_YYYYMMDD` date
    /// prefix is older than `prune_after_days`.
    pub fn prune_archives(&self) -> CwResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(self.prune_after_days);
        let mut pruned = 0;
        let entries = match std::fs::read_dir(&self.archive_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(crate::error::CwError::Storage(format!("cannot read archive dir: {e}"))),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(date_str) = name.strip_prefix("metrics_") {
                if let Some(dir_date) = parse_archive_date(date_str) {
                    if dir_date < cutoff {
                        let path: PathBuf = entry.path();
                        if std::fs::remove_dir_all(&path).is_ok() {
                            pruned += 1;
                        }
                    }
                }
            }
        }
        Ok(pruned)
    }
}

fn parse_archive_date(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDate::parse_from_str(s, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub db_size_bytes: u64,
    pub archive_size_bytes: u64,
}

/// Storage inspection. "DB size" is the in-memory store's estimated row
/// footprint, since there is no separate on-disk database file in this
/// implementation.
pub fn storage_info(store: &dyn MetricStore, archive_dir: &Path) -> StorageInfo {
    let db_size_bytes = store.estimated_bytes();
    let archive_size_bytes = dir_size(archive_dir);
    StorageInfo {
        total_bytes: 0,
        used_bytes: db_size_bytes + archive_size_bytes,
        free_bytes: 0,
        db_size_bytes,
        archive_size_bytes,
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_dir() {
                    total += dir_size(&entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn row(target_id: u64, timestamp: DateTime<Utc>, success: bool) -> MetricRow {
        MetricRow {
            target_id,
            timestamp,
            cpu_usage_percent: Some(10.0),
            load_avg_1: None,
            load_avg_5: None,
            load_avg_15: None,
            memory_usage_percent: Some(20.0),
            memory_used_mb: None,
            memory_total_mb: None,
            swap_usage_percent: None,
            disk_usage_percent: None,
            disk_used_gb: None,
            disk_total_gb: None,
            disk_read_bytes_per_s: None,
            disk_write_bytes_per_s: None,
            network_rx_bytes_per_s: None,
            network_tx_bytes_per_s: None,
            network_primary_interface: None,
            collection_success: success,
            error_message: None,
            collection_duration_ms: 1,
        }
    }

    #[test]
    fn cleanup_archives_and_deletes_rows_older_than_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let old = Utc::now() - ChronoDuration::days(60);
        let recent = Utc::now();
        store.insert_many(vec![row(1, old, true), row(1, recent, true)]);

        let archiver = Archiver::new(store.clone(), dir.path(), 90);
        let stats = archiver.cleanup(&Policy::basic()).unwrap();

        assert_eq!(stats.cleaned, 1);
        assert_eq!(stats.archived, 1);
        assert_eq!(store.row_count(), 1);

        let summary_path = dir
            .path()
            .join(format!("metrics_{}", (Utc::now() - ChronoDuration::days(30)).format("%Y%m%d")))
            .join("archive_summary.json");
        assert!(summary_path.exists());
    }

    #[test]
    fn emergency_policy_only_targets_failed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let old = Utc::now() - ChronoDuration::days(2);
        store.insert_many(vec![row(1, old, true), row(1, old, false)]);

        let archiver = Archiver::new(store.clone(), dir.path(), 90);
        let stats = archiver.cleanup(&Policy::emergency()).unwrap();

        assert_eq!(stats.cleaned, 1);
        assert_eq!(store.row_count(), 1);
        assert!(store.latest(1).unwrap().collection_success);
    }

    #[test]
    fn prune_archives_removes_directories_older_than_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let old_dir = dir.path().join("metrics_20200101");
        std::fs::create_dir_all(&old_dir).unwrap();
        let store = Arc::new(InMemoryStore::new());
        let archiver = Archiver::new(store, dir.path(), 90);
        let pruned = archiver.prune_archives().unwrap();
        assert_eq!(pruned, 1);
        assert!(!old_dir.exists());
    }
}
