//! In-Memory Store (C15): a `target_id`-sharded row index behind the
//! `MetricStore` trait. Favors the access patterns C6/C7/C8 actually need
//! — bulk insert at the tail, range scans bounded by target and time, bulk
//! delete by predicate — over being a general-purpose database.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::MetricRow;

/// A predicate used by C8 to select rows for archiving/deletion.
pub struct RowFilter {
    pub target_id: Option<u64>,
    pub before: Option<DateTime<Utc>>,
    pub collection_success: Option<bool>,
}

impl RowFilter {
    pub fn matches(&self, row: &MetricRow) -> bool {
        if let Some(id) = self.target_id {
            if row.target_id != id {
                return false;
            }
        }
        if let Some(before) = self.before {
            if row.timestamp >= before {
                return false;
            }
        }
        if let Some(success) = self.collection_success {
            if row.collection_success != success {
                return false;
            }
        }
        true
    }
}

/// Storage boundary C6 (insert), C7 (scan + aggregate), and C8 (scan +
/// delete) all depend on. A relational store is expected to sit behind
/// this same trait in a production deployment.
pub trait MetricStore: Send + Sync {
    fn insert_many(&self, rows: Vec<MetricRow>) -> usize;
    fn scan(&self, target_id: u64, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<MetricRow>;
    fn latest(&self, target_id: u64) -> Option<MetricRow>;
    /// Rows for every target older than `before`, used by the archiver to
    /// collect what it's about to delete.
    fn scan_all_before(&self, before: DateTime<Utc>) -> Vec<MetricRow>;
    fn delete_matching(&self, filter: &RowFilter) -> Vec<MetricRow>;
    fn row_count(&self) -> usize;
    /// Estimated in-memory footprint, used by storage inspection since
    /// there is no separate on-disk database file to stat.
    fn estimated_bytes(&self) -> u64;
}

const ROW_SIZE_ESTIMATE: u64 = 256;

/// Append-biased, per-target sharded implementation of [`MetricStore`].
/// Each shard's `Vec<MetricRow>` is kept sorted by timestamp because
/// inserts always append the newest rows for that target.
#[derive(Default)]
pub struct InMemoryStore {
    shards: RwLock<HashMap<u64, Vec<MetricRow>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            shards: RwLock::new(HashMap::new()),
        }
    }
}

impl MetricStore for InMemoryStore {
    fn insert_many(&self, rows: Vec<MetricRow>) -> usize {
        let mut shards = self.shards.write();
        let n = rows.len();
        for row in rows {
            shards.entry(row.target_id).or_default().push(row);
        }
        n
    }

    fn scan(&self, target_id: u64, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<MetricRow> {
        let shards = self.shards.read();
        match shards.get(&target_id) {
            Some(rows) => rows
                .iter()
                .filter(|r| r.timestamp >= from && r.timestamp <= to)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn latest(&self, target_id: u64) -> Option<MetricRow> {
        let shards = self.shards.read();
        shards.get(&target_id).and_then(|rows| rows.last().cloned())
    }

    fn scan_all_before(&self, before: DateTime<Utc>) -> Vec<MetricRow> {
        let shards = self.shards.read();
        shards
            .values()
            .flat_map(|rows| rows.iter().filter(|r| r.timestamp < before).cloned())
            .collect()
    }

    fn delete_matching(&self, filter: &RowFilter) -> Vec<MetricRow> {
        let mut shards = self.shards.write();
        let mut removed = Vec::new();
        let target_ids: Vec<u64> = match filter.target_id {
            Some(id) => vec![id],
            None => shards.keys().copied().collect(),
        };
        for id in target_ids {
            if let Some(rows) = shards.get_mut(&id) {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows.drain(..) {
                    if filter.matches(&row) {
                        removed.push(row);
                    } else {
                        kept.push(row);
                    }
                }
                *rows = kept;
            }
        }
        removed
    }

    fn row_count(&self) -> usize {
        self.shards.read().values().map(|v| v.len()).sum()
    }

    fn estimated_bytes(&self) -> u64 {
        self.row_count() as u64 * ROW_SIZE_ESTIMATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            collection_duration_ms: 5,
        }
    }

    #[test]
    fn scan_filters_by_target_and_window() {
        let store = InMemoryStore::new();
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let t1 = Utc::now() - chrono::Duration::hours(1);
        store.insert_many(vec![row(1, t0, true), row(1, t1, true), row(2, t1, true)]);
        let rows = store.scan(1, t0, t1);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn delete_matching_removes_only_matched_rows() {
        let store = InMemoryStore::new();
        let old = Utc::now() - chrono::Duration::days(40);
        let recent = Utc::now();
        store.insert_many(vec![row(1, old, true), row(1, recent, true)]);
        let removed = store.delete_matching(&RowFilter {
            target_id: Some(1),
            before: Some(Utc::now() - chrono::Duration::days(30)),
            collection_success: None,
        });
        assert_eq!(removed.len(), 1);
        assert_eq!(store.row_count(), 1);
        assert_eq!(store.latest(1).unwrap().timestamp, recent);
    }

    #[test]
    fn latest_returns_most_recently_inserted_row() {
        let store = InMemoryStore::new();
        let t0 = Utc::now() - chrono::Duration::minutes(5);
        let t1 = Utc::now();
        store.insert_many(vec![row(1, t0, true)]);
        store.insert_many(vec![row(1, t1, true)]);
        assert_eq!(store.latest(1).unwrap().timestamp, t1);
    }
}
