//! Batch Writer (C6): the single writer standing between the push cycle
//! and the store. Buffers rows and flushes them in bulk either by count
//! or by elapsed time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::MetricRow;
use crate::store::MetricStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub storage_time_s: f64,
    pub errors: Vec<String>,
}

struct BufferState {
    rows: Vec<MetricRow>,
    last_flush: Instant,
}

/// Single-writer buffer. `add` can be called concurrently; `flush` is
/// single-flight because both operations serialize on the same lock.
pub struct BatchWriter {
    store: Arc<dyn MetricStore>,
    buffer: Mutex<BufferState>,
    batch_size: usize,
    flush_interval: Duration,
    pub flushes: AtomicU64,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn MetricStore>, batch_size: usize, flush_interval_s: u64) -> Self {
        BatchWriter {
            store,
            buffer: Mutex::new(BufferState {
                rows: Vec::new(),
                last_flush: Instant::now(),
            }),
            batch_size,
            flush_interval: Duration::from_secs(flush_interval_s),
            flushes: AtomicU64::new(0),
        }
    }

    /// Enqueues one row; triggers a flush if the buffer has reached
    /// `batch_size` or `flush_interval_s` has elapsed since the last one.
    pub fn add(&self, row: MetricRow) -> Option<FlushReport> {
        let should_flush = {
            let mut state = self.buffer.lock();
            state.rows.push(row);
            state.rows.len() >= self.batch_size || state.last_flush.elapsed() >= self.flush_interval
        };
        if should_flush {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().rows.len()
    }

    /// Atomically drains the buffer and performs one bulk insert. On
    /// insert failure, rows are dropped rather than re-enqueued, to avoid
    /// unbounded buffer growth under a persistently broken store.
    pub fn flush(&self) -> FlushReport {
        let started = Instant::now();
        let rows = {
            let mut state = self.buffer.lock();
            let rows = std::mem::take(&mut state.rows);
            state.last_flush = Instant::now();
            rows
        };

        let total = rows.len();
        if total == 0 {
            return FlushReport::default();
        }

        let mut seen = std::collections::HashSet::new();
        let mut duplicates = 0;
        let mut valid_rows = Vec::with_capacity(rows.len());
        let mut invalid = 0;
        let mut errors = Vec::new();

        for row in rows {
            let key = (row.target_id, row.timestamp);
            if !seen.insert(key) {
                duplicates += 1;
                continue;
            }
            if !row.is_within_value_invariants() {
                invalid += 1;
                errors.push(format!(
                    "target {} at {}: value out of range",
                    row.target_id, row.timestamp
                ));
                continue;
            }
            valid_rows.push(row);
        }

        // the in-memory store cannot itself fail; a future relational
        // backend behind `MetricStore` would need this insert wrapped in
        // a Result, with the same "never re-enqueue" contract on error.
        let inserted = self.store.insert_many(valid_rows);

        let report = FlushReport {
            total,
            valid: inserted,
            invalid,
            duplicates,
            storage_time_s: started.elapsed().as_secs_f64(),
            errors,
        };

        self.flushes.fetch_add(1, Ordering::Relaxed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn row(target_id: u64) -> MetricRow {
        MetricRow {
            target_id,
            timestamp: Utc::now(),
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
            collection_success: true,
            error_message: None,
            collection_duration_ms: 1,
        }
    }

    #[test]
    fn flush_is_noop_on_empty_buffer() {
        let writer = BatchWriter::new(Arc::new(InMemoryStore::new()), 100, 30);
        let report = writer.flush();
        assert_eq!(report.total, 0);
    }

    #[test]
    fn add_triggers_flush_at_batch_size() {
        let store = Arc::new(InMemoryStore::new());
        let writer = BatchWriter::new(store.clone(), 2, 3600);
        assert!(writer.add(row(1)).is_none());
        let report = writer.add(row(1)).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.valid, 2);
        assert_eq!(store.row_count(), 2);
    }

    #[test]
    fn invalid_rows_are_counted_and_excluded_from_insert() {
        let store = Arc::new(InMemoryStore::new());
        let writer = BatchWriter::new(store.clone(), 10, 3600);
        let mut bad = row(1);
        bad.cpu_usage_percent = Some(150.0);
        writer.add(bad);
        writer.add(row(1));
        let report = writer.flush();
        assert_eq!(report.invalid, 1);
        assert_eq!(report.valid, 1);
        assert_eq!(store.row_count(), 1);
    }
}
