//! Normalizer / Validator (C5): turns one push cycle's four
//! [`MetricSample`]s into a single persisted [`MetricRow`].

use chrono::Utc;

use crate::error::{CwError, CwResult};
use crate::model::{MetricKind, MetricRow, MetricSample};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

fn valid_percent(v: f64) -> Option<f64> {
    if (0.0..=100.0).contains(&v) {
        Some(v)
    } else {
        None
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn sample_of(samples: &[MetricSample], kind: MetricKind) -> Option<&MetricSample> {
    samples.iter().find(|s| s.kind == kind)
}

/// Folds one cycle's samples into a `MetricRow`. `target_id` must be
/// nonzero; a zero id is treated the same as a missing one since the data
/// model has no separate "unset" sentinel for a `u64`.
pub fn normalize(target_id: u64, samples: &[MetricSample], collection_duration_ms: u64) -> CwResult<MetricRow> {
    if target_id == 0 {
        return Err(CwError::Validation("missing target id".into()));
    }
    let timestamp = Utc::now();

    let cpu = sample_of(samples, MetricKind::Cpu);
    let memory = sample_of(samples, MetricKind::Memory);
    let disk = sample_of(samples, MetricKind::Disk);
    let network = sample_of(samples, MetricKind::Network);

    let collection_success = [cpu, memory, disk, network]
        .iter()
        .all(|s| s.map_or(false, |s| s.success));

    let mut error_parts = Vec::new();
    for s in [cpu, memory, disk, network].into_iter().flatten() {
        if let Some(msg) = &s.alert_message {
            if !msg.is_empty() {
                error_parts.push(format!("{}: {msg}", s.kind.as_str()));
            }
        }
    }
    let error_message = if error_parts.is_empty() {
        None
    } else {
        Some(error_parts.join("; "))
    };

    let row = MetricRow {
        target_id,
        timestamp,

        cpu_usage_percent: cpu.and_then(|s| s.get("usage_percent")).and_then(valid_percent),
        load_avg_1: cpu.and_then(|s| s.get("load_avg_1")),
        load_avg_5: cpu.and_then(|s| s.get("load_avg_5")),
        load_avg_15: cpu.and_then(|s| s.get("load_avg_15")),

        memory_usage_percent: memory.and_then(|s| s.get("usage_percent")).and_then(valid_percent),
        memory_used_mb: memory.and_then(|s| s.get("used_bytes")).map(|b| round2(b / BYTES_PER_MB)),
        memory_total_mb: memory.and_then(|s| s.get("total_bytes")).map(|b| round2(b / BYTES_PER_MB)),
        swap_usage_percent: memory
            .and_then(|s| s.get("swap_usage_percent"))
            .and_then(valid_percent),

        disk_usage_percent: disk.and_then(|s| s.get("usage_percent")).and_then(valid_percent),
        disk_used_gb: disk.and_then(|s| s.get("used_bytes")).map(|b| round2(b / BYTES_PER_GB)),
        disk_total_gb: disk.and_then(|s| s.get("total_bytes")).map(|b| round2(b / BYTES_PER_GB)),
        disk_read_bytes_per_s: disk.and_then(|s| s.get("read_bytes_per_s")),
        disk_write_bytes_per_s: disk.and_then(|s| s.get("write_bytes_per_s")),

        network_rx_bytes_per_s: network.and_then(|s| s.get("rx_bytes_per_s")),
        network_tx_bytes_per_s: network.and_then(|s| s.get("tx_bytes_per_s")),
        network_primary_interface: network
            .and_then(|s| s.extra.get("primary_interface"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),

        collection_success,
        error_message,
        collection_duration_ms,
    };

    Ok(row)
}

/// Overall alert level across the four collectors for a cycle, used by
/// the push service to derive the target's new status.
pub fn overall_alert_level(samples: &[MetricSample]) -> crate::model::AlertLevel {
    samples
        .iter()
        .map(|s| s.alert_level)
        .max()
        .unwrap_or(crate::model::AlertLevel::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertLevel;
    use std::collections::HashMap;

    fn sample(kind: MetricKind, fields: &[(&str, f64)], success: bool) -> MetricSample {
        let mut map = HashMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), *v);
        }
        MetricSample {
            kind,
            target_id: 1,
            success,
            alert_level: AlertLevel::Ok,
            alert_message: None,
            fields: map,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn rejects_zero_target_id() {
        assert!(normalize(0, &[], 0).is_err());
    }

    #[test]
    fn converts_bytes_to_mb_and_gb() {
        let samples = vec![
            sample(MetricKind::Memory, &[("used_bytes", 2.0 * BYTES_PER_MB), ("total_bytes", 8.0 * BYTES_PER_MB), ("usage_percent", 25.0)], true),
            sample(MetricKind::Disk, &[("used_bytes", 250.0 * BYTES_PER_GB), ("total_bytes", 500.0 * BYTES_PER_GB), ("usage_percent", 50.0)], true),
            sample(MetricKind::Cpu, &[("usage_percent", 10.0)], true),
            sample(MetricKind::Network, &[], true),
        ];
        let row = normalize(1, &samples, 120).unwrap();
        assert_eq!(row.memory_used_mb, Some(2.0));
        assert_eq!(row.disk_used_gb, Some(250.0));
        assert!(row.collection_success);
    }

    #[test]
    fn out_of_range_percentage_becomes_null_not_clipped() {
        let samples = vec![sample(MetricKind::Cpu, &[("usage_percent", 150.0)], true)];
        let row = normalize(1, &samples, 0).unwrap();
        assert_eq!(row.cpu_usage_percent, None);
    }

    #[test]
    fn collection_success_is_and_of_all_four() {
        let samples = vec![
            sample(MetricKind::Cpu, &[], true),
            sample(MetricKind::Memory, &[], true),
            sample(MetricKind::Disk, &[], false),
            sample(MetricKind::Network, &[], true),
        ];
        let row = normalize(1, &samples, 0).unwrap();
        assert!(!row.collection_success);
    }

    #[test]
    fn error_message_concatenates_tagged_collector_messages() {
        let mut disk = sample(MetricKind::Disk, &[], false);
        disk.alert_message = Some("failed to read disk capacity".into());
        let row = normalize(1, &[disk], 0).unwrap();
        assert_eq!(row.error_message.unwrap(), "disk: failed to read disk capacity");
    }
}
