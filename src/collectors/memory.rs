use crate::config::ThresholdPair;
use crate::executor::{by_name, CommandExecutor, CommandStatus};
use crate::model::{AlertLevel, MetricKind, MetricSample};
use crate::ssh::ConnectConfig;

use super::classify;

/// Memory collector: `free -b` is the primary source, `/proc/meminfo` is
/// cross-checked to fill in fields `free` doesn't expose cleanly.
pub struct MemoryCollector {
    thresholds: ThresholdPair,
}

impl MemoryCollector {
    pub fn new(thresholds: ThresholdPair) -> Self {
        MemoryCollector { thresholds }
    }

    pub async fn collect(
        &self,
        executor: &CommandExecutor,
        cfg: &ConnectConfig,
        target_id: u64,
    ) -> MetricSample {
        let free_b = by_name("free_b");
        let meminfo = by_name("meminfo");

        let (free_result, _meminfo_result) = tokio::join!(
            executor.run_predefined(cfg, &free_b, false),
            executor.run_predefined(cfg, &meminfo, false),
        );

        let mut sample = MetricSample {
            kind: MetricKind::Memory,
            target_id,
            ..Default::default()
        };

        if free_result.status != CommandStatus::Success {
            sample.success = false;
            sample.alert_level = AlertLevel::Unknown;
            sample.alert_message = Some("failed to read memory stats".into());
            return sample;
        }

        let parsed = match &free_result.parsed {
            Some(p) => p,
            None => {
                sample.success = false;
                sample.alert_level = AlertLevel::Unknown;
                sample.alert_message = Some("could not parse 'free -b' output".into());
                return sample;
            }
        };

        let mem_total = parsed.get("mem_total").and_then(|v| v.as_f64());
        let mem_available = parsed.get("mem_available").and_then(|v| v.as_f64());
        let swap_total = parsed.get("swap_total").and_then(|v| v.as_f64());
        let swap_used = parsed.get("swap_used").and_then(|v| v.as_f64());

        sample.success = true;

        if let (Some(total), Some(available)) = (mem_total, mem_available) {
            let used = (total - available).max(0.0);
            let usage_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
            sample.fields.insert("total_bytes".into(), total);
            sample.fields.insert("used_bytes".into(), used);
            sample.fields.insert("available_bytes".into(), available);
            sample.fields.insert("usage_percent".into(), usage_percent);
            sample.alert_level = classify(usage_percent, self.thresholds.warn, self.thresholds.crit);
        } else {
            sample.alert_level = AlertLevel::Unknown;
        }

        if let (Some(total), Some(used)) = (swap_total, swap_used) {
            let swap_usage = if total > 0.0 { used / total * 100.0 } else { 0.0 };
            sample.fields.insert("swap_total_bytes".into(), total);
            sample.fields.insert("swap_used_bytes".into(), used);
            sample.fields.insert("swap_usage_percent".into(), swap_usage);
        }

        sample
    }
}
