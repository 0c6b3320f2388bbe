use dashmap::DashMap;

use crate::config::ThresholdPair;
use crate::executor::parsers::CpuStatSnapshot;
use crate::executor::{by_name, CommandExecutor};
use crate::model::{AlertLevel, MetricKind, MetricSample};
use crate::ssh::ConnectConfig;

use super::classify;

/// CPU collector. Usage% is computed across two `/proc/stat` snapshots
/// kept per target id; the first call after process start has nothing to
/// diff against and reports `usage = 0`.
pub struct CpuCollector {
    previous: DashMap<u64, CpuStatSnapshot>,
    thresholds: ThresholdPair,
    load_thresholds: ThresholdPair,
}

impl CpuCollector {
    pub fn new(thresholds: ThresholdPair, load_thresholds: ThresholdPair) -> Self {
        CpuCollector {
            previous: DashMap::new(),
            thresholds,
            load_thresholds,
        }
    }

    pub async fn collect(
        &self,
        executor: &CommandExecutor,
        cfg: &ConnectConfig,
        target_id: u64,
    ) -> MetricSample {
        let proc_stat = by_name("proc_stat");
        let lscpu = by_name("lscpu");
        let loadavg = by_name("loadavg");
        let uptime = by_name("uptime");

        let (stat_result, lscpu_result, loadavg_result, uptime_result) = tokio::join!(
            executor.run_predefined(cfg, &proc_stat, false),
            executor.run_predefined(cfg, &lscpu, true),
            executor.run_predefined(cfg, &loadavg, false),
            executor.run_predefined(cfg, &uptime, false),
        );

        let mut sample = MetricSample {
            kind: MetricKind::Cpu,
            target_id,
            ..Default::default()
        };

        let snapshot = stat_result
            .parsed
            .as_ref()
            .and_then(|v| {
                Some(CpuStatSnapshot {
                    user: v.get("user")?.as_u64()?,
                    nice: v.get("nice")?.as_u64()?,
                    system: v.get("system")?.as_u64()?,
                    idle: v.get("idle")?.as_u64()?,
                    iowait: v.get("iowait")?.as_u64()?,
                    irq: v.get("irq")?.as_u64()?,
                    softirq: v.get("softirq")?.as_u64()?,
                    steal: v.get("steal")?.as_u64()?,
                })
            });

        match snapshot {
            Some(current) => {
                sample.success = true;
                let usage = match self.previous.get(&target_id) {
                    Some(prev) => {
                        let delta_total = current.total().saturating_sub(prev.total());
                        let delta_idle = current.idle.saturating_sub(prev.idle);
                        if delta_total == 0 {
                            0.0
                        } else {
                            let raw = (delta_total.saturating_sub(delta_idle)) as f64
                                / delta_total as f64
                                * 100.0;
                            raw.clamp(0.0, 100.0)
                        }
                    }
                    None => 0.0,
                };
                self.previous.insert(target_id, current);
                sample.fields.insert("usage_percent".into(), usage);
                sample.alert_level = classify(usage, self.thresholds.warn, self.thresholds.crit);
            }
            None => {
                sample.success = false;
                sample.alert_level = AlertLevel::Unknown;
                sample.alert_message = Some("failed to read /proc/stat".into());
            }
        }

        if loadavg_result.status == crate::executor::CommandStatus::Success {
            parse_loadavg_into(&loadavg_result.stdout, &mut sample);
        }

        if loadavg_result.status != crate::executor::CommandStatus::Success {
            sample.alert_level = sample.alert_level.max(AlertLevel::Unknown);
        } else if let Some(load1) = sample.fields.get("load_avg_1").copied() {
            let load_level = classify(load1, self.load_thresholds.warn, self.load_thresholds.crit);
            sample.alert_level = sample.alert_level.max(load_level);
        }

        if let Some(cores) = lscpu_result
            .parsed
            .as_ref()
            .and_then(|v| v.get("cores"))
            .and_then(|v| v.as_f64())
        {
            sample.fields.insert("cores".into(), cores);
        }

        if uptime_result.status != crate::executor::CommandStatus::Success
            && stat_result.status != crate::executor::CommandStatus::Success
        {
            sample.success = false;
        }

        sample
    }
}

fn parse_loadavg_into(raw: &str, sample: &mut MetricSample) {
    let parts: Vec<f64> = raw
        .split_whitespace()
        .take(3)
        .filter_map(|s| s.parse::<f64>().ok())
        .collect();
    if parts.len() == 3 {
        sample.fields.insert("load_avg_1".into(), parts[0]);
        sample.fields.insert("load_avg_5".into(), parts[1]);
        sample.fields.insert("load_avg_15".into(), parts[2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_without_snapshot_is_always_zero() {
        // exercised indirectly through the full collect() path in
        // executor integration tests; this guards the pure helper logic.
        let collector = CpuCollector::new(
            ThresholdPair { warn: 80.0, crit: 90.0 },
            ThresholdPair { warn: 5.0, crit: 10.0 },
        );
        assert!(collector.previous.is_empty());
    }
}
