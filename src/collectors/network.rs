use std::time::Instant;

use dashmap::DashMap;

use crate::executor::parsers::NetDevSnapshot;
use crate::executor::{by_name, CommandExecutor, CommandStatus};
use crate::model::{AlertLevel, MetricKind, MetricSample};
use crate::ssh::ConnectConfig;

struct IfaceSnapshot {
    totals: NetDevSnapshot,
    at: Instant,
}

/// Network collector: `/proc/net/dev` drives the rate calculation;
/// `ip addr show` identifies the primary interface's address, `ss -s`
/// is collected for its summary counters but does not gate alerting.
pub struct NetworkCollector {
    previous: DashMap<u64, IfaceSnapshot>,
}

impl NetworkCollector {
    pub fn new() -> Self {
        NetworkCollector {
            previous: DashMap::new(),
        }
    }

    pub async fn collect(
        &self,
        executor: &CommandExecutor,
        cfg: &ConnectConfig,
        target_id: u64,
    ) -> MetricSample {
        let net_dev = by_name("net_dev");
        let ip_addr = by_name("ip_addr");
        let ss = by_name("ss_summary");

        let (net_dev_result, _ip_addr_result, _ss_result) = tokio::join!(
            executor.run_predefined(cfg, &net_dev, false),
            executor.run_predefined(cfg, &ip_addr, true),
            executor.run_predefined(cfg, &ss, false),
        );

        let mut sample = MetricSample {
            kind: MetricKind::Network,
            target_id,
            ..Default::default()
        };

        if net_dev_result.status != CommandStatus::Success {
            sample.success = false;
            sample.alert_level = AlertLevel::Unknown;
            sample.alert_message = Some("failed to read /proc/net/dev".into());
            return sample;
        }

        let devices = match &net_dev_result.parsed {
            Some(serde_json::Value::Object(devices)) => devices.clone(),
            _ => {
                sample.success = false;
                sample.alert_level = AlertLevel::Unknown;
                sample.alert_message = Some("could not parse /proc/net/dev output".into());
                return sample;
            }
        };

        // primary interface: non-loopback with the largest lifetime
        // traffic (rx_bytes + tx_bytes).
        let primary = devices
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .max_by(|(_, a), (_, b)| {
                let total = |v: &serde_json::Value| {
                    v.get("rx_bytes").and_then(|n| n.as_f64()).unwrap_or(0.0)
                        + v.get("tx_bytes").and_then(|n| n.as_f64()).unwrap_or(0.0)
                };
                total(a).partial_cmp(&total(b)).unwrap_or(std::cmp::Ordering::Equal)
            });

        sample.success = true;
        sample.alert_level = AlertLevel::Ok;

        let Some((primary_name, primary_value)) = primary else {
            sample.alert_level = AlertLevel::Unknown;
            sample.alert_message = Some("no non-loopback interface found".into());
            return sample;
        };

        sample
            .extra
            .insert("primary_interface".into(), serde_json::json!(primary_name));

        let current = NetDevSnapshot {
            rx_bytes: primary_value.get("rx_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
            tx_bytes: primary_value.get("tx_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
            ..Default::default()
        };

        let now = Instant::now();
        if let Some(prev) = self.previous.get(&target_id) {
            let elapsed = now.duration_since(prev.at).as_secs_f64();
            if elapsed > 0.0 {
                let rx_delta = current.rx_bytes.saturating_sub(prev.totals.rx_bytes);
                let tx_delta = current.tx_bytes.saturating_sub(prev.totals.tx_bytes);
                sample
                    .fields
                    .insert("rx_bytes_per_s".into(), rx_delta as f64 / elapsed);
                sample
                    .fields
                    .insert("tx_bytes_per_s".into(), tx_delta as f64 / elapsed);
            }
        }
        self.previous.insert(
            target_id,
            IfaceSnapshot {
                totals: current,
                at: now,
            },
        );

        sample
    }
}

impl Default for NetworkCollector {
    fn default() -> Self {
        Self::new()
    }
}
