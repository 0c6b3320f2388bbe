use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alert level ordering is `Ok < Unknown < Warning < Critical`; aggregation
/// always takes the max, so a lone `Unknown` collector doesn't mask a real
/// `Critical` from a sibling collector but does outrank a calm `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Ok,
    Unknown,
    Warning,
    Critical,
}

impl Default for AlertLevel {
    fn default() -> Self {
        AlertLevel::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Network => "network",
        }
    }
}

/// In-memory, per-collector observation: the canonical shape published to
/// WebSocket subscribers and consumed by the normalizer. Fields are all
/// optional because a failed collector still produces a sample, just one
/// whose numeric fields are absent (never zero — see [`MetricRow`] doc).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub target_id: u64,
    pub success: bool,
    pub alert_level: AlertLevel,
    pub alert_message: Option<String>,
    pub fields: HashMap<String, f64>,
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for MetricKind {
    fn default() -> Self {
        MetricKind::Cpu
    }
}

impl MetricSample {
    pub fn failed(kind: MetricKind, target_id: u64, reason: impl Into<String>) -> Self {
        MetricSample {
            kind,
            target_id,
            success: false,
            alert_level: AlertLevel::Unknown,
            alert_message: Some(reason.into()),
            fields: HashMap::new(),
            extra: HashMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.fields.get(field).copied()
    }
}

/// One persisted time-series record. `collection_success=false` rows MAY
/// omit all numeric fields; a consumer must treat an absent field as
/// unknown, never coerce it to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub target_id: u64,
    pub timestamp: DateTime<Utc>,

    pub cpu_usage_percent: Option<f64>,
    pub load_avg_1: Option<f64>,
    pub load_avg_5: Option<f64>,
    pub load_avg_15: Option<f64>,

    pub memory_usage_percent: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub swap_usage_percent: Option<f64>,

    pub disk_usage_percent: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub disk_read_bytes_per_s: Option<f64>,
    pub disk_write_bytes_per_s: Option<f64>,

    pub network_rx_bytes_per_s: Option<f64>,
    pub network_tx_bytes_per_s: Option<f64>,
    pub network_primary_interface: Option<String>,

    pub collection_success: bool,
    pub error_message: Option<String>,
    pub collection_duration_ms: u64,
}

impl MetricRow {
    /// Overall alert level across the four grouped metric domains, given
    /// the same thresholds the collectors used (re-derived here so the
    /// aggregator and dashboard views don't need a live `MetricSample`).
    pub fn is_within_value_invariants(&self) -> bool {
        let pct_ok = |v: Option<f64>| v.map_or(true, |x| (0.0..=100.0).contains(&x));
        let nonneg = |v: Option<f64>| v.map_or(true, |x| x >= 0.0);
        pct_ok(self.cpu_usage_percent)
            && pct_ok(self.memory_usage_percent)
            && pct_ok(self.swap_usage_percent)
            && pct_ok(self.disk_usage_percent)
            && nonneg(self.memory_used_mb)
            && nonneg(self.memory_total_mb)
            && nonneg(self.disk_used_gb)
            && nonneg(self.disk_total_gb)
            && nonneg(self.disk_read_bytes_per_s)
            && nonneg(self.disk_write_bytes_per_s)
            && nonneg(self.network_rx_bytes_per_s)
            && nonneg(self.network_tx_bytes_per_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_level_ordering_matches_glossary() {
        assert!(AlertLevel::Ok < AlertLevel::Unknown);
        assert!(AlertLevel::Unknown < AlertLevel::Warning);
        assert!(AlertLevel::Warning < AlertLevel::Critical);
    }

    #[test]
    fn metric_row_round_trips_through_json() {
        let row = MetricRow {
            target_id: 7,
            timestamp: Utc::now(),
            cpu_usage_percent: Some(12.5),
            load_avg_1: Some(0.1),
            load_avg_5: Some(0.2),
            load_avg_15: Some(0.3),
            memory_usage_percent: Some(25.0),
            memory_used_mb: Some(2048.0),
            memory_total_mb: Some(8192.0),
            swap_usage_percent: Some(0.0),
            disk_usage_percent: Some(50.0),
            disk_used_gb: Some(250.0),
            disk_total_gb: Some(500.0),
            disk_read_bytes_per_s: Some(0.0),
            disk_write_bytes_per_s: Some(0.0),
            network_rx_bytes_per_s: Some(500.0),
            network_tx_bytes_per_s: Some(200.0),
            network_primary_interface: Some("eth0".into()),
            collection_success: true,
            error_message: None,
            collection_duration_ms: 120,
        };
        let json = serde_json::to_string(&row).unwrap();
        let back: MetricRow = serde_json::from_str(&json).unwrap();
        assert_eq!(row, back);
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        let mut row_json = serde_json::json!({
            "target_id": 1,
            "timestamp": Utc::now(),
            "cpu_usage_percent": 150.0,
            "load_avg_1": null, "load_avg_5": null, "load_avg_15": null,
            "memory_usage_percent": null, "memory_used_mb": null, "memory_total_mb": null,
            "swap_usage_percent": null,
            "disk_usage_percent": null, "disk_used_gb": null, "disk_total_gb": null,
            "disk_read_bytes_per_s": null, "disk_write_bytes_per_s": null,
            "network_rx_bytes_per_s": null, "network_tx_bytes_per_s": null,
            "network_primary_interface": null,
            "collection_success": true, "error_message": null, "collection_duration_ms": 0
        });
        let row: MetricRow = serde_json::from_value(row_json.take()).unwrap();
        assert!(!row.is_within_value_invariants());
    }
}
