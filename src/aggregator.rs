//! Aggregator (C7): read-side queries for dashboards — bucketed time
//! series, the at-a-glance dashboard snapshot, and long-range summaries.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::MetricRow;
use crate::store::MetricStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Range {
    OneHour,
    SixHours,
    TwentyFourHours,
    SevenDays,
    ThirtyDays,
}

impl Range {
    fn bucket_minutes(self) -> i64 {
        match self {
            Range::OneHour => 1,
            Range::SixHours => 5,
            Range::TwentyFourHours => 15,
            Range::SevenDays => 60,
            Range::ThirtyDays => 240,
        }
    }

    fn point_cap(self) -> usize {
        match self {
            Range::OneHour => 60,
            Range::SixHours => 72,
            Range::TwentyFourHours => 96,
            Range::SevenDays => 168,
            Range::ThirtyDays => 180,
        }
    }

    fn span(self) -> ChronoDuration {
        match self {
            Range::OneHour => ChronoDuration::hours(1),
            Range::SixHours => ChronoDuration::hours(6),
            Range::TwentyFourHours => ChronoDuration::hours(24),
            Range::SevenDays => ChronoDuration::days(7),
            Range::ThirtyDays => ChronoDuration::days(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agg {
    Avg,
    Max,
    Min,
    Sum,
    Count,
    P95,
}

fn aggregate(values: &[f64], agg: Agg) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match agg {
        Agg::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Agg::Max => values.iter().cloned().fold(f64::MIN, f64::max),
        Agg::Min => values.iter().cloned().fold(f64::MAX, f64::min),
        Agg::Sum => values.iter().sum(),
        Agg::Count => values.len() as f64,
        Agg::P95 => percentile(values, 95.0),
    }
}

/// Linear-interpolation percentile over a value set sorted ascending.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartSummary {
    pub current: Option<f64>,
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub p95: f64,
    pub samples: usize,
    pub trend: Trend,
}

#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub t: DateTime<Utc>,
    pub v: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartData {
    pub field: String,
    pub range: Range,
    pub unit: String,
    pub points: Vec<Point>,
    pub summary: ChartSummary,
}

fn field_value(row: &MetricRow, field: &str) -> Option<f64> {
    match field {
        "cpu_usage_percent" => row.cpu_usage_percent,
        "load_avg_1" => row.load_avg_1,
        "load_avg_5" => row.load_avg_5,
        "load_avg_15" => row.load_avg_15,
        "memory_usage_percent" => row.memory_usage_percent,
        "memory_used_mb" => row.memory_used_mb,
        "memory_total_mb" => row.memory_total_mb,
        "swap_usage_percent" => row.swap_usage_percent,
        "disk_usage_percent" => row.disk_usage_percent,
        "disk_used_gb" => row.disk_used_gb,
        "disk_total_gb" => row.disk_total_gb,
        "disk_read_bytes_per_s" => row.disk_read_bytes_per_s,
        "disk_write_bytes_per_s" => row.disk_write_bytes_per_s,
        "network_rx_bytes_per_s" => row.network_rx_bytes_per_s,
        "network_tx_bytes_per_s" => row.network_tx_bytes_per_s,
        _ => None,
    }
}

fn field_unit(field: &str) -> &'static str {
    match field {
        "cpu_usage_percent" | "memory_usage_percent" | "swap_usage_percent" | "disk_usage_percent" => "percent",
        "memory_used_mb" | "memory_total_mb" => "mb",
        "disk_used_gb" | "disk_total_gb" => "gb",
        "disk_read_bytes_per_s" | "disk_write_bytes_per_s" | "network_rx_bytes_per_s" | "network_tx_bytes_per_s" => {
            "bytes_per_s"
        }
        _ => "",
    }
}

fn floor_to_bucket(t: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let epoch_minutes = t.timestamp() / 60;
    let floored = (epoch_minutes / minutes) * minutes;
    DateTime::from_timestamp(floored * 60, 0).unwrap_or(t)
}

fn trend(values: &[f64]) -> Trend {
    if values.len() < 4 {
        return Trend {
            direction: TrendDirection::Stable,
            percent: 0.0,
        };
    }
    let quarter = (values.len() as f64 * 0.25).ceil() as usize;
    let quarter = quarter.max(1);
    let first_mean = values[..quarter].iter().sum::<f64>() / quarter as f64;
    let last_mean = values[values.len() - quarter..].iter().sum::<f64>() / quarter as f64;
    if first_mean == 0.0 {
        return Trend {
            direction: TrendDirection::Stable,
            percent: 0.0,
        };
    }
    let percent = (last_mean - first_mean) / first_mean.abs() * 100.0;
    let direction = if percent.abs() < 5.0 {
        TrendDirection::Stable
    } else if percent > 0.0 {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    };
    Trend { direction, percent }
}

pub struct Aggregator {
    store: Arc<dyn MetricStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Aggregator { store }
    }

    pub fn series(&self, target_id: u64, field: &str, range: Range, agg: Agg) -> ChartData {
        let to = Utc::now();
        let from = to - range.span();
        let rows = self.store.scan(target_id, from, to);

        let minutes = range.bucket_minutes();
        let mut buckets: std::collections::BTreeMap<DateTime<Utc>, Vec<f64>> = std::collections::BTreeMap::new();
        for row in &rows {
            if let Some(v) = field_value(row, field) {
                let key = floor_to_bucket(row.timestamp, minutes);
                buckets.entry(key).or_default().push(v);
            }
        }

        let cap = range.point_cap();
        let mut points: Vec<Point> = buckets
            .into_iter()
            .map(|(t, values)| Point {
                t,
                v: aggregate(&values, agg),
            })
            .collect();
        if points.len() > cap {
            let skip = points.len() - cap;
            points.drain(0..skip);
        }

        let all_values: Vec<f64> = rows.iter().filter_map(|r| field_value(r, field)).collect();
        let summary = ChartSummary {
            current: rows.last().and_then(|r| field_value(r, field)),
            avg: aggregate(&all_values, Agg::Avg),
            max: aggregate(&all_values, Agg::Max),
            min: aggregate(&all_values, Agg::Min),
            p95: percentile(&all_values, 95.0),
            samples: all_values.len(),
            trend: trend(&points.iter().map(|p| p.v).collect::<Vec<_>>()),
        };

        ChartData {
            field: field.to_string(),
            range,
            unit: field_unit(field).to_string(),
            points,
            summary,
        }
    }

    pub fn dashboard(&self, target_id: u64, range: Range) -> Dashboard {
        let latest = self.store.latest(target_id);
        let status = match &latest {
            None => DashboardStatus::Unknown,
            Some(row) => {
                let cpu = row.cpu_usage_percent.unwrap_or(0.0);
                let mem = row.memory_usage_percent.unwrap_or(0.0);
                let disk = row.disk_usage_percent.unwrap_or(0.0);
                if cpu >= 90.0 || mem >= 95.0 || disk >= 95.0 {
                    DashboardStatus::Critical
                } else if cpu >= 80.0 || mem >= 85.0 || disk >= 90.0 {
                    DashboardStatus::Warning
                } else {
                    DashboardStatus::Normal
                }
            }
        };

        let current_values = latest.clone();

        Dashboard {
            target_id,
            range,
            timestamp: Utc::now(),
            cpu: self.series(target_id, "cpu_usage_percent", range, Agg::Avg),
            memory: self.series(target_id, "memory_usage_percent", range, Agg::Avg),
            disk: self.series(target_id, "disk_usage_percent", range, Agg::Avg),
            current_values,
            status,
        }
    }

    pub fn summary(&self, target_id: u64, from: DateTime<Utc>, to: DateTime<Utc>) -> crate::error::CwResult<RangeSummary> {
        let cap = ChronoDuration::days(365);
        if to - from > cap {
            return Err(crate::error::CwError::Validation(
                "summary range exceeds the 1-year query cap".into(),
            ));
        }
        let rows = self.store.scan(target_id, from, to);
        let cpu: Vec<f64> = rows.iter().filter_map(|r| r.cpu_usage_percent).collect();
        let mem: Vec<f64> = rows.iter().filter_map(|r| r.memory_usage_percent).collect();
        let disk: Vec<f64> = rows.iter().filter_map(|r| r.disk_usage_percent).collect();
        Ok(RangeSummary {
            samples: rows.len(),
            averages: Triple {
                cpu: aggregate(&cpu, Agg::Avg),
                memory: aggregate(&mem, Agg::Avg),
                disk: aggregate(&disk, Agg::Avg),
            },
            peaks: Triple {
                cpu: aggregate(&cpu, Agg::Max),
                memory: aggregate(&mem, Agg::Max),
                disk: aggregate(&disk, Agg::Max),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardStatus {
    Normal,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub target_id: u64,
    pub range: Range,
    pub timestamp: DateTime<Utc>,
    pub cpu: ChartData,
    pub memory: ChartData,
    pub disk: ChartData,
    pub current_values: Option<MetricRow>,
    pub status: DashboardStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Triple {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeSummary {
    pub samples: usize,
    pub averages: Triple,
    pub peaks: Triple,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn row_at(t: DateTime<Utc>, cpu: f64) -> MetricRow {
        MetricRow {
            target_id: 1,
            timestamp: t,
            cpu_usage_percent: Some(cpu),
            load_avg_1: None,
            load_avg_5: None,
            load_avg_15: None,
            memory_usage_percent: Some(30.0),
            memory_used_mb: None,
            memory_total_mb: None,
            swap_usage_percent: None,
            disk_usage_percent: Some(40.0),
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
    fn percentile_linear_interpolation_matches_known_values() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 100.0), 40.0);
        assert_eq!(percentile(&values, 50.0), 25.0);
    }

    #[test]
    fn series_point_count_never_exceeds_range_cap() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let rows: Vec<MetricRow> = (0..200)
            .map(|i| row_at(now - ChronoDuration::minutes(i), 50.0))
            .collect();
        store.insert_many(rows);
        let agg = Aggregator::new(store);
        let chart = agg.series(1, "cpu_usage_percent", Range::OneHour, Agg::Avg);
        assert!(chart.points.len() <= Range::OneHour.point_cap());
    }

    #[test]
    fn dashboard_status_reflects_critical_thresholds() {
        let store = Arc::new(InMemoryStore::new());
        let mut r = row_at(Utc::now(), 95.0);
        r.memory_usage_percent = Some(10.0);
        r.disk_usage_percent = Some(10.0);
        store.insert_many(vec![r]);
        let agg = Aggregator::new(store);
        let dash = agg.dashboard(1, Range::OneHour);
        assert_eq!(dash.status, DashboardStatus::Critical);
    }

    #[test]
    fn dashboard_status_unknown_when_no_data() {
        let store = Arc::new(InMemoryStore::new());
        let agg = Aggregator::new(store);
        let dash = agg.dashboard(1, Range::OneHour);
        assert_eq!(dash.status, DashboardStatus::Unknown);
    }

    #[test]
    fn summary_rejects_ranges_beyond_one_year() {
        let store = Arc::new(InMemoryStore::new());
        let agg = Aggregator::new(store);
        let to = Utc::now();
        let from = to - ChronoDuration::days(400);
        assert!(agg.summary(1, from, to).is_err());
    }
}
