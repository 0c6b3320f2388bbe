//! Wire protocol for the WebSocket Hub (C9): the message envelope, its
//! type tag, and the per-connection subscription filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AlertLevel, MetricKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    MonitoringUpdate,
    StatusChange,
    ServerOnline,
    ServerOffline,
    ConnectionInfo,
    SubscriptionAck,
    Heartbeat,
    Error,
}

/// `{type, data, message_id, timestamp}`, the one shape every message on
/// the wire takes regardless of direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: serde_json::Value,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageType, data: serde_json::Value) -> Self {
        Envelope {
            kind,
            data,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Inbound subscription request; `update_interval_s` is clamped into
/// `[10, 300]` rather than rejected outright, since a client supplying an
/// out-of-range value most likely just wants "as fast/slow as allowed".
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub target_ids: Option<Vec<u64>>,
    pub metric_kinds: Option<Vec<MetricKind>>,
    pub alert_levels: Option<Vec<AlertLevel>>,
    pub update_interval_s: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub target_ids: Option<std::collections::HashSet<u64>>,
    pub metric_kinds: Option<std::collections::HashSet<MetricKind>>,
    pub alert_levels: Option<std::collections::HashSet<AlertLevel>>,
    pub update_interval_s: u64,
}

impl SubscriptionFilter {
    pub fn from_request(req: &SubscribeRequest) -> Self {
        SubscriptionFilter {
            target_ids: req.target_ids.as_ref().map(|v| v.iter().copied().collect()),
            metric_kinds: req.metric_kinds.as_ref().map(|v| v.iter().copied().collect()),
            alert_levels: req.alert_levels.as_ref().map(|v| v.iter().copied().collect()),
            update_interval_s: req.update_interval_s.unwrap_or(30).clamp(10, 300),
        }
    }

    pub fn matches(&self, target_id: u64, kind: Option<MetricKind>, level: Option<AlertLevel>) -> bool {
        if let Some(ids) = &self.target_ids {
            if !ids.contains(&target_id) {
                return false;
            }
        }
        if let (Some(kinds), Some(kind)) = (&self.metric_kinds, kind) {
            if !kinds.contains(&kind) {
                return false;
            }
        }
        if let (Some(levels), Some(level)) = (&self.alert_levels, level) {
            if !levels.contains(&level) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_when_all_dimensions_pass() {
        let filter = SubscriptionFilter {
            target_ids: Some([1].into_iter().collect()),
            metric_kinds: Some([MetricKind::Cpu].into_iter().collect()),
            alert_levels: Some([AlertLevel::Warning, AlertLevel::Critical].into_iter().collect()),
            update_interval_s: 30,
        };
        assert!(filter.matches(1, Some(MetricKind::Cpu), Some(AlertLevel::Warning)));
        assert!(!filter.matches(1, Some(MetricKind::Cpu), Some(AlertLevel::Ok)));
        assert!(!filter.matches(2, Some(MetricKind::Cpu), Some(AlertLevel::Warning)));
    }

    #[test]
    fn unset_dimensions_always_match() {
        let filter = SubscriptionFilter {
            target_ids: None,
            metric_kinds: None,
            alert_levels: None,
            update_interval_s: 30,
        };
        assert!(filter.matches(42, Some(MetricKind::Disk), Some(AlertLevel::Critical)));
    }

    #[test]
    fn interval_is_clamped_into_allowed_range() {
        let req = SubscribeRequest {
            target_ids: None,
            metric_kinds: None,
            alert_levels: None,
            update_interval_s: Some(5),
        };
        let filter = SubscriptionFilter::from_request(&req);
        assert_eq!(filter.update_interval_s, 10);
    }
}
