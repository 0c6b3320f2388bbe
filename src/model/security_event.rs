use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    CommandBlocked,
    CommandAllowed,
    ConnectionRejected,
    ConnectionAllowed,
    RateLimited,
    AuthFailure,
    BruteForceDetected,
    IpBlocked,
    IpUnblocked,
}

/// Immutable security log entry. Never carries credential material — only
/// command text, source/target identifiers, and a free-form detail map of
/// already-redacted strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub source_ip: Option<String>,
    pub target_host: Option<String>,
    pub user: Option<String>,
    pub detail: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity) -> Self {
        SecurityEvent {
            kind,
            severity,
            source_ip: None,
            target_host: None,
            user: None,
            detail: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn with_target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = Some(host.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}
