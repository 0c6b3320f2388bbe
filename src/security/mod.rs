//! Security Gate (C2): command whitelist/veto/syntax checks plus
//! per-source connection rate limiting and brute-force detection.

mod command_check;
mod rate_limit;

pub use command_check::{check_command, CommandCheckResult};
pub use rate_limit::{RateLimiter, SourceDecision};

use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::model::{SecurityEvent, Severity};

/// Bounded ring buffer of [`SecurityEvent`]s, shared across the gate and
/// any consumer that wants a live tail of recent security activity.
pub struct SecurityLog {
    events: Mutex<VecDeque<SecurityEvent>>,
    cap: usize,
}

impl SecurityLog {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(SecurityLog {
            events: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        })
    }

    pub fn record(&self, event: SecurityEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.cap {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        let events = self.events.lock();
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.events.lock().iter().filter(|e| e.severity == severity).count()
    }
}

/// The Security Gate itself: owns the command checker (stateless) and the
/// per-source rate limiter (stateful), and records every decision.
pub struct SecurityGate {
    pub log: Arc<SecurityLog>,
    pub rate_limiter: RateLimiter,
}

impl SecurityGate {
    pub fn new(cfg: &crate::config::SecurityConfig) -> Self {
        SecurityGate {
            log: SecurityLog::new(1000),
            rate_limiter: RateLimiter::new(cfg),
        }
    }

    /// Gates a command before it ever reaches C1. Emits a `SecurityEvent`
    /// on both accept and reject.
    pub fn check_command(&self, command: &str, target_host: &str) -> CommandCheckResult {
        let result = check_command(command);
        let event = if result.allowed {
            SecurityEvent::new(
                crate::model::SecurityEventKind::CommandAllowed,
                Severity::Low,
            )
        } else {
            SecurityEvent::new(
                crate::model::SecurityEventKind::CommandBlocked,
                Severity::Medium,
            )
            .with_detail("reason", result.reason.clone().unwrap_or_default())
        }
        .with_target_host(target_host)
        .with_detail("command", command);
        self.log.record(event);
        result
    }

    /// Gates a connection attempt by source ip. Emits a `SecurityEvent` on
    /// rejection and on brute-force detection.
    pub fn check_connection(&self, source_ip: &str) -> SourceDecision {
        let decision = self.rate_limiter.check(source_ip);
        match &decision {
            SourceDecision::Allowed => {}
            SourceDecision::RateLimited { .. } => {
                self.log.record(
                    SecurityEvent::new(crate::model::SecurityEventKind::RateLimited, Severity::Medium)
                        .with_source_ip(source_ip),
                );
            }
            SourceDecision::Blocked { .. } => {
                self.log.record(
                    SecurityEvent::new(crate::model::SecurityEventKind::ConnectionRejected, Severity::High)
                        .with_source_ip(source_ip),
                );
            }
        }
        decision
    }

    /// Records one authentication failure from `source_ip`; if this trips
    /// the brute-force threshold, blocks the source and emits a critical
    /// `BruteForceDetected` event.
    pub fn record_auth_failure(&self, source_ip: &str) {
        if self.rate_limiter.record_auth_failure(source_ip) {
            self.log.record(
                SecurityEvent::new(
                    crate::model::SecurityEventKind::BruteForceDetected,
                    Severity::Critical,
                )
                .with_source_ip(source_ip)
                .with_detail("reason", "temporarily blocked"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_log_is_bounded() {
        let log = SecurityLog::new(3);
        for i in 0..10 {
            log.record(
                SecurityEvent::new(crate::model::SecurityEventKind::CommandAllowed, Severity::Low)
                    .with_detail("i", i.to_string()),
            );
        }
        assert_eq!(log.recent(100).len(), 3);
    }
}
