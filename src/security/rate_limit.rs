//! Per-source-ip rate limiting and brute-force detection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SecurityConfig;

pub enum SourceDecision {
    Allowed,
    RateLimited { retry_after: Duration },
    Blocked { retry_after: Duration },
}

struct SourceState {
    connection_attempts: Vec<Instant>,
    auth_failures: Vec<Instant>,
    blocked_until: Option<Instant>,
}

impl SourceState {
    fn new() -> Self {
        SourceState {
            connection_attempts: Vec::new(),
            auth_failures: Vec::new(),
            blocked_until: None,
        }
    }
}

/// Token-bucket-ish rate limiter keyed by source ip, plus a brute-force
/// counter over authentication failures. All state lives in one mutex; the
/// gate is not expected to be a contention point relative to SSH I/O.
pub struct RateLimiter {
    state: Mutex<HashMap<String, SourceState>>,
    rate_limit_window: Duration,
    rate_limit_max: u32,
    brute_force_window: Duration,
    brute_force_max: u32,
    brute_force_block: Duration,
}

impl RateLimiter {
    pub fn new(cfg: &SecurityConfig) -> Self {
        RateLimiter {
            state: Mutex::new(HashMap::new()),
            rate_limit_window: Duration::from_secs(cfg.rate_limit_window_s),
            rate_limit_max: cfg.rate_limit_max,
            brute_force_window: Duration::from_secs(cfg.brute_force_window_s),
            brute_force_max: cfg.brute_force_max,
            brute_force_block: Duration::from_secs(cfg.brute_force_block_s),
        }
    }

    /// Checks and records one connection attempt from `source_ip`.
    pub fn check(&self, source_ip: &str) -> SourceDecision {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let entry = guard.entry(source_ip.to_string()).or_insert_with(SourceState::new);

        if let Some(until) = entry.blocked_until {
            if now < until {
                return SourceDecision::Blocked {
                    retry_after: until - now,
                };
            }
            entry.blocked_until = None;
        }

        entry
            .connection_attempts
            .retain(|&t| now.duration_since(t) < self.rate_limit_window);
        entry.connection_attempts.push(now);

        if entry.connection_attempts.len() as u32 > self.rate_limit_max {
            return SourceDecision::RateLimited {
                retry_after: self.rate_limit_window,
            };
        }

        SourceDecision::Allowed
    }

    /// Records one authentication failure; returns `true` iff this call
    /// trips the brute-force threshold and blocks the source.
    pub fn record_auth_failure(&self, source_ip: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let entry = guard.entry(source_ip.to_string()).or_insert_with(SourceState::new);

        entry
            .auth_failures
            .retain(|&t| now.duration_since(t) < self.brute_force_window);
        entry.auth_failures.push(now);

        if entry.auth_failures.len() as u32 >= self.brute_force_max {
            entry.blocked_until = Some(now + self.brute_force_block);
            true
        } else {
            false
        }
    }

    pub fn is_blocked(&self, source_ip: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .get(source_ip)
            .and_then(|s| s.blocked_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SecurityConfig {
        SecurityConfig {
            rate_limit_window_s: 60,
            rate_limit_max: 5,
            brute_force_window_s: 600,
            brute_force_max: 5,
            brute_force_block_s: 3600,
        }
    }

    #[test]
    fn allows_attempts_under_the_rate_limit() {
        let limiter = RateLimiter::new(&cfg());
        for _ in 0..5 {
            assert!(matches!(limiter.check("1.2.3.4"), SourceDecision::Allowed));
        }
    }

    #[test]
    fn rate_limits_past_the_threshold() {
        let limiter = RateLimiter::new(&cfg());
        for _ in 0..5 {
            limiter.check("1.2.3.4");
        }
        assert!(matches!(
            limiter.check("1.2.3.4"),
            SourceDecision::RateLimited { .. }
        ));
    }

    #[test]
    fn five_auth_failures_trip_brute_force_block() {
        let limiter = RateLimiter::new(&cfg());
        let mut tripped = false;
        for _ in 0..5 {
            tripped = limiter.record_auth_failure("9.9.9.9");
        }
        assert!(tripped);
        assert!(limiter.is_blocked("9.9.9.9"));
    }

    #[test]
    fn four_auth_failures_do_not_trip_brute_force_block() {
        let limiter = RateLimiter::new(&cfg());
        let mut tripped = false;
        for _ in 0..4 {
            tripped = limiter.record_auth_failure("9.9.9.8");
        }
        assert!(!tripped);
        assert!(!limiter.is_blocked("9.9.9.8"));
    }
}
