//! Command Executor (C3): runs a named predefined command or a validated
//! ad-hoc one, attaches a parser, and maintains a TTL cache.

pub mod parsers;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::SecurityGate;
use crate::ssh::{ConnectConfig, ConnectionPool, SshError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SystemInfo,
    Metrics,
    Hardware,
    Network,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failed,
    Timeout,
    SecurityBlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_s: f64,
    pub started_at: DateTime<Utc>,
    pub parsed: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
}

/// A parser turns raw stdout into a structured JSON value; a parse
/// failure (`Err`) never flips the command's status, it just falls back
/// to `{ "raw_output": stdout }`.
pub type Parser = fn(&str) -> Result<Value, String>;

#[derive(Clone)]
pub struct PredefinedCommand {
    pub name: &'static str,
    pub command: &'static str,
    pub kind: CommandKind,
    pub timeout: Duration,
    pub ttl: Duration,
    pub parser: Option<Parser>,
}

fn adapt_proc_stat(stdout: &str) -> Result<Value, String> {
    parsers::parse_proc_stat_cpu(stdout).map(|s| {
        serde_json::json!({
            "user": s.user, "nice": s.nice, "system": s.system, "idle": s.idle,
            "iowait": s.iowait, "irq": s.irq, "softirq": s.softirq, "steal": s.steal,
            "total": s.total(),
        })
    })
}

fn adapt_df_b1(stdout: &str) -> Result<Value, String> {
    parsers::parse_df_b1(stdout).map(|fses| {
        serde_json::json!(fses
            .into_iter()
            .map(|f| serde_json::json!({
                "device": f.device, "mount_point": f.mount_point,
                "total_bytes": f.total_bytes, "used_bytes": f.used_bytes, "available_bytes": f.available_bytes,
            }))
            .collect::<Vec<_>>())
    })
}

fn adapt_diskstats(stdout: &str) -> Result<Value, String> {
    parsers::parse_proc_diskstats(stdout).map(|m| {
        let obj: serde_json::Map<String, Value> = m
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    serde_json::json!({
                        "reads_completed": v.reads_completed, "sectors_read": v.sectors_read,
                        "writes_completed": v.writes_completed, "sectors_written": v.sectors_written,
                        "io_time_ms": v.io_time_ms,
                    }),
                )
            })
            .collect();
        Value::Object(obj)
    })
}

fn adapt_net_dev(stdout: &str) -> Result<Value, String> {
    parsers::parse_proc_net_dev(stdout).map(|m| {
        let obj: serde_json::Map<String, Value> = m
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    serde_json::json!({
                        "rx_bytes": v.rx_bytes, "rx_packets": v.rx_packets,
                        "rx_errors": v.rx_errors, "rx_dropped": v.rx_dropped,
                        "tx_bytes": v.tx_bytes, "tx_packets": v.tx_packets,
                        "tx_errors": v.tx_errors, "tx_dropped": v.tx_dropped,
                    }),
                )
            })
            .collect();
        Value::Object(obj)
    })
}

fn adapt_ip_addr(stdout: &str) -> Result<Value, String> {
    parsers::parse_ip_addr(stdout).map(|ifaces| {
        serde_json::json!(ifaces
            .into_iter()
            .map(|i| serde_json::json!({
                "name": i.name, "state": i.state, "mtu": i.mtu,
                "addrs": i.addrs.into_iter().map(|a| serde_json::json!({
                    "family": a.family, "address": a.address, "scope": a.scope,
                })).collect::<Vec<_>>(),
            }))
            .collect::<Vec<_>>())
    })
}

/// The closed set of predefined commands this codebase knows how to run
/// and parse. Ad-hoc commands (validated by the security gate the same
/// way) carry no parser.
pub fn registry() -> Vec<PredefinedCommand> {
    vec![
        PredefinedCommand {
            name: "uptime",
            command: "uptime",
            kind: CommandKind::SystemInfo,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: Some(parsers::parse_uptime),
        },
        PredefinedCommand {
            name: "free_b",
            command: "free -b",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: Some(parsers::parse_free_b),
        },
        PredefinedCommand {
            name: "meminfo",
            command: "cat /proc/meminfo",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: Some(parsers::parse_meminfo),
        },
        PredefinedCommand {
            name: "proc_stat",
            command: "cat /proc/stat",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: Some(adapt_proc_stat),
        },
        PredefinedCommand {
            name: "df_b1",
            command: "df -B1",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(15),
            ttl: Duration::from_secs(0),
            parser: Some(adapt_df_b1),
        },
        PredefinedCommand {
            name: "diskstats",
            command: "cat /proc/diskstats",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: Some(adapt_diskstats),
        },
        PredefinedCommand {
            name: "net_dev",
            command: "cat /proc/net/dev",
            kind: CommandKind::Network,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: Some(adapt_net_dev),
        },
        PredefinedCommand {
            name: "lscpu",
            command: "lscpu",
            kind: CommandKind::Hardware,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(300),
            parser: Some(parsers::parse_lscpu),
        },
        PredefinedCommand {
            name: "ip_addr",
            command: "ip addr",
            kind: CommandKind::Network,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(60),
            parser: Some(adapt_ip_addr),
        },
        PredefinedCommand {
            name: "hostname",
            command: "hostname",
            kind: CommandKind::SystemInfo,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(300),
            parser: None,
        },
        PredefinedCommand {
            name: "uname",
            command: "uname -srm",
            kind: CommandKind::SystemInfo,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(300),
            parser: None,
        },
        PredefinedCommand {
            name: "loadavg",
            command: "cat /proc/loadavg",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: None,
        },
        PredefinedCommand {
            name: "lsblk",
            command: "lsblk",
            kind: CommandKind::Hardware,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(300),
            parser: None,
        },
        PredefinedCommand {
            name: "iostat",
            command: "iostat -x 1 1",
            kind: CommandKind::Metrics,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: None,
        },
        PredefinedCommand {
            name: "ss_summary",
            command: "ss -s",
            kind: CommandKind::Network,
            timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(0),
            parser: None,
        },
    ]
}

/// Looks up one predefined command by its registry name; panics on an
/// unknown name since the set of names used by the collectors is fixed
/// and known at compile time.
pub fn by_name(name: &str) -> PredefinedCommand {
    registry()
        .into_iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("no predefined command named '{name}'"))
}

#[derive(Default)]
pub struct ExecutorCounters {
    pub success: AtomicU64,
    pub failed: AtomicU64,
    pub timeout: AtomicU64,
    pub security_blocked: AtomicU64,
    pub cache_hit: AtomicU64,
}

struct CacheEntry {
    result: CommandResult,
    created: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }
}

/// Owns the predefined-command registry, the TTL cache, and per-outcome
/// counters. Stateless across targets except for the cache, which is
/// keyed by `(target pool key, command text)`.
pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    gate: Arc<SecurityGate>,
    cache: DashMap<u64, CacheEntry>,
    pub counters: ExecutorCounters,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>, gate: Arc<SecurityGate>) -> Self {
        CommandExecutor {
            pool,
            gate,
            cache: DashMap::new(),
            counters: ExecutorCounters::default(),
        }
    }

    fn cache_key(cfg: &ConnectConfig, command: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        cfg.pool_key().hash(&mut hasher);
        command.hash(&mut hasher);
        hasher.finish()
    }

    pub async fn execute(
        &self,
        cfg: &ConnectConfig,
        command: &str,
        kind: CommandKind,
        timeout: Option<Duration>,
        ttl: Duration,
        parser: Option<Parser>,
        use_cache: bool,
    ) -> CommandResult {
        let check = self.gate.check_command(command, &cfg.host);
        if !check.allowed {
            self.counters.security_blocked.fetch_add(1, Ordering::Relaxed);
            return CommandResult {
                command: command.to_string(),
                kind,
                status: CommandStatus::SecurityBlocked,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: -1,
                duration_s: 0.0,
                started_at: Utc::now(),
                parsed: None,
                error: check.reason,
                from_cache: false,
            };
        }

        let key = Self::cache_key(cfg, command);
        if use_cache && !ttl.is_zero() {
            if let Some(entry) = self.cache.get(&key) {
                if !entry.is_expired() {
                    self.counters.cache_hit.fetch_add(1, Ordering::Relaxed);
                    let mut result = entry.result.clone();
                    result.from_cache = true;
                    return result;
                }
            }
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let effective_timeout = timeout.unwrap_or(cfg.command_timeout);
        let outcome = self.pool.execute(cfg, command, effective_timeout).await;
        let duration_s = started.elapsed().as_secs_f64();

        let mut result = match outcome {
            Ok((stdout, stderr, exit_code)) if exit_code == 0 => {
                self.counters.success.fetch_add(1, Ordering::Relaxed);
                let parsed = parser.and_then(|p| match p(&stdout) {
                    Ok(v) => Some(v),
                    Err(_) => Some(serde_json::json!({ "raw_output": stdout })),
                });
                CommandResult {
                    command: command.to_string(),
                    kind,
                    status: CommandStatus::Success,
                    stdout,
                    stderr,
                    exit_code,
                    duration_s,
                    started_at,
                    parsed,
                    error: None,
                    from_cache: false,
                }
            }
            Ok((stdout, stderr, exit_code)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                CommandResult {
                    command: command.to_string(),
                    kind,
                    status: CommandStatus::Failed,
                    stdout,
                    stderr: stderr.clone(),
                    exit_code,
                    duration_s,
                    started_at,
                    parsed: None,
                    error: Some(stderr),
                    from_cache: false,
                }
            }
            Err(SshError::Timeout(_)) => {
                self.counters.timeout.fetch_add(1, Ordering::Relaxed);
                CommandResult {
                    command: command.to_string(),
                    kind,
                    status: CommandStatus::Timeout,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    duration_s,
                    started_at,
                    parsed: None,
                    error: Some("command timed out".into()),
                    from_cache: false,
                }
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                CommandResult {
                    command: command.to_string(),
                    kind,
                    status: CommandStatus::Failed,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    duration_s,
                    started_at,
                    parsed: None,
                    error: Some(e.to_string()),
                    from_cache: false,
                }
            }
        };

        if result.status == CommandStatus::Success && !ttl.is_zero() {
            self.cache.insert(
                key,
                CacheEntry {
                    result: result.clone(),
                    created: Instant::now(),
                    ttl,
                },
            );
        }
        result.from_cache = false;
        result
    }

    pub async fn run_predefined(
        &self,
        cfg: &ConnectConfig,
        predefined: &PredefinedCommand,
        use_cache: bool,
    ) -> CommandResult {
        self.execute(
            cfg,
            predefined.command,
            predefined.kind,
            Some(predefined.timeout),
            predefined.ttl,
            predefined.parser,
            use_cache,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::security::SecurityGate;
    use crate::ssh::{Dialer, SshTransport};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct ScriptedTransport {
        responses: Vec<(String, String, i32)>,
        call: AtomicU32,
    }

    #[async_trait]
    impl SshTransport for ScriptedTransport {
        async fn exec(&self, _command: &str, _timeout: Duration) -> Result<(String, String, i32), SshError> {
            let i = self.call.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self
                .responses
                .get(i.min(self.responses.len() - 1))
                .cloned()
                .unwrap())
        }
        async fn probe(&self, _timeout: Duration) -> Result<(), SshError> {
            Ok(())
        }
    }

    struct ScriptedDialer(Vec<(String, String, i32)>);

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, _cfg: &ConnectConfig) -> Result<Arc<dyn SshTransport>, SshError> {
            Ok(Arc::new(ScriptedTransport {
                responses: self.0.clone(),
                call: AtomicU32::new(0),
            }))
        }
    }

    fn cfg() -> ConnectConfig {
        ConnectConfig {
            host: "10.0.0.9".into(),
            port: 22,
            user: "ops".into(),
            password: Some("x".into()),
            private_key_pem: None,
            key_passphrase: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            pool_cap: 2,
        }
    }

    fn executor_with(responses: Vec<(&str, &str, i32)>) -> CommandExecutor {
        let dialer = Arc::new(ScriptedDialer(
            responses
                .into_iter()
                .map(|(o, e, c)| (o.to_string(), e.to_string(), c))
                .collect(),
        ));
        let pool = Arc::new(ConnectionPool::new(dialer, 3, Duration::from_secs(600)));
        let gate = Arc::new(SecurityGate::new(&SecurityConfig {
            rate_limit_window_s: 60,
            rate_limit_max: 5,
            brute_force_window_s: 600,
            brute_force_max: 5,
            brute_force_block_s: 3600,
        }));
        CommandExecutor::new(pool, gate)
    }

    #[tokio::test]
    async fn blocks_non_whitelisted_command_before_dialing() {
        let executor = executor_with(vec![("should not run", "", 0)]);
        let result = executor
            .execute(
                &cfg(),
                "rm -rf /",
                CommandKind::SystemInfo,
                None,
                Duration::from_secs(0),
                None,
                false,
            )
            .await;
        assert_eq!(result.status, CommandStatus::SecurityBlocked);
        assert_eq!(executor.counters.security_blocked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_command_is_parsed() {
        let executor = executor_with(vec![(
            " 10:03:23 up 4 days, load average: 0.10, 0.05, 0.01",
            "",
            0,
        )]);
        let result = executor
            .execute(
                &cfg(),
                "uptime",
                CommandKind::SystemInfo,
                None,
                Duration::from_secs(0),
                Some(parsers::parse_uptime),
                false,
            )
            .await;
        assert_eq!(result.status, CommandStatus::Success);
        assert!(result.parsed.is_some());
    }

    #[tokio::test]
    async fn cache_hit_within_ttl_increments_counter_once() {
        let executor = executor_with(vec![("cached-output", "", 0)]);
        let ttl = Duration::from_secs(60);
        let first = executor
            .execute(&cfg(), "hostname", CommandKind::SystemInfo, None, ttl, None, true)
            .await;
        assert!(!first.from_cache);
        let second = executor
            .execute(&cfg(), "hostname", CommandKind::SystemInfo, None, ttl, None, true)
            .await;
        assert!(second.from_cache);
        assert_eq!(executor.counters.cache_hit.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parser_failure_falls_back_to_raw_output_without_failing_status() {
        fn always_fails(_s: &str) -> Result<Value, String> {
            Err("boom".into())
        }
        let executor = executor_with(vec![("some output", "", 0)]);
        let result = executor
            .execute(
                &cfg(),
                "uptime",
                CommandKind::SystemInfo,
                None,
                Duration::from_secs(0),
                Some(always_fails),
                false,
            )
            .await;
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(result.parsed.unwrap()["raw_output"], "some output");
    }
}
