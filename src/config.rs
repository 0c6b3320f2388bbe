//! Startup configuration. Loaded once at process start from a TOML file
//! (default `cwatcher.toml`, overridable via `CWATCHER_CONFIG`); every key
//! carries the default from the external-interfaces table so a missing
//! file degrades to defaults rather than failing startup.

use serde::Deserialize;
use std::path::Path;

use crate::error::{CwError, CwResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_s: u64,
    pub command_timeout_s: u64,
    pub max_pool_per_target: usize,
    pub max_retries: u32,
    pub quarantine_s: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            connect_timeout_s: 10,
            command_timeout_s: 30,
            max_pool_per_target: 3,
            max_retries: 3,
            quarantine_s: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub interval_s_default: u64,
    pub tick_s: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        PushConfig {
            interval_s_default: 30,
            tick_s: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
    pub flush_interval_s: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            size: 100,
            flush_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ThresholdPair {
    pub warn: f64,
    pub crit: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub cpu: ThresholdPair,
    pub memory: ThresholdPair,
    pub disk: ThresholdPair,
    pub load: ThresholdPair,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        ThresholdsConfig {
            cpu: ThresholdPair { warn: 80.0, crit: 90.0 },
            memory: ThresholdPair { warn: 85.0, crit: 95.0 },
            disk: ThresholdPair { warn: 85.0, crit: 95.0 },
            load: ThresholdPair { warn: 5.0, crit: 10.0 },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub default_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig { default_days: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub dir: String,
    pub prune_after_days: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            dir: "archives".into(),
            prune_after_days: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limit_window_s: u64,
    pub rate_limit_max: u32,
    pub brute_force_window_s: u64,
    pub brute_force_max: u32,
    pub brute_force_block_s: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            rate_limit_window_s: 60,
            rate_limit_max: 5,
            brute_force_window_s: 600,
            brute_force_max: 5,
            brute_force_block_s: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            host: "0.0.0.0".into(),
            port: 7070,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".into() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ssh: SshConfig,
    pub push: PushConfig,
    pub batch: BatchConfig,
    pub thresholds: ThresholdsConfig,
    pub retention: RetentionConfig,
    pub archive: ArchiveConfig,
    pub security: SecurityConfig,
    pub hub: HubConfig,
    pub log: LogConfig,
}

impl Default for ThresholdPair {
    fn default() -> Self {
        ThresholdPair { warn: 0.0, crit: 0.0 }
    }
}

impl Config {
    /// Loads from `path`; a missing file is not an error — it simply
    /// yields all-defaults, matching the "missing ⇒ defaults only"
    /// contract.
    pub fn load(path: &Path) -> CwResult<Config> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| CwError::Validation(format!("invalid config at {:?}: {e}", path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(CwError::Validation(format!("cannot read config {:?}: {e}", path))),
        }
    }

    /// Resolves the config path from `CWATCHER_CONFIG`, falling back to
    /// `cwatcher.toml` in the current directory.
    pub fn load_from_env() -> CwResult<Config> {
        let path = std::env::var("CWATCHER_CONFIG").unwrap_or_else(|_| "cwatcher.toml".into());
        Config::load(Path::new(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/cwatcher.toml")).unwrap();
        assert_eq!(cfg.ssh.connect_timeout_s, 10);
        assert_eq!(cfg.batch.size, 100);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cwatcher.toml");
        std::fs::write(&path, "[batch]\nsize = 250\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.batch.size, 250);
        assert_eq!(cfg.batch.flush_interval_s, 30);
        assert_eq!(cfg.thresholds.cpu.warn, 80.0);
    }
}
