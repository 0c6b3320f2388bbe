use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slowly-changing description of a [`crate::model::Target`]; replaced
/// whole on each refresh rather than merged field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub target_id: u64,
    pub hostname: Option<String>,
    pub kernel: Option<String>,
    pub os_distribution: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_total_mb: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub primary_interface: Option<String>,
    pub primary_ip: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub collected_at: DateTime<Utc>,
}

impl SystemInfo {
    pub fn empty(target_id: u64, collected_at: DateTime<Utc>) -> Self {
        SystemInfo {
            target_id,
            hostname: None,
            kernel: None,
            os_distribution: None,
            cpu_model: None,
            cpu_cores: None,
            memory_total_mb: None,
            disk_total_gb: None,
            primary_interface: None,
            primary_ip: None,
            uptime_seconds: None,
            collected_at,
        }
    }
}
