use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current connectivity/health status of a [`Target`], as last observed by
/// the push loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Online,
    Offline,
    Warning,
    Error,
    Unknown,
}

impl Default for TargetStatus {
    fn default() -> Self {
        TargetStatus::Unknown
    }
}

/// Sealed authentication material for a [`Target`]. At least one of
/// `password` or `private_key` must be present; never holds plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMaterial {
    /// AES-256-GCM sealed password, if configured.
    pub sealed_password: Option<Vec<u8>>,
    /// AES-256-GCM sealed private key (PEM bytes), if configured.
    pub sealed_private_key: Option<Vec<u8>>,
    /// AES-256-GCM sealed passphrase protecting `sealed_private_key`.
    pub sealed_passphrase: Option<Vec<u8>>,
}

impl AuthMaterial {
    pub fn is_valid(&self) -> bool {
        self.sealed_password.is_some() || self.sealed_private_key.is_some()
    }
}

/// A monitored host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub ssh_port: u16,
    pub user: String,
    pub auth: AuthMaterial,

    pub connect_timeout_s: u64,
    pub command_timeout_s: u64,
    pub pool_cap: usize,

    pub monitoring_enabled: bool,
    pub monitoring_interval_s: u64,

    pub status: TargetStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,

    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    /// Key identifying the SSH pool this target belongs to.
    pub fn pool_key(&self) -> (String, String, u16) {
        (self.user.clone(), self.host.clone(), self.ssh_port)
    }

    /// Validates invariant 1: at least one auth material present, and
    /// invariant on monitoring interval (>= 10s).
    pub fn validate(&self) -> Result<(), crate::error::CwError> {
        if !self.auth.is_valid() {
            return Err(crate::error::CwError::Validation(
                "target must have a sealed password or sealed private key".into(),
            ));
        }
        if self.monitoring_interval_s < 10 {
            return Err(crate::error::CwError::Validation(
                "monitoring_interval_s must be >= 10".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_target() -> Target {
        Target {
            id: 1,
            name: "web-01".into(),
            host: "10.0.0.1".into(),
            ssh_port: 22,
            user: "ops".into(),
            auth: AuthMaterial {
                sealed_password: Some(vec![1, 2, 3]),
                sealed_private_key: None,
                sealed_passphrase: None,
            },
            connect_timeout_s: 10,
            command_timeout_s: 30,
            pool_cap: 3,
            monitoring_enabled: true,
            monitoring_interval_s: 30,
            status: TargetStatus::Unknown,
            last_connected_at: None,
            last_error: None,
            consecutive_failures: 0,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rejects_target_with_no_auth_material() {
        let mut t = base_target();
        t.auth.sealed_password = None;
        assert!(t.validate().is_err());
    }

    #[test]
    fn rejects_interval_below_ten_seconds() {
        let mut t = base_target();
        t.monitoring_interval_s = 5;
        assert!(t.validate().is_err());
    }

    #[test]
    fn accepts_valid_target() {
        assert!(base_target().validate().is_ok());
    }

    #[test]
    fn serialized_target_never_contains_plaintext_marker() {
        let t = base_target();
        let json = serde_json::to_string(&t).unwrap();
        // sealed material is opaque bytes; it must never round-trip as a
        // recognizable plaintext field name.
        assert!(!json.contains("\"password\":"));
        assert!(!json.contains("\"private_key\":"));
    }
}
