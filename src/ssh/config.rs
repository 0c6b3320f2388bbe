use std::time::Duration;

/// Everything [`super::client`] needs to dial and authenticate one session,
/// resolved from a [`crate::model::Target`] with credentials already opened
/// by the [`crate::crypto::Envelope`]. Dropped promptly after use.
#[derive(Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key_pem: Option<String>,
    pub key_passphrase: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub pool_cap: usize,
}

impl ConnectConfig {
    pub fn pool_key(&self) -> (String, String, u16) {
        (self.user.clone(), self.host.clone(), self.port)
    }
}
