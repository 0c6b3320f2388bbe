//! Raw SSH dial/auth/exec over `russh`. Host-key verification runs in
//! trust-on-first-use mode: the first key seen for a `(host, port)` is
//! pinned in memory for the process lifetime; a later mismatch is refused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::keys::key;
use russh::{ChannelMsg, Disconnect};

use super::config::ConnectConfig;
use super::error::SshError;

static KNOWN_HOSTS: once_cell_host_store::HostKeyStore = once_cell_host_store::HostKeyStore::new();

/// Minimal in-process TOFU pin store, avoiding a dependency on `once_cell`
/// purely for this: a lazily-initialized `Mutex<HashMap<..>>` behind a
/// small wrapper gives the same guarantee.
mod once_cell_host_store {
    use super::*;

    pub struct HostKeyStore(Mutex<Option<HashMap<(String, u16), Vec<u8>>>>);

    impl HostKeyStore {
        pub const fn new() -> Self {
            HostKeyStore(Mutex::new(None))
        }

        pub fn check_or_pin(&self, host: &str, port: u16, key_bytes: &[u8]) -> bool {
            let mut guard = self.0.lock();
            let map = guard.get_or_insert_with(HashMap::new);
            match map.get(&(host.to_string(), port)) {
                Some(pinned) => pinned.as_slice() == key_bytes,
                None => {
                    map.insert((host.to_string(), port), key_bytes.to_vec());
                    true
                }
            }
        }
    }
}

struct ClientHandler {
    host: String,
    port: u16,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let encoded = server_public_key.public_key_bytes();
        Ok(KNOWN_HOSTS.check_or_pin(&self.host, self.port, &encoded))
    }
}

/// One authenticated SSH session. Each `exec` opens and tears down its own
/// channel so concurrent executors never contend for the same channel's
/// request/response stream.
pub struct RusshSession {
    handle: Handle<ClientHandler>,
}

impl RusshSession {
    pub async fn dial_and_auth(cfg: &ConnectConfig) -> Result<Self, SshError> {
        let russh_config = Arc::new(client::Config {
            inactivity_timeout: Some(cfg.connect_timeout),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: cfg.host.clone(),
            port: cfg.port,
        };

        let addr = format!("{}:{}", cfg.host, cfg.port);
        let mut handle = tokio::time::timeout(
            cfg.connect_timeout,
            client::connect(russh_config, addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("dial {}:{}", cfg.host, cfg.port)))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        Self::authenticate(&mut handle, cfg).await?;

        Ok(RusshSession { handle })
    }

    /// Key-then-password precedence: if a private key is configured, try it
    /// first (with passphrase if supplied); on failure fall through to
    /// password if present; otherwise surface the key error.
    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        cfg: &ConnectConfig,
    ) -> Result<(), SshError> {
        if let Some(pem) = &cfg.private_key_pem {
            let key_pair = russh::keys::decode_secret_key(pem, cfg.key_passphrase.as_deref())?;
            let ok = handle
                .authenticate_publickey(&cfg.user, Arc::new(key_pair))
                .await
                .map_err(SshError::from)?;
            if ok {
                return Ok(());
            }
            if cfg.password.is_none() {
                return Err(SshError::AuthenticationFailed(
                    "private key rejected and no password configured".into(),
                ));
            }
        }

        if let Some(password) = &cfg.password {
            let ok = handle
                .authenticate_password(&cfg.user, password)
                .await
                .map_err(SshError::from)?;
            if ok {
                return Ok(());
            }
            return Err(SshError::AuthenticationFailed(
                "password rejected by remote host".into(),
            ));
        }

        Err(SshError::AuthenticationFailed(
            "no authentication material configured".into(),
        ))
    }

    /// Runs `command`, collecting stdout/stderr until the channel reports
    /// an exit status or `timeout` elapses.
    pub async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, String, i32), SshError> {
        let run = async {
            let mut channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| SshError::ChannelError(e.to_string()))?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| SshError::ChannelError(e.to_string()))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = 0i32;

            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = exit_status as i32;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                    Some(_) => continue,
                    None => break,
                }
            }

            Ok::<_, SshError>((
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
                exit_code,
            ))
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| SshError::Timeout(command.to_string()))?
    }

    /// Cheap liveness probe used by the pool's health check.
    pub async fn probe(&self, timeout: Duration) -> Result<(), SshError> {
        let (_, _, code) = self.exec("echo cwatcher-probe", timeout).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(SshError::SessionError(format!("probe exited {code}")))
        }
    }

    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
