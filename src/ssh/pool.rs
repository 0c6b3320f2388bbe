//! SSH Connection Pool (C1): one bounded pool per `(user, host, port)`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::client::RusshSession;
use super::config::ConnectConfig;
use super::error::SshError;

/// Abstraction over a dialed SSH session so tests can substitute a stub
/// transport without opening real sockets.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<(String, String, i32), SshError>;
    async fn probe(&self, timeout: Duration) -> Result<(), SshError>;
}

#[async_trait]
impl SshTransport for RusshSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<(String, String, i32), SshError> {
        RusshSession::exec(self, command, timeout).await
    }

    async fn probe(&self, timeout: Duration) -> Result<(), SshError> {
        RusshSession::probe(self, timeout).await
    }
}

/// Factory boundary so the pool can be unit-tested with a stub dialer.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, cfg: &ConnectConfig) -> Result<Arc<dyn SshTransport>, SshError>;
}

pub struct RusshDialer;

#[async_trait]
impl Dialer for RusshDialer {
    async fn dial(&self, cfg: &ConnectConfig) -> Result<Arc<dyn SshTransport>, SshError> {
        let session = RusshSession::dial_and_auth(cfg).await?;
        Ok(Arc::new(session))
    }
}

/// A session checked out of the pool. Holds the permit that enforces the
/// per-target cap; dropping it without calling [`ConnectionPool::release`]
/// (e.g. on an error path) still returns the permit, just not the session.
pub struct CheckedOutSession {
    session: Arc<dyn SshTransport>,
    permit: OwnedSemaphorePermit,
}

impl CheckedOutSession {
    pub fn session(&self) -> &Arc<dyn SshTransport> {
        &self.session
    }
}

struct PoolEntry {
    session: Arc<dyn SshTransport>,
    permit: OwnedSemaphorePermit,
}

enum QuarantineState {
    Healthy { consecutive_failures: u32 },
    Quarantined { until: Instant },
}

struct TargetPool {
    idle: Mutex<VecDeque<PoolEntry>>,
    cap: usize,
    /// One permit per unit of cap; held for the lifetime of a checked-out
    /// or idle session, returned to the semaphore when the session is
    /// dropped without being reinserted. This is what actually enforces
    /// the per-target cap across concurrent `acquire` callers.
    permits: Arc<Semaphore>,
    state: Mutex<QuarantineState>,
}

/// One pool per `(user, host, port)`, capping simultaneous authenticated
/// sessions at the target's configured maximum.
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,
    pools: DashMap<(String, String, u16), Arc<TargetPool>>,
    max_retries: u32,
    quarantine_window: Duration,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn Dialer>, max_retries: u32, quarantine_window: Duration) -> Self {
        ConnectionPool {
            dialer,
            pools: DashMap::new(),
            max_retries,
            quarantine_window,
        }
    }

    /// Returns a healthy session, creating one if under cap and none idle
    /// in the pool. "Healthy" is validated by a 5-second probe; a stale
    /// idle session is discarded and a fresh one dialed in its place.
    pub async fn acquire(&self, cfg: &ConnectConfig) -> Result<CheckedOutSession, SshError> {
        let pool = self.pool_entry(cfg);

        {
            let state = pool.state.lock().await;
            if let QuarantineState::Quarantined { until } = *state {
                if Instant::now() < until {
                    return Err(SshError::Quarantined(format!(
                        "pool for {:?} is quarantined until {:?}",
                        cfg.pool_key(),
                        until
                    )));
                }
            }
        }

        if let Some(entry) = pool.idle.lock().await.pop_front() {
            if entry.session.probe(Duration::from_secs(5)).await.is_ok() {
                return Ok(CheckedOutSession {
                    session: entry.session,
                    permit: entry.permit,
                });
            }
            // entry (and its permit) is dropped here; capacity is freed
            // and reclaimed by the acquire_owned below.
        }

        let permit = pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");

        match self.dial_with_backoff(cfg).await {
            Ok(session) => {
                self.mark_success(&pool).await;
                Ok(CheckedOutSession { session, permit })
            }
            Err(e) => {
                self.mark_failure(&pool).await;
                Err(e)
            }
        }
    }

    /// Returns a session to the idle queue, capped by the pool's
    /// configured maximum; sessions beyond the cap are simply dropped
    /// (freeing their permit back to the semaphore).
    pub async fn release(&self, cfg: &ConnectConfig, checked_out: CheckedOutSession) {
        let pool = self.pool_entry(cfg);
        let mut idle = pool.idle.lock().await;
        if idle.len() < pool.cap {
            idle.push_back(PoolEntry {
                session: checked_out.session,
                permit: checked_out.permit,
            });
        }
    }

    /// Acquires, runs, releases in one call.
    pub async fn execute(
        &self,
        cfg: &ConnectConfig,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, String, i32), SshError> {
        let checked_out = self.acquire(cfg).await?;
        let result = checked_out.session.exec(command, timeout).await;
        match &result {
            Err(SshError::SessionError(_)) | Err(SshError::Disconnected) => {
                // transport dropped; do not return it to the pool
            }
            _ => self.release(cfg, checked_out).await,
        }
        result
    }

    /// Synchronous one-shot probe that never touches the pool.
    pub async fn test(&self, cfg: &ConnectConfig) -> Result<(bool, String, u64, &'static str), SshError> {
        let started = Instant::now();
        let auth_method = if cfg.private_key_pem.is_some() {
            "private_key"
        } else {
            "password"
        };
        match self.dialer.dial(cfg).await {
            Ok(session) => {
                let probe_result = session.probe(Duration::from_secs(5)).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match probe_result {
                    Ok(()) => Ok((true, "ok".into(), duration_ms, auth_method)),
                    Err(e) => Ok((false, e.to_string(), duration_ms, auth_method)),
                }
            }
            Err(e) => Ok((false, e.to_string(), started.elapsed().as_millis() as u64, auth_method)),
        }
    }

    fn pool_entry(&self, cfg: &ConnectConfig) -> Arc<TargetPool> {
        self.pools
            .entry(cfg.pool_key())
            .or_insert_with(|| {
                let cap = cfg.pool_cap.max(1);
                Arc::new(TargetPool {
                    idle: Mutex::new(VecDeque::new()),
                    cap,
                    permits: Arc::new(Semaphore::new(cap)),
                    state: Mutex::new(QuarantineState::Healthy {
                        consecutive_failures: 0,
                    }),
                })
            })
            .clone()
    }

    async fn dial_with_backoff(&self, cfg: &ConnectConfig) -> Result<Arc<dyn SshTransport>, SshError> {
        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(500);
        loop {
            match self.dialer.dial(cfg).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn mark_success(&self, pool: &Arc<TargetPool>) {
        let mut state = pool.state.lock().await;
        *state = QuarantineState::Healthy {
            consecutive_failures: 0,
        };
    }

    async fn mark_failure(&self, pool: &Arc<TargetPool>) {
        let mut state = pool.state.lock().await;
        let failures = match *state {
            QuarantineState::Healthy { consecutive_failures } => consecutive_failures + 1,
            QuarantineState::Quarantined { .. } => 3,
        };
        *state = if failures >= 3 {
            QuarantineState::Quarantined {
                until: Instant::now() + self.quarantine_window,
            }
        } else {
            QuarantineState::Healthy {
                consecutive_failures: failures,
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubTransport;

    #[async_trait]
    impl SshTransport for StubTransport {
        async fn exec(&self, _command: &str, _timeout: Duration) -> Result<(String, String, i32), SshError> {
            Ok(("ok".into(), "".into(), 0))
        }
        async fn probe(&self, _timeout: Duration) -> Result<(), SshError> {
            Ok(())
        }
    }

    struct StubDialer {
        dial_count: AtomicU32,
        should_fail: bool,
    }

    #[async_trait]
    impl Dialer for StubDialer {
        async fn dial(&self, _cfg: &ConnectConfig) -> Result<Arc<dyn SshTransport>, SshError> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail {
                Err(SshError::ConnectionFailed("stub refuses to dial".into()))
            } else {
                Ok(Arc::new(StubTransport))
            }
        }
    }

    fn cfg() -> ConnectConfig {
        ConnectConfig {
            host: "10.0.0.5".into(),
            port: 22,
            user: "ops".into(),
            password: Some("x".into()),
            private_key_pem: None,
            key_passphrase: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            pool_cap: 3,
        }
    }

    #[tokio::test]
    async fn acquire_dials_when_pool_empty() {
        let dialer = Arc::new(StubDialer {
            dial_count: AtomicU32::new(0),
            should_fail: false,
        });
        let pool = ConnectionPool::new(dialer.clone(), 3, Duration::from_secs(600));
        let checked_out = pool.acquire(&cfg()).await.unwrap();
        let (out, _, code) = checked_out
            .session()
            .exec("echo hi", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "ok");
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_then_acquire_reuses_session_without_redialing() {
        let dialer = Arc::new(StubDialer {
            dial_count: AtomicU32::new(0),
            should_fail: false,
        });
        let pool = ConnectionPool::new(dialer.clone(), 3, Duration::from_secs(600));
        let c = cfg();
        let checked_out = pool.acquire(&c).await.unwrap();
        pool.release(&c, checked_out).await;
        let _ = pool.acquire(&c).await.unwrap();
        assert_eq!(dialer.dial_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn three_consecutive_dial_failures_quarantine_the_pool() {
        let dialer = Arc::new(StubDialer {
            dial_count: AtomicU32::new(0),
            should_fail: true,
        });
        let pool = ConnectionPool::new(dialer.clone(), 1, Duration::from_secs(600));
        let c = cfg();
        for _ in 0..3 {
            assert!(pool.acquire(&c).await.is_err());
        }
        let err = pool.acquire(&c).await.unwrap_err();
        assert!(matches!(err, SshError::Quarantined(_)));
    }

    #[tokio::test]
    async fn acquire_blocks_until_a_permit_is_released_when_at_cap() {
        let dialer = Arc::new(StubDialer {
            dial_count: AtomicU32::new(0),
            should_fail: false,
        });
        let mut c = cfg();
        c.pool_cap = 1;
        let pool = Arc::new(ConnectionPool::new(dialer, 3, Duration::from_secs(600)));

        let first = pool.acquire(&c).await.unwrap();

        let pool2 = pool.clone();
        let c2 = c.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&c2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(&c, first).await;
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete once a permit frees up")
            .unwrap();
        assert!(second.is_ok());
    }
}
