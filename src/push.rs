//! Push Service (C10): ticks every target on its own push interval,
//! drives one collection cycle per due target, and feeds the hub and
//! batch writer from the result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tokio::time::Duration as TokioDuration;

use crate::batch::BatchWriter;
use crate::collectors::Collectors;
use crate::crypto::Envelope;
use crate::error::{CwError, CwResult};
use crate::executor::CommandExecutor;
use crate::hub::protocol::{Envelope as MsgEnvelope, MessageType};
use crate::hub::{BroadcastItem, Hub};
use crate::model::{Target, TargetStatus};
use crate::normalize;
use crate::ssh::ConnectConfig;

const CONSECUTIVE_FAILURES_TO_DEACTIVATE: u32 = 5;
const PROBATION_REACTIVATE_AFTER: Duration = Duration::from_secs(600);

struct PushState {
    consecutive_failures: u32,
    last_status: TargetStatus,
    last_push: Instant,
    active: bool,
    deactivated_at: Option<Instant>,
    in_flight: AtomicBool,
}

impl Default for PushState {
    fn default() -> Self {
        PushState {
            consecutive_failures: 0,
            last_status: TargetStatus::Unknown,
            last_push: Instant::now() - Duration::from_secs(3600),
            active: true,
            deactivated_at: None,
            in_flight: AtomicBool::new(false),
        }
    }
}

pub struct PushService {
    targets: DashMap<u64, RwLock<Target>>,
    states: DashMap<u64, RwLock<PushState>>,
    collectors: Arc<Collectors>,
    executor: Arc<CommandExecutor>,
    envelope: Arc<Envelope>,
    hub: Arc<Hub>,
    batch: Arc<BatchWriter>,
    interval_default: Duration,
    tick: Duration,
}

impl PushService {
    pub fn new(
        collectors: Arc<Collectors>,
        executor: Arc<CommandExecutor>,
        envelope: Arc<Envelope>,
        hub: Arc<Hub>,
        batch: Arc<BatchWriter>,
        interval_default: Duration,
        tick: Duration,
    ) -> Self {
        PushService {
            targets: DashMap::new(),
            states: DashMap::new(),
            collectors,
            executor,
            envelope,
            hub,
            batch,
            interval_default,
            tick,
        }
    }

    pub fn register_target(&self, target: Target) -> CwResult<u64> {
        target.validate()?;
        let id = target.id;
        self.targets.insert(id, RwLock::new(target));
        self.states.insert(id, RwLock::new(PushState::default()));
        Ok(id)
    }

    pub fn active_target_ids(&self) -> Vec<u64> {
        self.targets
            .iter()
            .filter(|e| self.states.get(e.key()).map_or(false, |s| s.read().active))
            .map(|e| *e.key())
            .collect()
    }

    /// Resolves and decrypts one target's connection config, for callers
    /// outside the push cycle (e.g. a system-info refresh task) that need
    /// the same credentials without running a full collection cycle.
    pub fn connect_config(&self, target_id: u64) -> CwResult<ConnectConfig> {
        let target = self
            .targets
            .get(&target_id)
            .ok_or_else(|| CwError::Validation(format!("unknown target {target_id}")))?
            .read()
            .clone();
        self.connect_config_for(&target)
    }

    fn connect_config_for(&self, target: &Target) -> CwResult<ConnectConfig> {
        let password = target
            .auth
            .sealed_password
            .as_ref()
            .map(|sealed| self.envelope.open(sealed))
            .transpose()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let private_key_pem = target
            .auth
            .sealed_private_key
            .as_ref()
            .map(|sealed| self.envelope.open(sealed))
            .transpose()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let key_passphrase = target
            .auth
            .sealed_passphrase
            .as_ref()
            .map(|sealed| self.envelope.open(sealed))
            .transpose()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        Ok(ConnectConfig {
            host: target.host.clone(),
            port: target.ssh_port,
            user: target.user.clone(),
            password,
            private_key_pem,
            key_passphrase,
            connect_timeout: Duration::from_secs(target.connect_timeout_s),
            command_timeout: Duration::from_secs(target.command_timeout_s),
            pool_cap: target.pool_cap,
        })
    }

    fn derive_status(success: bool, alert_level: crate::model::AlertLevel) -> TargetStatus {
        if !success {
            return TargetStatus::Offline;
        }
        match alert_level {
            crate::model::AlertLevel::Critical => TargetStatus::Error,
            crate::model::AlertLevel::Warning => TargetStatus::Warning,
            _ => TargetStatus::Online,
        }
    }

    /// Runs one collection cycle for `target_id`, bypassing the interval
    /// gate. No two cycles for the same target ever overlap: a second
    /// caller observes `in_flight` and returns immediately.
    pub async fn push_now(&self, target_id: u64) -> CwResult<()> {
        let Some(state_entry) = self.states.get(&target_id) else {
            return Err(CwError::Validation(format!("unknown target {target_id}")));
        };
        if state_entry
            .read()
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        drop(state_entry);

        let result = self.run_cycle(target_id).await;

        if let Some(state_entry) = self.states.get(&target_id) {
            state_entry.read().in_flight.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn run_cycle(&self, target_id: u64) -> CwResult<()> {
        let Some(target_lock) = self.targets.get(&target_id) else {
            return Err(CwError::Validation(format!("unknown target {target_id}")));
        };
        let target = target_lock.read().clone();
        drop(target_lock);

        let cfg = self.connect_config_for(&target)?;

        let (cpu, memory, disk, network) = tokio::join!(
            self.collectors.cpu.collect(&self.executor, &cfg, target_id),
            self.collectors.memory.collect(&self.executor, &cfg, target_id),
            self.collectors.disk.collect(&self.executor, &cfg, target_id),
            self.collectors.network.collect(&self.executor, &cfg, target_id),
        );
        let samples = vec![cpu, memory, disk, network];
        let overall_alert_level = normalize::overall_alert_level(&samples);
        let success = samples.iter().all(|s| s.success);

        let row = normalize::normalize(target_id, &samples, 0)?;
        self.batch.add(row.clone());

        let new_status = Self::derive_status(success, overall_alert_level);

        let Some(state_lock) = self.states.get(&target_id) else {
            return Ok(());
        };
        let mut state = state_lock.write();
        let status_changed = new_status != state.last_status;
        if status_changed {
            self.hub.enqueue(BroadcastItem::targeted(
                MsgEnvelope::new(
                    MessageType::StatusChange,
                    json!({ "target_id": target_id, "old_status": state.last_status, "new_status": new_status }),
                ),
                target_id,
                None,
                None,
            ));
        }
        self.hub.enqueue(BroadcastItem::targeted(
            MsgEnvelope::new(MessageType::MonitoringUpdate, json!({ "target_id": target_id, "row": row })),
            target_id,
            None,
            Some(overall_alert_level),
        ));

        state.last_status = new_status;
        state.last_push = Instant::now();
        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= CONSECUTIVE_FAILURES_TO_DEACTIVATE && state.active {
                state.active = false;
                state.deactivated_at = Some(Instant::now());
            }
        }
        drop(state);

        if let Some(target_lock) = self.targets.get(&target_id) {
            let mut t = target_lock.write();
            t.status = new_status;
            t.consecutive_failures = self.states.get(&target_id).map_or(0, |s| s.read().consecutive_failures);
            if success {
                t.last_connected_at = Some(chrono::Utc::now());
                t.last_error = None;
            } else {
                t.last_error = row.error_message.clone();
            }
        }

        Ok(())
    }

    /// Reactivates targets whose probation window has elapsed, so a
    /// deactivated target gets one more chance rather than staying dark
    /// forever.
    fn reactivate_probation(&self) {
        for entry in self.states.iter() {
            let mut state = entry.write();
            if !state.active {
                if let Some(deactivated_at) = state.deactivated_at {
                    if deactivated_at.elapsed() >= PROBATION_REACTIVATE_AFTER {
                        state.active = true;
                        state.consecutive_failures = 0;
                        state.deactivated_at = None;
                    }
                }
            }
        }
    }

    fn due_targets(&self) -> Vec<u64> {
        let mut due = Vec::new();
        for entry in self.targets.iter() {
            let id = *entry.key();
            let interval = {
                let t = entry.read();
                if t.monitoring_enabled {
                    Duration::from_secs(t.monitoring_interval_s.max(1))
                } else {
                    continue;
                }
            };
            let interval = if interval.is_zero() { self.interval_default } else { interval };
            if let Some(state) = self.states.get(&id) {
                let state = state.read();
                if state.active && state.last_push.elapsed() >= interval {
                    due.push(id);
                }
            }
        }
        due
    }

    /// Main loop: wakes every `tick`, and for each target whose interval
    /// has elapsed, dispatches one cycle concurrently with the others.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TokioDuration::from_secs(self.tick.as_secs().max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reactivate_probation();
                    let due = self.due_targets();
                    let mut handles = Vec::with_capacity(due.len());
                    for id in due {
                        let this = self.clone();
                        handles.push(tokio::spawn(async move {
                            if let Err(e) = this.push_now(id).await {
                                tracing::warn!(target_id = id, error = %e, "push cycle failed");
                            }
                        }));
                    }
                    for h in handles {
                        let _ = h.await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Immediate push across every active target, used by the scheduler's
    /// `monitoring_collection` task.
    pub async fn push_now_all(&self) -> HashMap<u64, CwResult<()>> {
        let ids = self.active_target_ids();
        let mut results = HashMap::new();
        for id in ids {
            results.insert(id, self.push_now(id).await);
        }
        results
    }
}
