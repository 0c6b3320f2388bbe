//! Dependency-ordered component wiring and the default task set.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::aggregator::Aggregator;
use crate::batch::BatchWriter;
use crate::collectors::Collectors;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::crypto::{Envelope, MasterKey};
use crate::executor::{by_name, CommandExecutor};
use crate::hub::Hub;
use crate::model::SystemInfo;
use crate::push::PushService;
use crate::retention::{Archiver, Policy};
use crate::scheduler::{Scheduler, Task, TaskAction, Trigger};
use crate::security::SecurityGate;
use crate::ssh::{ConnectionPool, RusshDialer};
use crate::store::{InMemoryStore, MetricStore};
use futures_util::FutureExt;

/// Every live component, held behind `Arc` so task closures and the
/// WebSocket accept loop can each take their own handle.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn MetricStore>,
    pub envelope: Arc<Envelope>,
    pub security: Arc<SecurityGate>,
    pub pool: Arc<ConnectionPool>,
    pub executor: Arc<CommandExecutor>,
    pub collectors: Arc<Collectors>,
    pub batch: Arc<BatchWriter>,
    pub aggregator: Arc<Aggregator>,
    pub archiver: Arc<Archiver>,
    pub hub: Arc<Hub>,
    pub push: Arc<PushService>,
    pub scheduler: Arc<Scheduler>,
    pub coordinator: Arc<Coordinator>,
    pub system_info: Arc<DashMap<u64, SystemInfo>>,
    pub shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl App {
    /// Builds every component in dependency order: config and the master
    /// key first, the store next (nothing else can run without it), then
    /// the SSH/security/collection stack, then the read side (aggregator,
    /// archiver), then the push/scheduling/coordination layer on top.
    pub fn build(config: Config) -> crate::error::CwResult<Self> {
        let master_key = MasterKey::from_env()?;
        let envelope = Arc::new(Envelope::new(master_key));

        let store: Arc<dyn MetricStore> = Arc::new(InMemoryStore::new());

        let security = Arc::new(SecurityGate::new(&config.security));
        let dialer = Arc::new(RusshDialer);
        let pool = Arc::new(ConnectionPool::new(
            dialer,
            config.ssh.max_retries,
            Duration::from_secs(config.ssh.quarantine_s),
        ));
        let executor = Arc::new(CommandExecutor::new(pool.clone(), security.clone()));
        let collectors = Arc::new(Collectors::new(config.thresholds.clone()));

        let batch = Arc::new(BatchWriter::new(
            store.clone(),
            config.batch.size,
            config.batch.flush_interval_s,
        ));
        let aggregator = Arc::new(Aggregator::new(store.clone()));
        let archiver = Arc::new(Archiver::new(
            store.clone(),
            config.archive.dir.clone(),
            config.archive.prune_after_days,
        ));

        let hub = Hub::new();
        let push = Arc::new(PushService::new(
            collectors.clone(),
            executor.clone(),
            envelope.clone(),
            hub.clone(),
            batch.clone(),
            Duration::from_secs(config.push.interval_s_default),
            Duration::from_secs(config.push.tick_s),
        ));

        let scheduler = Arc::new(Scheduler::new());
        let coordinator = Arc::new(Coordinator::new(scheduler.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(App {
            config,
            store,
            envelope,
            security,
            pool,
            executor,
            collectors,
            batch,
            aggregator,
            archiver,
            hub,
            push,
            scheduler,
            coordinator,
            system_info: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Registers the default task table: `monitoring_collection`,
    /// `websocket_push`, `system_info_update`, `buffer_flush`,
    /// `storage_monitor`, `daily_data_cleanup`, `weekly_archive_cleanup`.
    /// Priorities match the task table; retry/auto-disable use each
    /// task's defaults.
    pub fn register_default_tasks(self: &Arc<Self>) {
        let this = self.clone();
        self.scheduler.register(
            Task::new("monitoring_collection", Trigger::IntervalSecs(30), 10),
            action(move || {
                let this = this.clone();
                async move {
                    let results = this.push.push_now_all().await;
                    let failed = results.values().filter(|r| r.is_err()).count();
                    if failed > 0 {
                        return Err(format!("{failed} target(s) failed to push"));
                    }
                    Ok(serde_json::json!({ "targets": results.len() }))
                }
            }),
        );

        let this = self.clone();
        self.scheduler.register(
            Task::new("websocket_push", Trigger::IntervalSecs(30), 9),
            action(move || {
                let this = this.clone();
                async move { Ok(serde_json::json!({ "connections": this.hub.connection_count() })) }
            }),
        );

        let this = self.clone();
        self.scheduler.register(
            Task::new("system_info_update", Trigger::IntervalSecs(300), 5),
            action(move || {
                let this = this.clone();
                async move {
                    let ids = this.push.active_target_ids();
                    for id in &ids {
                        this.refresh_system_info(*id).await;
                    }
                    Ok(serde_json::json!({ "refreshed": ids.len() }))
                }
            }),
        );

        let this = self.clone();
        self.scheduler.register(
            Task::new("buffer_flush", Trigger::IntervalSecs(120), 6),
            action(move || {
                let this = this.clone();
                async move {
                    let report = this.batch.flush();
                    Ok(serde_json::to_value(report).unwrap_or_default())
                }
            }),
        );

        let this = self.clone();
        self.scheduler.register(
            Task::new("storage_monitor", Trigger::IntervalSecs(1800), 4),
            action(move || {
                let this = this.clone();
                async move {
                    let info = crate::retention::storage_info(this.store.as_ref(), std::path::Path::new(&this.config.archive.dir));
                    Ok(serde_json::to_value(info).unwrap_or_default())
                }
            }),
        );

        let this = self.clone();
        self.scheduler.register(
            Task::new("daily_data_cleanup", Trigger::Cron("0 2 * * *".into()), 3),
            action(move || {
                let this = this.clone();
                async move {
                    let stats = this
                        .archiver
                        .cleanup(&Policy::basic())
                        .map_err(|e| e.to_string())?;
                    Ok(serde_json::to_value(stats).unwrap_or_default())
                }
            }),
        );

        let this = self.clone();
        self.scheduler.register(
            Task::new("weekly_archive_cleanup", Trigger::Cron("0 3 * * 0".into()), 2),
            action(move || {
                let this = this.clone();
                async move {
                    let pruned = this.archiver.prune_archives().map_err(|e| e.to_string())?;
                    Ok(serde_json::json!({ "pruned": pruned }))
                }
            }),
        );
    }

    /// Refreshes one target's [`SystemInfo`] through the fast-path,
    /// cacheable predefined commands (`hostname`, `uname`, `lscpu`,
    /// `ip_addr`), replacing whatever was previously stored whole.
    async fn refresh_system_info(&self, target_id: u64) {
        let Ok(cfg) = self.push.connect_config(target_id) else {
            return;
        };
        let hostname = by_name("hostname");
        let uname = by_name("uname");
        let lscpu = by_name("lscpu");
        let ip_addr = by_name("ip_addr");

        let (hostname_r, uname_r, lscpu_r, ip_addr_r) = tokio::join!(
            self.executor.run_predefined(&cfg, &hostname, true),
            self.executor.run_predefined(&cfg, &uname, true),
            self.executor.run_predefined(&cfg, &lscpu, true),
            self.executor.run_predefined(&cfg, &ip_addr, true),
        );

        let mut info = SystemInfo::empty(target_id, chrono::Utc::now());
        if hostname_r.status == crate::executor::CommandStatus::Success {
            info.hostname = Some(hostname_r.stdout.trim().to_string());
        }
        if uname_r.status == crate::executor::CommandStatus::Success {
            info.kernel = Some(uname_r.stdout.trim().to_string());
        }
        if let Some(cores) = lscpu_r.parsed.as_ref().and_then(|v| v.get("cores")).and_then(|v| v.as_u64()) {
            info.cpu_cores = Some(cores as u32);
        }
        if let Some(model) = lscpu_r.parsed.as_ref().and_then(|v| v.get("model_name")).and_then(|v| v.as_str()) {
            info.cpu_model = Some(model.to_string());
        }
        if let Some(ifaces) = ip_addr_r.parsed.as_ref().and_then(|v| v.as_array()) {
            if let Some(first) = ifaces.iter().find(|i| i["name"] != "lo") {
                info.primary_interface = first["name"].as_str().map(String::from);
                info.primary_ip = first["addrs"][0]["address"].as_str().map(String::from);
            }
        }

        self.system_info.insert(target_id, info);
    }
}

fn action<F, Fut>(f: F) -> TaskAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}
