//! Coordinator (C12): watches load and failure signals every 30 s and
//! picks an operating mode, widening task spacing or disabling
//! non-critical work as conditions degrade.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    HighLoad,
    Emergency,
}

impl From<u8> for Mode {
    fn from(v: u8) -> Self {
        match v {
            1 => Mode::HighLoad,
            2 => Mode::Emergency,
            _ => Mode::Normal,
        }
    }
}

impl From<Mode> for u8 {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Normal => 0,
            Mode::HighLoad => 1,
            Mode::Emergency => 2,
        }
    }
}

/// A dependency or conflict edge between two named tasks.
pub struct Edge {
    pub from: &'static str,
    pub to: &'static str,
}

/// Static dependency/conflict table, fixed at compile time per the
/// coordinator's design: `websocket_push` depends on
/// `monitoring_collection`; `monitoring_collection` conflicts with
/// `system_info_update`; `buffer_flush` conflicts with both cleanups;
/// `weekly_archive_cleanup` depends on `daily_data_cleanup`.
pub const DEPENDENCIES: &[Edge] = &[
    Edge { from: "websocket_push", to: "monitoring_collection" },
    Edge { from: "weekly_archive_cleanup", to: "daily_data_cleanup" },
];

pub const CONFLICTS: &[Edge] = &[
    Edge { from: "monitoring_collection", to: "system_info_update" },
    Edge { from: "buffer_flush", to: "daily_data_cleanup" },
    Edge { from: "buffer_flush", to: "weekly_archive_cleanup" },
];

const CONFLICT_DELAY: Duration = Duration::from_secs(60);
const NON_CRITICAL_TASKS: &[&str] = &["storage_monitor", "daily_data_cleanup", "weekly_archive_cleanup"];

pub struct LoadSignals {
    pub buffer_fill_ratio: f64,
    pub connection_count: usize,
    pub pending_tasks: usize,
    pub max_consecutive_task_failures: u32,
}

/// Observes [`LoadSignals`] and owns the current [`Mode`], applying its
/// consequences to the scheduler's tasks.
pub struct Coordinator {
    scheduler: Arc<Scheduler>,
    mode: AtomicU8,
}

impl Coordinator {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Coordinator {
            scheduler,
            mode: AtomicU8::new(Mode::Normal.into()),
        }
    }

    pub fn mode(&self) -> Mode {
        Mode::from(self.mode.load(Ordering::SeqCst))
    }

    fn select_mode(signals: &LoadSignals) -> Mode {
        if signals.max_consecutive_task_failures >= 3 {
            return Mode::Emergency;
        }
        let high_load_signals = [
            signals.buffer_fill_ratio > 0.8,
            signals.connection_count > 50,
            signals.pending_tasks > 10,
        ]
        .into_iter()
        .filter(|b| *b)
        .count();
        if high_load_signals >= 2 {
            Mode::HighLoad
        } else {
            Mode::Normal
        }
    }

    /// One observation cycle: selects a mode from `signals` and applies
    /// it to the scheduler's tasks.
    pub fn tick(&self, signals: &LoadSignals) {
        let mode = Self::select_mode(signals);
        self.mode.store(mode.into(), Ordering::SeqCst);

        match mode {
            Mode::Normal => {
                for name in NON_CRITICAL_TASKS {
                    if let Some(task) = self.scheduler.task(name) {
                        task.enable();
                    }
                }
            }
            Mode::HighLoad => {
                self.delay_conflicting_tasks();
            }
            Mode::Emergency => {
                for name in NON_CRITICAL_TASKS {
                    if let Some(task) = self.scheduler.task(name) {
                        task.disable();
                    }
                }
            }
        }
    }

    /// For every conflict edge, delays the lower-priority task's next
    /// run by 60 s so the two don't fire in the same window.
    fn delay_conflicting_tasks(&self) {
        for edge in CONFLICTS {
            let (Some(a), Some(b)) = (self.scheduler.task(edge.from), self.scheduler.task(edge.to)) else {
                continue;
            };
            if a.priority <= b.priority {
                a.delay_next_run(CONFLICT_DELAY);
            } else {
                b.delay_next_run(CONFLICT_DELAY);
            }
        }
    }

    pub async fn run_forever(self: Arc<Self>, signals: impl Fn() -> LoadSignals + Send + Sync + 'static, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&signals());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Task, TaskAction, Trigger};
    use futures_util::FutureExt;

    fn noop_action() -> TaskAction {
        Arc::new(|| async { Ok(serde_json::json!({})) }.boxed())
    }

    #[test]
    fn three_consecutive_failures_select_emergency() {
        let scheduler = Arc::new(Scheduler::new());
        let coordinator = Coordinator::new(scheduler);
        coordinator.tick(&LoadSignals {
            buffer_fill_ratio: 0.0,
            connection_count: 0,
            pending_tasks: 0,
            max_consecutive_task_failures: 3,
        });
        assert_eq!(coordinator.mode(), Mode::Emergency);
    }

    #[test]
    fn two_of_three_high_load_signals_select_high_load() {
        let scheduler = Arc::new(Scheduler::new());
        let coordinator = Coordinator::new(scheduler);
        coordinator.tick(&LoadSignals {
            buffer_fill_ratio: 0.9,
            connection_count: 60,
            pending_tasks: 0,
            max_consecutive_task_failures: 0,
        });
        assert_eq!(coordinator.mode(), Mode::HighLoad);
    }

    #[test]
    fn emergency_disables_non_critical_tasks() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.register(Task::new("storage_monitor", Trigger::IntervalSecs(1800), 4), noop_action());
        let coordinator = Coordinator::new(scheduler.clone());
        coordinator.tick(&LoadSignals {
            buffer_fill_ratio: 0.0,
            connection_count: 0,
            pending_tasks: 0,
            max_consecutive_task_failures: 5,
        });
        assert!(!scheduler.task("storage_monitor").unwrap().is_enabled());
    }
}
