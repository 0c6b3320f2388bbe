//! Scheduler (C11): named tasks on interval or cron triggers, with retry,
//! auto-disable, and a bounded execution history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_s: f64,
    pub result: Value,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Trigger {
    IntervalSecs(u64),
    /// Standard 5-field cron (`min hour dom month dow`), each field either
    /// `*` or a single literal number. Sufficient for the default task
    /// table's `0 2 * * *` / `0 3 * * 0` entries; does not support lists,
    /// ranges, or step syntax.
    Cron(String),
}

#[derive(Debug, Clone, Copy)]
struct CronField(Option<u32>);

impl CronField {
    fn parse(s: &str) -> CronField {
        if s == "*" {
            CronField(None)
        } else {
            CronField(s.parse().ok())
        }
    }

    fn matches(&self, value: u32) -> bool {
        self.0.map_or(true, |f| f == value)
    }
}

/// Parsed cron expression; `matches` tests a UTC instant against all five
/// fields.
struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    fn parse(expr: &str) -> Option<CronSchedule> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(CronSchedule {
            minute: CronField::parse(fields[0]),
            hour: CronField::parse(fields[1]),
            day_of_month: CronField::parse(fields[2]),
            month: CronField::parse(fields[3]),
            day_of_week: CronField::parse(fields[4]),
        })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        use chrono::Datelike;
        use chrono::Timelike;
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

/// A named unit of recurring work. `action` is invoked with the task id
/// and must return a JSON result map on success.
pub struct Task {
    pub id: String,
    pub trigger: Trigger,
    pub priority: u8,
    pub max_retries: u32,
    pub retry_delay_s: u64,
    pub auto_disable_threshold: u32,
    enabled: AtomicBool,
    consecutive_failures: AtomicU32,
    last_run: Mutex<Option<Instant>>,
    last_cron_minute: Mutex<Option<i64>>,
    next_run_delay: Mutex<Duration>,
}

impl Task {
    pub fn new(id: impl Into<String>, trigger: Trigger, priority: u8) -> Self {
        Task {
            id: id.into(),
            trigger,
            priority,
            max_retries: 3,
            retry_delay_s: 60,
            auto_disable_threshold: 5,
            enabled: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_run: Mutex::new(None),
            last_cron_minute: Mutex::new(None),
            next_run_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Widens this task's next-run spacing by `delay`, used by the
    /// Coordinator under HighLoad to serialize conflicting tasks.
    pub fn delay_next_run(&self, delay: Duration) {
        *self.next_run_delay.lock() = delay;
    }

    fn is_due(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match &self.trigger {
            Trigger::IntervalSecs(s) => {
                let extra = std::mem::take(&mut *self.next_run_delay.lock());
                match *self.last_run.lock() {
                    None => true,
                    Some(last) => last.elapsed() >= Duration::from_secs(*s) + extra,
                }
            }
            Trigger::Cron(expr) => {
                let Some(schedule) = CronSchedule::parse(expr) else {
                    return false;
                };
                let now = Utc::now();
                if !schedule.matches(now) {
                    return false;
                }
                let minute = now.timestamp() / 60;
                let mut last = self.last_cron_minute.lock();
                if *last == Some(minute) {
                    return false;
                }
                *last = Some(minute);
                true
            }
        }
    }
}

pub type TaskAction = Arc<dyn Fn() -> futures_util::future::BoxFuture<'static, Result<Value, String>> + Send + Sync>;

struct RegisteredTask {
    task: Arc<Task>,
    action: TaskAction,
}

/// Owns the task registry, the retry/auto-disable state machine, and the
/// bounded execution history.
pub struct Scheduler {
    tasks: Mutex<Vec<RegisteredTask>>,
    history: Mutex<VecDeque<ExecutionResult>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    pub fn register(&self, task: Task, action: TaskAction) -> Arc<Task> {
        let task = Arc::new(task);
        self.tasks.lock().push(RegisteredTask {
            task: task.clone(),
            action,
        });
        task
    }

    pub fn task(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().iter().find(|t| t.task.id == id).map(|t| t.task.clone())
    }

    pub fn history(&self, limit: usize) -> Vec<ExecutionResult> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    fn record(&self, result: ExecutionResult) {
        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Runs one task immediately regardless of its trigger, applying the
    /// same retry/auto-disable bookkeeping as the tick loop.
    pub async fn run(&self, task_id: &str) -> Option<ExecutionResult> {
        let entry = {
            let tasks = self.tasks.lock();
            tasks
                .iter()
                .find(|t| t.task.id == task_id)
                .map(|t| (t.task.clone(), t.action.clone()))
        };
        let (task, action) = entry?;
        Some(self.execute(&task, action).await)
    }

    async fn execute(&self, task: &Arc<Task>, action: TaskAction) -> ExecutionResult {
        let started_at = Utc::now();
        let started = Instant::now();
        *task.last_run.lock() = Some(Instant::now());

        let mut attempt = 0;
        let outcome = loop {
            match action().await {
                Ok(result) => break Ok(result),
                Err(e) => {
                    attempt += 1;
                    if attempt > task.max_retries {
                        break Err(e);
                    }
                    tokio::time::sleep(Duration::from_secs(task.retry_delay_s)).await;
                }
            }
        };

        let result = match outcome {
            Ok(result) => {
                task.consecutive_failures.store(0, Ordering::SeqCst);
                ExecutionResult {
                    task_id: task.id.clone(),
                    status: ExecutionStatus::Success,
                    started_at,
                    ended_at: Utc::now(),
                    duration_s: started.elapsed().as_secs_f64(),
                    result,
                    error: None,
                }
            }
            Err(e) => {
                let failures = task.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= task.auto_disable_threshold {
                    task.disable();
                    tracing::error!(task_id = %task.id, failures, "task auto-disabled after repeated failures");
                }
                ExecutionResult {
                    task_id: task.id.clone(),
                    status: ExecutionStatus::Failed,
                    started_at,
                    ended_at: Utc::now(),
                    duration_s: started.elapsed().as_secs_f64(),
                    result: Value::Null,
                    error: Some(e),
                }
            }
        };

        self.record(result.clone());
        result
    }

    /// Main tick loop: every `tick_s`, runs any due, enabled task whose
    /// dependencies have already run this cycle.
    pub async fn run_forever(self: Arc<Self>, tick_s: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_s.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let due: Vec<(Arc<Task>, TaskAction)> = {
                        let tasks = self.tasks.lock();
                        tasks
                            .iter()
                            .filter(|t| t.task.is_due())
                            .map(|t| (t.task.clone(), t.action.clone()))
                            .collect()
                    };
                    for (task, action) in due {
                        self.execute(&task, action).await;
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
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use futures_util::FutureExt;

    fn counting_action(counter: Arc<Counter>, fail_times: u32) -> TaskAction {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err("boom".to_string())
                } else {
                    Ok(serde_json::json!({ "n": n }))
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn successful_run_resets_failure_counter() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(Counter::new(0));
        let task = scheduler.register(
            Task::new("t1", Trigger::IntervalSecs(30), 5),
            counting_action(counter, 0),
        );
        let result = scheduler.run("t1").await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(task.consecutive_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn task_auto_disables_after_threshold_failures() {
        let scheduler = Scheduler::new();
        let mut t = Task::new("flaky", Trigger::IntervalSecs(30), 5);
        t.max_retries = 0;
        t.retry_delay_s = 0;
        t.auto_disable_threshold = 2;
        let counter = Arc::new(Counter::new(0));
        let task = scheduler.register(t, counting_action(counter, 100));

        scheduler.run("flaky").await;
        scheduler.run("flaky").await;
        assert!(!task.is_enabled());
    }

    #[tokio::test]
    async fn history_is_capped() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(Counter::new(0));
        let mut t = Task::new("t", Trigger::IntervalSecs(30), 5);
        t.max_retries = 0;
        t.retry_delay_s = 0;
        scheduler.register(t, counting_action(counter, 0));
        for _ in 0..5 {
            scheduler.run("t").await;
        }
        assert_eq!(scheduler.history(10).len(), 5);
    }
}
