//! Periodic task scheduler
//!
//! Each registered task is an explicit unit with its own cancellation token,
//! last-run timestamp and error slot. Timing lives on a small tokio runtime;
//! the task bodies run on its blocking pool so a slow tuning pass never
//! delays a drift check.

use crate::cancel::CancellationToken;
use crate::error::{CounterError, Result};
use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;

/// When a task runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Schedule {
    /// Repeatedly, `interval` after the previous run finished
    Every(Duration),
    /// Once a day at a local wall-clock time
    DailyAt(NaiveTime),
    /// A single run after `delay`
    Once { delay: Duration },
}

/// A unit of periodic work.
///
/// `run` executes on a blocking thread and should poll `cancel` at its
/// natural checkpoints.
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Snapshot of one task's bookkeeping
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub runs: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub running: bool,
}

struct TaskEntry {
    task: Arc<dyn ScheduledTask>,
    schedule: Schedule,
    cancel: CancellationToken,
    status: Mutex<TaskStatus>,
}

impl TaskEntry {
    fn update<F: FnOnce(&mut TaskStatus)>(&self, f: F) {
        f(&mut self.status.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn status(&self) -> TaskStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Next occurrence of wall-clock time `at` strictly after `now`.
///
/// A time that falls in a DST gap moves forward by the gap; an ambiguous
/// time resolves to its earlier instant.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    for offset in 0..=2 {
        let naive = (today + ChronoDuration::days(offset)).and_time(at);
        let candidate = match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => {
                // Inside a spring-forward gap; step until the clock exists again
                (1..=4)
                    .map(|h| naive + ChronoDuration::minutes(30 * h))
                    .find_map(|n| tz.from_local_datetime(&n).earliest())
            }
        };
        if let Some(candidate) = candidate {
            if candidate > *now {
                return candidate;
            }
        }
    }
    now.clone() + ChronoDuration::days(1)
}

/// Delay until a task's next run
fn next_delay(schedule: &Schedule) -> (Duration, DateTime<Utc>) {
    match *schedule {
        Schedule::Every(interval) | Schedule::Once { delay: interval } => {
            let at = Utc::now() + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::zero());
            (interval, at)
        }
        Schedule::DailyAt(time) => {
            let now = chrono::Local::now();
            let next = next_daily_run(&now, time);
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            (delay, next.with_timezone(&Utc))
        }
    }
}

async fn task_loop(entry: Arc<TaskEntry>) {
    let name = entry.task.name().to_string();
    loop {
        let (delay, at) = next_delay(&entry.schedule);
        entry.update(|s| s.next_run = Some(at));
        log::debug!("Task '{}' next run at {}", name, at);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = entry.cancel.cancelled() => break,
        }

        log::info!("Task '{}' starting", name);
        entry.update(|s| {
            s.running = true;
            s.next_run = None;
        });
        let task = Arc::clone(&entry.task);
        let cancel = entry.cancel.clone();
        let started = Utc::now();
        let result = tokio::task::spawn_blocking(move || task.run(&cancel)).await;

        entry.update(|s| {
            s.running = false;
            s.runs += 1;
            s.last_run = Some(started);
            match &result {
                Ok(Ok(())) => s.last_error = None,
                Ok(Err(CounterError::Cancelled)) => {}
                Ok(Err(e)) => {
                    s.failures += 1;
                    s.last_error = Some(e.to_string());
                }
                Err(e) => {
                    s.failures += 1;
                    s.last_error = Some(format!("task panicked: {}", e));
                }
            }
        });
        match result {
            Ok(Ok(())) => log::debug!("Task '{}' finished", name),
            Ok(Err(CounterError::Cancelled)) => {
                log::info!("Task '{}' cancelled", name);
                break;
            }
            Ok(Err(e)) => log::error!("Task '{}' failed: {}", name, e),
            Err(e) => log::error!("Task '{}' panicked: {}", name, e),
        }

        if matches!(entry.schedule, Schedule::Once { .. }) || entry.cancel.is_cancelled() {
            break;
        }
    }
    entry.update(|s| s.next_run = None);
}

/// Drives registered tasks on their schedules until shut down
pub struct Scheduler {
    runtime: Option<Runtime>,
    entries: Vec<Arc<TaskEntry>>,
    shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(worker_threads: usize, shutdown_timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("linecount-scheduler")
            .enable_time()
            .build()
            .map_err(|e| CounterError::scheduler(format!("failed to start runtime: {}", e)))?;
        Ok(Self {
            runtime: Some(runtime),
            entries: Vec::new(),
            shutdown_timeout,
        })
    }

    /// Register and start a task; returns its cancellation token
    pub fn add(&mut self, task: Arc<dyn ScheduledTask>, schedule: Schedule) -> Result<CancellationToken> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| CounterError::scheduler("scheduler is shut down"))?;
        if self.entries.iter().any(|e| e.task.name() == task.name()) {
            return Err(CounterError::scheduler(format!(
                "task '{}' already registered",
                task.name()
            )));
        }
        let entry = Arc::new(TaskEntry {
            status: Mutex::new(TaskStatus {
                name: task.name().to_string(),
                ..Default::default()
            }),
            task,
            schedule,
            cancel: CancellationToken::new(),
        });
        log::info!("Scheduling task '{}' ({:?})", entry.task.name(), schedule);
        runtime.spawn(task_loop(Arc::clone(&entry)));
        let token = entry.cancel.clone();
        self.entries.push(entry);
        Ok(token)
    }

    /// Cancel a single task by name; `false` if unknown
    pub fn cancel(&self, name: &str) -> bool {
        match self.entries.iter().find(|e| e.task.name() == name) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        self.entries.iter().map(|e| e.status()).collect()
    }

    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.entries
            .iter()
            .find(|e| e.task.name() == name)
            .map(|e| e.status())
    }

    /// Cancel every task and wait up to the shutdown timeout for running bodies
    pub fn shutdown(&mut self) {
        for entry in &self.entries {
            entry.cancel.cancel();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.shutdown_timeout);
            log::info!("Scheduler stopped ({} tasks)", self.entries.len());
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
