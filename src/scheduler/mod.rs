//! # Scheduler
//!
//! Time-driven tasks, evaluated against UTC wall-clock time on a fixed poll
//! interval rather than OS cron. Three rule kinds:
//!
//! - **Cron**: due when a fire time falls after the last execution (or, on
//!   the first evaluation, inside the last poll period).
//! - **Interval**: due on first evaluation, then once `interval_seconds` have
//!   elapsed since the last execution.
//! - **One-time**: due once, at or after its timestamp and within the grace
//!   window. A task first seen after its window is marked expired and
//!   skipped for good, with one warning.
//!
//! Due tasks have `last_execution` set before their effect runs. Effects run
//! without the task table locked and a failing or panicking effect only
//! bumps that task's `failure_count`/`last_error`. Task names are unique: the
//! name is the key for execution history.

pub mod broadcast;
pub mod cron;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::errors::ScheduleError;
use crate::logutil::escape_log;
use crate::message::MessagePriority;
use crate::metrics;
use crate::plugin::PluginCallResult;
use crate::router::panic_detail;
use crate::service::Service;
use crate::transport::{OutboundHandle, OutgoingMessage};
use crate::validation::validate_task_name;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    /// Slack after a one-time fire time during which it may still fire.
    pub grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 30,
            grace_seconds: 60,
        }
    }
}

/// Longest poll period the loop will use.
pub const MAX_POLL_SECONDS: u64 = 86_400;

impl SchedulerConfig {
    fn poll_seconds(&self) -> u64 {
        self.poll_interval_seconds.clamp(1, MAX_POLL_SECONDS)
    }

    fn windows(&self) -> FireWindows {
        FireWindows {
            cron_slack: seconds(self.poll_seconds()),
            grace: seconds(self.grace_seconds),
        }
    }
}

/// Largest interval or window chrono can represent, in seconds.
pub const MAX_SCHEDULE_SECONDS: u64 = (i64::MAX / 1000) as u64;

/// Whole seconds as a chrono duration, saturating at [`MAX_SCHEDULE_SECONDS`].
fn seconds(secs: u64) -> Duration {
    let clamped = i64::try_from(secs.min(MAX_SCHEDULE_SECONDS)).unwrap_or(i64::MAX / 1000);
    Duration::try_seconds(clamped).unwrap_or(Duration::MAX)
}

/// Reject interval lengths of zero or beyond what chrono can add to a timestamp.
pub fn check_interval(task: &str, secs: u64) -> Result<(), ScheduleError> {
    let reason = if secs == 0 {
        "must be at least 1".to_string()
    } else if secs > MAX_SCHEDULE_SECONDS {
        format!("must be at most {MAX_SCHEDULE_SECONDS}")
    } else {
        return Ok(());
    };
    Err(ScheduleError::InvalidField {
        task: task.to_string(),
        field: "interval_seconds",
        reason,
    })
}

/// How far back a first cron evaluation looks, and how long a one-time task
/// may run late.
#[derive(Debug, Clone, Copy)]
pub struct FireWindows {
    pub cron_slack: Duration,
    pub grace: Duration,
}

impl Default for FireWindows {
    fn default() -> Self {
        SchedulerConfig::default().windows()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Interval,
    OneTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Broadcast,
    PluginCall,
    ShellCommand,
}

/// When a task fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron {
        expression: String,
        schedule: ::cron::Schedule,
    },
    Interval {
        seconds: u64,
    },
    OneTime {
        at: DateTime<Utc>,
    },
}

impl Schedule {
    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        Ok(Schedule::Cron {
            expression: expression.trim().to_string(),
            schedule: self::cron::parse_cron(expression)?,
        })
    }

    pub fn interval(seconds: u64) -> Self {
        Schedule::Interval { seconds }
    }

    pub fn one_time(at: DateTime<Utc>) -> Self {
        Schedule::OneTime { at }
    }

    /// Parse an RFC 3339 timestamp; one without an offset is taken as UTC.
    pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ScheduleError> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
            .map(|naive| naive.and_utc())
            .map_err(|_| ScheduleError::InvalidTimestamp(text.to_string()))
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Schedule::Cron { .. } => ScheduleType::Cron,
            Schedule::Interval { .. } => ScheduleType::Interval,
            Schedule::OneTime { .. } => ScheduleType::OneTime,
        }
    }

    fn next_run(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, .. } => self::cron::next_fire(schedule, now),
            Schedule::Interval { seconds: secs } => match last {
                Some(last) => last.checked_add_signed(seconds(*secs)),
                None => Some(now),
            },
            Schedule::OneTime { at } => last.is_none().then_some(*at),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron { expression, .. } => write!(f, "cron '{expression}'"),
            Schedule::Interval { seconds } => write!(f, "every {seconds}s"),
            Schedule::OneTime { at } => write!(f, "once at {}", at.to_rfc3339()),
        }
    }
}

/// Code a plugin registers to run on a schedule.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn run(&self) -> Result<()>;
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskCallback for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self) -> Result<()> {
        (self.0)().await
    }
}

pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskCallback>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Looks up a live plugin and calls one of its methods.
#[async_trait]
pub trait PluginInvoker: Send + Sync {
    async fn invoke(
        &self,
        plugin: &str,
        method: &str,
        args: &Map<String, Value>,
    ) -> Result<PluginCallResult>;
}

/// Where a plugin call's text goes when the call succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: u32,
    pub priority: MessagePriority,
    pub hop_limit: u8,
}

/// What a task does when it fires.
#[derive(Clone)]
pub enum TaskEffect {
    Broadcast(OutgoingMessage),
    PluginCall {
        plugin: String,
        method: String,
        args: Map<String, Value>,
        delivery: Delivery,
    },
    /// Declared but not implemented; firing records a failure.
    ShellCommand(String),
    Callback(Arc<dyn TaskCallback>),
}

impl TaskEffect {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskEffect::Broadcast(_) => TaskType::Broadcast,
            TaskEffect::PluginCall { .. } | TaskEffect::Callback(_) => TaskType::PluginCall,
            TaskEffect::ShellCommand(_) => TaskType::ShellCommand,
        }
    }
}

impl fmt::Debug for TaskEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEffect::Broadcast(msg) => f.debug_tuple("Broadcast").field(msg).finish(),
            TaskEffect::PluginCall { plugin, method, .. } => f
                .debug_struct("PluginCall")
                .field("plugin", plugin)
                .field("method", method)
                .finish_non_exhaustive(),
            TaskEffect::ShellCommand(cmd) => f.debug_tuple("ShellCommand").field(cmd).finish(),
            TaskEffect::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub name: String,
    /// Plugin that registered the task; `None` for configuration entries.
    pub owner: Option<String>,
    pub schedule: Schedule,
    pub effect: TaskEffect,
    pub enabled: bool,
    pub last_execution: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub run_count: u64,
    /// A one-time task whose window passed unfired.
    pub expired: bool,
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, schedule: Schedule, effect: TaskEffect) -> Self {
        Self {
            name: name.into(),
            owner: None,
            schedule,
            effect,
            enabled: true,
            last_execution: None,
            failure_count: 0,
            last_error: None,
            run_count: 0,
            expired: false,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.effect.task_type()
    }

    pub fn schedule_type(&self) -> ScheduleType {
        self.schedule.schedule_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    Fire,
    Wait,
    /// One-time window passed without firing.
    Missed,
}

/// Decide whether `task` fires at `now`. Pure: no state is touched.
pub fn evaluate(task: &ScheduledTask, now: DateTime<Utc>, windows: FireWindows) -> FireDecision {
    if !task.enabled || task.expired {
        return FireDecision::Wait;
    }
    match &task.schedule {
        Schedule::Cron { schedule, .. } => {
            if self::cron::is_due(schedule, task.last_execution, now, windows.cron_slack) {
                FireDecision::Fire
            } else {
                FireDecision::Wait
            }
        }
        Schedule::Interval { seconds: secs } => match task.last_execution {
            None => FireDecision::Fire,
            Some(last) if now.signed_duration_since(last) >= seconds(*secs) => FireDecision::Fire,
            Some(_) => FireDecision::Wait,
        },
        Schedule::OneTime { at } => {
            if task.last_execution.is_some() || now < *at {
                FireDecision::Wait
            } else if now.signed_duration_since(*at) <= windows.grace {
                FireDecision::Fire
            } else {
                FireDecision::Missed
            }
        }
    }
}

/// Read-only view of a task for `status` output.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub owner: Option<String>,
    pub task_type: TaskType,
    pub schedule_type: ScheduleType,
    pub schedule: String,
    pub enabled: bool,
    pub expired: bool,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

/// What one poll tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub failed: Vec<String>,
    pub missed: Vec<String>,
}

struct Inner {
    cfg: SchedulerConfig,
    tasks: Mutex<Vec<ScheduledTask>>,
    outbound: OutboundHandle,
    invoker: RwLock<Option<Arc<dyn PluginInvoker>>>,
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Poll-driven task runner; registered with the lifecycle manager as `scheduler`.
pub struct Scheduler {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, outbound: OutboundHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                tasks: Mutex::new(Vec::new()),
                outbound,
                invoker: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub async fn set_plugin_invoker(&self, invoker: Arc<dyn PluginInvoker>) {
        *self.inner.invoker.write().await = Some(invoker);
    }

    /// Add a task. A name already in use is rejected unless the same owner
    /// is re-registering it, in which case the schedule and effect are
    /// replaced, the task is re-enabled and its history kept.
    pub async fn add_task(&self, task: ScheduledTask) -> Result<(), ScheduleError> {
        let name = validate_task_name(&task.name)?;
        if let Schedule::Interval { seconds } = task.schedule {
            check_interval(&name, seconds)?;
        }
        let mut tasks = self.inner.tasks.lock().await;
        if let Some(existing) = tasks.iter_mut().find(|t| t.name == name) {
            return match (&existing.owner, &task.owner) {
                (Some(held), Some(new)) if held == new => {
                    debug!("Replacing scheduled task {} for {}", name, new);
                    existing.schedule = task.schedule;
                    existing.effect = task.effect;
                    existing.enabled = task.enabled;
                    existing.expired = false;
                    Ok(())
                }
                (Some(held), Some(_)) => Err(ScheduleError::OwnerConflict {
                    task: name,
                    owner: held.clone(),
                }),
                _ => Err(ScheduleError::DuplicateTask(name)),
            };
        }
        info!(
            "Scheduled task {} ({:?}, {})",
            name,
            task.task_type(),
            task.schedule
        );
        tasks.push(ScheduledTask { name, ..task });
        Ok(())
    }

    /// Register a plugin's periodic callback.
    pub async fn register_plugin_task(
        &self,
        owner: &str,
        name: &str,
        interval_seconds: u64,
        callback: Arc<dyn TaskCallback>,
    ) -> Result<(), ScheduleError> {
        check_interval(name, interval_seconds)?;
        let task = ScheduledTask::new(
            name,
            Schedule::interval(interval_seconds),
            TaskEffect::Callback(callback),
        )
        .with_owner(owner);
        self.add_task(task).await
    }

    /// Disable every task `owner` registered. Tasks stay in the table so a
    /// restarted plugin picks its history back up.
    pub async fn disable_owner(&self, owner: &str) -> usize {
        let mut tasks = self.inner.tasks.lock().await;
        let mut count = 0;
        for task in tasks
            .iter_mut()
            .filter(|t| t.owner.as_deref() == Some(owner) && t.enabled)
        {
            task.enabled = false;
            count += 1;
        }
        if count > 0 {
            debug!("Disabled {} scheduled tasks owned by {}", count, owner);
        }
        count
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut tasks = self.inner.tasks.lock().await;
        match tasks.iter_mut().find(|t| t.name == name) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn task(&self, name: &str) -> Option<ScheduledTask> {
        self.inner
            .tasks
            .lock()
            .await
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }

    pub async fn get_active_tasks_summary(&self) -> Vec<TaskSummary> {
        let now = Utc::now();
        self.inner
            .tasks
            .lock()
            .await
            .iter()
            .map(|t| TaskSummary {
                name: t.name.clone(),
                owner: t.owner.clone(),
                task_type: t.task_type(),
                schedule_type: t.schedule_type(),
                schedule: t.schedule.to_string(),
                enabled: t.enabled,
                expired: t.expired,
                last_execution: t.last_execution,
                next_run: if t.enabled && !t.expired {
                    t.schedule.next_run(t.last_execution, now)
                } else {
                    None
                },
                run_count: t.run_count,
                failure_count: t.failure_count,
                last_error: t.last_error.clone(),
            })
            .collect()
    }

    /// Evaluate every task once against `now` and run the due effects.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.inner.tick(now).await
    }
}

impl Inner {
    async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let windows = self.cfg.windows();
        let mut report = TickReport::default();
        let mut due: Vec<(String, TaskEffect)> = Vec::new();
        {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.iter_mut() {
                match evaluate(task, now, windows) {
                    FireDecision::Wait => {}
                    FireDecision::Fire => {
                        task.last_execution = Some(now);
                        task.run_count += 1;
                        due.push((task.name.clone(), task.effect.clone()));
                    }
                    FireDecision::Missed => {
                        task.expired = true;
                        warn!(
                            "Scheduled task {} missed its window ({}); it will not run",
                            task.name, task.schedule
                        );
                        metrics::inc_scheduler_missed();
                        report.missed.push(task.name.clone());
                    }
                }
            }
        }

        let mut failures: Vec<(String, String)> = Vec::new();
        for (name, effect) in due {
            debug!("Firing scheduled task {}", name);
            metrics::inc_scheduler_fires();
            let outcome = AssertUnwindSafe(self.run_effect(&name, &effect))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow!("effect panicked: {}", panic_detail(panic.as_ref())))
                });
            match outcome {
                Ok(()) => report.fired.push(name),
                Err(e) => {
                    let detail = format!("{e:#}");
                    error!("Scheduled task {} failed: {}", name, escape_log(&detail));
                    metrics::inc_scheduler_failures();
                    report.failed.push(name.clone());
                    failures.push((name, detail));
                }
            }
        }

        if !failures.is_empty() {
            let mut tasks = self.tasks.lock().await;
            for (name, detail) in failures {
                if let Some(task) = tasks.iter_mut().find(|t| t.name == name) {
                    task.failure_count += 1;
                    task.last_error = Some(detail);
                }
            }
        }
        report
    }

    async fn run_effect(&self, name: &str, effect: &TaskEffect) -> Result<()> {
        match effect {
            TaskEffect::Broadcast(msg) => self.outbound.send(msg.clone()),
            TaskEffect::PluginCall {
                plugin,
                method,
                args,
                delivery,
            } => {
                let invoker = self.invoker.read().await.clone();
                let Some(invoker) = invoker else {
                    bail!("no plugin registry attached");
                };
                let text = match invoker.invoke(plugin, method, args).await? {
                    PluginCallResult::Text(text) => text,
                    PluginCallResult::Status {
                        success: true,
                        message,
                    } => message,
                    PluginCallResult::Status {
                        success: false,
                        message,
                    } => {
                        warn!(
                            "Scheduled task {}: {}.{} reported failure: {}",
                            name,
                            plugin,
                            method,
                            escape_log(&message)
                        );
                        return Ok(());
                    }
                };
                if text.trim().is_empty() {
                    return Ok(());
                }
                self.outbound.send(
                    OutgoingMessage::broadcast(text, delivery.channel)
                        .with_priority(delivery.priority)
                        .with_hop_limit(delivery.hop_limit),
                )
            }
            TaskEffect::ShellCommand(cmd) => {
                warn!(
                    "Scheduled task {}: shell command effect not implemented ({})",
                    name,
                    escape_log(cmd)
                );
                bail!("shell command effect not implemented")
            }
            TaskEffect::Callback(callback) => callback.run().await,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let period = std::time::Duration::from_secs(self.cfg.poll_seconds());
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.fired.is_empty() || !report.failed.is_empty() {
                        debug!(
                            "scheduler tick: fired={} failed={} missed={}",
                            report.fired.len(),
                            report.failed.len(),
                            report.missed.len()
                        );
                    }
                }
            }
        }
        debug!("scheduler poll loop terminated");
    }
}

#[async_trait]
impl Service for Scheduler {
    async fn start(&self) -> Result<()> {
        if !self.inner.cfg.enabled {
            info!("Scheduler disabled by configuration; tasks will not fire");
            return Ok(());
        }
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let join = tokio::spawn(self.inner.clone().run(rx));
        *worker = Some(Worker { shutdown: tx, join });
        info!(
            "Scheduler started (poll every {}s, grace {}s, {} tasks)",
            self.inner.cfg.poll_seconds(),
            self.inner.cfg.grace_seconds,
            self.inner.tasks.lock().await.len()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        let _ = worker.shutdown.send(());
        worker
            .join
            .await
            .map_err(|e| anyhow!("scheduler task failed: {e}"))?;
        info!("Scheduler stopped");
        Ok(())
    }
}
