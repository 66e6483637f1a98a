//! # Plugins
//!
//! A plugin is a fixed interface ([`Plugin`]) created from a factory in the
//! [`PluginRegistry`]. The gateway wraps each enabled plugin in a
//! [`PluginService`] and hands it to the lifecycle manager, so plugins start
//! after the router and scheduler (and after any plugin they name in
//! [`Plugin::dependencies`]).
//!
//! During `initialize` a plugin registers its commands, message handlers, and
//! periodic tasks through its [`PluginContext`]; everything is recorded under
//! the plugin's name. Stopping the service calls `cleanup`, removes the
//! plugin's router registrations, and disables its scheduled tasks.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use meshgate::plugin::{Plugin, PluginContext, PluginMetadata, PluginRegistry};
//! use meshgate::router::{command_fn, HandlerOutcome};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     fn metadata(&self) -> PluginMetadata {
//!         PluginMetadata::new("echo", "0.1.0", "Repeats what you send")
//!     }
//!     async fn initialize(&self, ctx: &PluginContext) -> anyhow::Result<bool> {
//!         ctx.register_command(
//!             "echo",
//!             "echo <text> - repeat text",
//!             100,
//!             command_fn(|args, _ctx| async move { HandlerOutcome::reply(args.join(" ")) }),
//!         )
//!         .await?;
//!         Ok(true)
//!     }
//! }
//!
//! let mut registry = PluginRegistry::new();
//! registry.register("echo", || Arc::new(Echo) as Arc<dyn Plugin>).unwrap();
//! ```

#[cfg(feature = "builtin-plugins")]
pub mod builtins;
pub mod session;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::errors::{RegistrationError, ScheduleError};
use crate::message::MessagePriority;
use crate::router::{panic_detail, CommandHandler, MessageHandler, MessageRouter, RouterStats};
use crate::scheduler::{PluginInvoker, Scheduler, TaskCallback, TaskSummary};
use crate::service::Service;
use crate::transport::{OutboundHandle, OutgoingMessage};
use crate::validation::validate_service_name;

pub use session::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Default handler priority for this plugin's registrations.
    pub priority: i32,
}

impl PluginMetadata {
    pub fn new(name: &str, version: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: description.to_string(),
            author: String::new(),
            priority: 100,
        }
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// What a plugin method returns to a scheduled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCallResult {
    /// Text to broadcast.
    Text(String),
    /// Broadcast `message` when `success`; otherwise only log it.
    Status { success: bool, message: String },
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    /// Other plugins that must be running first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Register handlers and prepare state. `Ok(false)` declines to start.
    async fn initialize(&self, ctx: &PluginContext) -> Result<bool>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn get_status(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Invoke a named method, typically from a scheduled task.
    async fn call(&self, method: &str, _args: &Map<String, Value>) -> Result<PluginCallResult> {
        bail!("{} has no method '{}'", self.metadata().name, method)
    }
}

/// Channel and hop limit used by [`PluginContext::send_message`].
#[derive(Debug, Clone, Copy)]
pub struct SendDefaults {
    pub channel: u32,
    pub hop_limit: u8,
}

impl Default for SendDefaults {
    fn default() -> Self {
        Self {
            channel: 0,
            hop_limit: 3,
        }
    }
}

/// The core facilities a plugin may use, scoped to that plugin.
#[derive(Clone)]
pub struct PluginContext {
    owner: String,
    router: Arc<MessageRouter>,
    scheduler: Arc<Scheduler>,
    outbound: OutboundHandle,
    settings: toml::Table,
    defaults: SendDefaults,
    started_at: DateTime<Utc>,
}

impl PluginContext {
    pub fn new(
        owner: &str,
        router: Arc<MessageRouter>,
        scheduler: Arc<Scheduler>,
        outbound: OutboundHandle,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            router,
            scheduler,
            outbound,
            settings: toml::Table::new(),
            defaults: SendDefaults::default(),
            started_at: Utc::now(),
        }
    }

    pub fn with_settings(mut self, settings: toml::Table) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_defaults(mut self, defaults: SendDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// When the plugin's service last started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Typed value from this plugin's `[plugins.settings.<name>]` table.
    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.settings.get(key)?.clone();
        match value.try_into() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{}: ignoring setting {}: {}", self.owner, key, e);
                None
            }
        }
    }

    pub async fn register_command(
        &self,
        keyword: &str,
        help: &str,
        priority: i32,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistrationError> {
        self.router
            .register_command(&self.owner, keyword, help, priority, handler)
            .await
    }

    pub async fn register_message_handler(
        &self,
        name: &str,
        priority: i32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistrationError> {
        self.router
            .register_message_handler(&self.owner, name, priority, handler)
            .await
    }

    pub async fn register_scheduled_task(
        &self,
        name: &str,
        interval_seconds: u64,
        callback: Arc<dyn TaskCallback>,
    ) -> Result<(), ScheduleError> {
        self.scheduler
            .register_plugin_task(&self.owner, name, interval_seconds, callback)
            .await
    }

    /// Queue a message: direct when `recipient_id` is set, else a broadcast
    /// on the default channel. `hop_limit` falls back to the gateway default.
    pub fn send_message(
        &self,
        content: &str,
        recipient_id: Option<&str>,
        priority: MessagePriority,
        hop_limit: Option<u8>,
    ) -> Result<()> {
        let msg = match recipient_id {
            Some(to) => OutgoingMessage::direct(to, content, self.defaults.channel),
            None => OutgoingMessage::broadcast(content, self.defaults.channel),
        };
        self.outbound.send(
            msg.with_priority(priority)
                .with_hop_limit(hop_limit.unwrap_or(self.defaults.hop_limit)),
        )
    }

    /// Read-only handle for handlers that report on the core. It holds weak
    /// references, so a handler stored in the router does not keep it alive.
    pub fn view(&self) -> CoreView {
        CoreView {
            router: Arc::downgrade(&self.router),
            scheduler: Arc::downgrade(&self.scheduler),
            started_at: self.started_at,
        }
    }
}

/// See [`PluginContext::view`]. Queries against a dropped component return
/// empty results.
#[derive(Clone)]
pub struct CoreView {
    router: Weak<MessageRouter>,
    scheduler: Weak<Scheduler>,
    started_at: DateTime<Utc>,
}

impl CoreView {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn command_help(&self) -> BTreeMap<String, String> {
        match self.router.upgrade() {
            Some(router) => router.command_help().await,
            None => BTreeMap::new(),
        }
    }

    pub async fn router_stats(&self) -> RouterStats {
        match self.router.upgrade() {
            Some(router) => router.get_stats().await,
            None => RouterStats::default(),
        }
    }

    pub async fn task_summaries(&self) -> Vec<TaskSummary> {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.get_active_tasks_summary().await,
            None => Vec::new(),
        }
    }
}

type Factory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Name-keyed plugin factories.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, Factory>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the plugins bundled with the crate.
    pub fn with_builtins() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "builtin-plugins")]
        builtins::register_all(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistrationError>
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        let name = validate_service_name(name).map_err(RegistrationError::InvalidName)?;
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            debug!("Plugin factory {} replaced", name);
        }
        Ok(())
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Plugins that are currently running, for scheduled plugin calls.
#[derive(Default)]
pub struct LivePlugins {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl LivePlugins {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, name: &str, plugin: Arc<dyn Plugin>) {
        self.plugins.write().await.insert(name.to_string(), plugin);
    }

    async fn remove(&self, name: &str) {
        self.plugins.write().await.remove(name);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// `get_status` of every running plugin, by name.
    pub async fn statuses(&self) -> BTreeMap<String, Map<String, Value>> {
        let plugins: Vec<(String, Arc<dyn Plugin>)> = self
            .plugins
            .read()
            .await
            .iter()
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect();
        let mut out = BTreeMap::new();
        for (name, plugin) in plugins {
            out.insert(name, plugin.get_status().await);
        }
        out
    }
}

#[async_trait]
impl PluginInvoker for LivePlugins {
    async fn invoke(
        &self,
        plugin: &str,
        method: &str,
        args: &Map<String, Value>,
    ) -> Result<PluginCallResult> {
        let target = self
            .get(plugin)
            .await
            .ok_or_else(|| anyhow!("plugin {} is not running", plugin))?;
        target.call(method, args).await
    }
}

/// Lifecycle adapter: runs a plugin's hooks under the service manager.
pub struct PluginService {
    plugin: Arc<dyn Plugin>,
    ctx: PluginContext,
    live: Arc<LivePlugins>,
}

impl PluginService {
    pub fn new(plugin: Arc<dyn Plugin>, ctx: PluginContext, live: Arc<LivePlugins>) -> Self {
        Self { plugin, ctx, live }
    }

    pub fn metadata(&self) -> PluginMetadata {
        self.plugin.metadata()
    }

    pub fn dependencies(&self) -> Vec<String> {
        self.plugin.dependencies()
    }

    async fn release(&self) {
        let owner = self.ctx.owner();
        self.live.remove(owner).await;
        self.ctx.router.unregister_owner(owner).await;
        self.ctx.scheduler.disable_owner(owner).await;
    }
}

#[async_trait]
impl Service for PluginService {
    async fn start(&self) -> Result<()> {
        let meta = self.plugin.metadata();
        let mut ctx = self.ctx.clone();
        ctx.started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.plugin.initialize(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow!("initialize panicked: {}", panic_detail(panic.as_ref())))
            });
        match outcome {
            Ok(true) => {
                self.live.insert(self.ctx.owner(), self.plugin.clone()).await;
                info!("Plugin {} v{} initialized", meta.name, meta.version);
                Ok(())
            }
            Ok(false) => {
                self.release().await;
                bail!("plugin {} declined to initialize", meta.name)
            }
            Err(e) => {
                self.release().await;
                Err(e.context(format!("plugin {} failed to initialize", meta.name)))
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let result = self.plugin.cleanup().await;
        self.release().await;
        if let Err(e) = &result {
            warn!("Plugin {} cleanup failed: {e:#}", self.ctx.owner());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{command_fn, HandlerOutcome, RouterConfig};
    use crate::scheduler::{task_fn, SchedulerConfig};
    use crate::transport::{Outbound, OutboundConfig};

    struct Sample {
        accept: bool,
    }

    #[async_trait]
    impl Plugin for Sample {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("sample", "1.0.0", "test plugin").author("tests")
        }

        async fn initialize(&self, ctx: &PluginContext) -> Result<bool> {
            ctx.register_command(
                "hello",
                "hello - greet",
                100,
                command_fn(|_a, c| async move { HandlerOutcome::reply(format!("hi {}", c.sender_id)) }),
            )
            .await?;
            ctx.register_scheduled_task("sample-tick", 60, task_fn(|| async { Ok(()) }))
                .await?;
            Ok(self.accept)
        }

        async fn call(&self, method: &str, args: &Map<String, Value>) -> Result<PluginCallResult> {
            match method {
                "shout" => Ok(PluginCallResult::Text(
                    args.get("text").and_then(Value::as_str).unwrap_or("").to_uppercase(),
                )),
                _ => bail!("no method {method}"),
            }
        }
    }

    #[derive(Default)]
    struct Stamp {
        seen: std::sync::Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl Plugin for Stamp {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("stamp", "1.0.0", "records its start time")
        }

        async fn initialize(&self, ctx: &PluginContext) -> Result<bool> {
            self.seen.lock().unwrap().push(ctx.started_at());
            Ok(true)
        }
    }

    fn parts() -> (Arc<MessageRouter>, Arc<Scheduler>, Outbound) {
        let outbound = Outbound::new(OutboundConfig::default()).unwrap();
        let router = Arc::new(MessageRouter::new(RouterConfig::default(), outbound.handle()).unwrap());
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default(), outbound.handle()));
        (router, scheduler, outbound)
    }

    #[tokio::test]
    async fn start_time_is_taken_when_the_service_starts() {
        let (router, scheduler, outbound) = parts();
        let ctx = PluginContext::new("stamp", router, scheduler, outbound.handle());
        let built_at = ctx.started_at();
        let plugin = Arc::new(Stamp::default());
        let svc = PluginService::new(plugin.clone(), ctx, Arc::new(LivePlugins::new()));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        svc.start().await.unwrap();
        svc.stop().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        svc.start().await.unwrap();

        let seen = plugin.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0] > built_at);
        assert!(seen[1] > seen[0]);
    }

    #[tokio::test]
    async fn service_registers_then_releases_everything() {
        let (router, scheduler, outbound) = parts();
        let live = Arc::new(LivePlugins::new());
        let ctx = PluginContext::new("sample", router.clone(), scheduler.clone(), outbound.handle());
        let svc = PluginService::new(Arc::new(Sample { accept: true }), ctx, live.clone());

        svc.start().await.unwrap();
        assert!(router.command_help().await.contains_key("hello"));
        assert!(scheduler.task("sample-tick").await.unwrap().enabled);
        assert_eq!(live.names().await, vec!["sample"]);

        let mut args = Map::new();
        args.insert("text".into(), Value::String("qrv".into()));
        assert_eq!(
            live.invoke("sample", "shout", &args).await.unwrap(),
            PluginCallResult::Text("QRV".into())
        );

        svc.stop().await.unwrap();
        assert!(router.command_help().await.is_empty());
        assert!(!scheduler.task("sample-tick").await.unwrap().enabled);
        assert!(live.invoke("sample", "shout", &args).await.is_err());
    }

    #[tokio::test]
    async fn declined_initialize_fails_start_and_cleans_up() {
        let (router, scheduler, outbound) = parts();
        let live = Arc::new(LivePlugins::new());
        let ctx = PluginContext::new("sample", router.clone(), scheduler, outbound.handle());
        let svc = PluginService::new(Arc::new(Sample { accept: false }), ctx, live.clone());
        assert!(svc.start().await.is_err());
        assert!(router.command_help().await.is_empty());
        assert!(live.names().await.is_empty());
    }

    #[test]
    fn registry_creates_by_name() {
        let mut registry = PluginRegistry::new();
        registry
            .register("sample", || Arc::new(Sample { accept: true }) as Arc<dyn Plugin>)
            .unwrap();
        assert!(registry.contains("sample"));
        assert_eq!(registry.create("sample").unwrap().metadata().author, "tests");
        assert!(registry.create("missing").is_none());
        assert!(registry.register("bad name", || Arc::new(Sample { accept: true }) as Arc<dyn Plugin>).is_err());
    }

    #[test]
    fn settings_are_typed() {
        let (router, scheduler, outbound) = parts();
        let settings: toml::Table = toml::from_str("max_posts_per_board = 25\nboards = [\"a\", \"b\"]").unwrap();
        let ctx = PluginContext::new("bulletin", router, scheduler, outbound.handle()).with_settings(settings);
        assert_eq!(ctx.setting::<usize>("max_posts_per_board"), Some(25));
        assert_eq!(ctx.setting::<Vec<String>>("boards"), Some(vec!["a".into(), "b".into()]));
        assert_eq!(ctx.setting::<String>("max_posts_per_board"), None);
        assert_eq!(ctx.setting::<u32>("absent"), None);
    }
}
