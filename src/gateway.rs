//! # Gateway
//!
//! Wires configuration into running components. Construction builds the
//! outbound writer, router, and scheduler, creates every enabled plugin from
//! the registry, loads the scheduled broadcasts, and registers all of it with
//! one [`ServiceManager`]:
//!
//! ```text
//! outbound <- router    <- core <- bulletin
//!          <- scheduler <-/
//! ```
//!
//! Nothing runs until [`Gateway::start`]; [`Gateway::shutdown`] stops
//! services in reverse order.
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//! use meshgate::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let gateway = Gateway::new(config).await?;
//!     gateway.run().await
//! }
//! ```

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::message::Message;
use crate::metrics;
use crate::plugin::{LivePlugins, PluginContext, PluginMetadata, PluginRegistry, PluginService};
use crate::router::{MessageRouter, RouterStats};
use crate::scheduler::broadcast::load_broadcasts;
use crate::scheduler::{Scheduler, TaskSummary};
use crate::service::{Service, ServiceManager, ServiceStatus, StartupReport};
use crate::transport::{LogTransport, Outbound, OutboundStats, Transport};

/// Interface id of the fallback transport used when none is attached.
pub const LOG_INTERFACE: &str = "log";

/// Services the gateway cannot run without.
const CORE_SERVICES: [&str; 3] = ["outbound", "router", "scheduler"];

/// Read-only snapshot returned by [`Gateway::status`].
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub name: String,
    pub node_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub services: Vec<ServiceStatus>,
    pub plugins: Vec<PluginMetadata>,
    pub plugin_status: BTreeMap<String, Map<String, Value>>,
    pub transports: Vec<String>,
    pub router: RouterStats,
    pub outbound: Option<OutboundStats>,
    pub tasks: Vec<TaskSummary>,
    pub skipped_broadcasts: Vec<(String, String)>,
    pub metrics: metrics::Snapshot,
}

pub struct Gateway {
    config: Config,
    services: ServiceManager,
    outbound: Arc<Outbound>,
    router: Arc<MessageRouter>,
    scheduler: Arc<Scheduler>,
    live: Arc<LivePlugins>,
    plugins: Vec<PluginMetadata>,
    skipped_broadcasts: Vec<(String, String)>,
    started_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl Gateway {
    /// Build from configuration using the bundled plugin registry.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_registry(config, PluginRegistry::with_builtins()).await
    }

    pub async fn with_registry(config: Config, registry: PluginRegistry) -> Result<Self> {
        let outbound = Arc::new(
            Outbound::new(config.outbound_config())
                .map_err(|e| anyhow!("outbound.queue_max_size: {}", e))?,
        );
        let router = Arc::new(
            MessageRouter::new(config.router_config(), outbound.handle())
                .map_err(|e| anyhow!("router.queue_max_size: {}", e))?,
        );
        let scheduler = Arc::new(Scheduler::new(config.scheduler_config(), outbound.handle()));
        let live = Arc::new(LivePlugins::new());
        scheduler.set_plugin_invoker(live.clone()).await;

        let services = ServiceManager::new();
        services
            .register_service("outbound", &[], outbound.clone() as Arc<dyn Service>)
            .await?;
        services
            .register_service("router", &["outbound"], router.clone() as Arc<dyn Service>)
            .await?;
        services
            .register_service("scheduler", &["outbound"], scheduler.clone() as Arc<dyn Service>)
            .await?;

        let mut plugins = Vec::new();
        for (name, plugin) in select_plugins(&config.plugins.enabled, &registry) {
            let ctx = PluginContext::new(&name, router.clone(), scheduler.clone(), outbound.handle())
                .with_settings(config.plugin_settings(&name))
                .with_defaults(config.send_defaults());
            let own_deps = plugin.dependencies();
            let mut deps: Vec<&str> = vec!["router", "scheduler"];
            deps.extend(own_deps.iter().map(String::as_str));
            let svc = PluginService::new(plugin, ctx, live.clone());
            let meta = svc.metadata();
            services
                .register_service(&name, &deps, Arc::new(svc) as Arc<dyn Service>)
                .await?;
            plugins.push(meta);
        }

        let report = load_broadcasts(&config.scheduled_broadcasts, config.broadcast_defaults());
        let mut skipped_broadcasts = report.skipped;
        for task in report.tasks {
            let name = task.name.clone();
            if let Err(e) = scheduler.add_task(task).await {
                warn!("Skipping scheduled broadcast {}: {}", name, e);
                skipped_broadcasts.push((name, e.to_string()));
            }
        }

        Ok(Self {
            config,
            services,
            outbound,
            router,
            scheduler,
            live,
            plugins,
            skipped_broadcasts,
            started_at: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn router(&self) -> Arc<MessageRouter> {
        self.router.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn plugins(&self) -> &[PluginMetadata] {
        &self.plugins
    }

    pub fn skipped_broadcasts(&self) -> &[(String, String)] {
        &self.skipped_broadcasts
    }

    pub async fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.outbound.add_transport(transport).await;
    }

    /// Hand an inbound message to the router, as a transport would.
    pub async fn inject(&self, message: Message, interface_id: &str) {
        self.router.process_message(message, interface_id).await;
    }

    /// Start every service in dependency order.
    ///
    /// Falls back to a [`LogTransport`] when no transport was attached. A
    /// plugin that fails to start is reported and its dependents skipped;
    /// the core services failing is an error.
    pub async fn start(&self) -> Result<StartupReport> {
        if self.outbound.transport_ids().await.is_empty() {
            warn!("No transport attached; outbound messages will only be logged");
            self.add_transport(Arc::new(LogTransport::new(LOG_INTERFACE))).await;
        }
        let report = start_services(&self.services).await?;
        *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
        info!(
            "Gateway '{}' running: {} services started, {} plugins live",
            self.config.gateway.name,
            report.started.len(),
            self.live.names().await.len()
        );
        Ok(report)
    }

    /// Stop every running service; failures are logged, not fatal.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway...");
        for (name, e) in self.services.stop_all().await {
            error!("Service {} did not stop cleanly: {}", name, e);
        }
        info!("Gateway shutdown complete");
    }

    /// Start, wait for Ctrl-C, then shut down.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow!("failed to listen for shutdown signal: {}", e))?;
        info!("Received shutdown signal");
        self.shutdown().await;
        Ok(())
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            name: self.config.gateway.name.clone(),
            node_id: self.config.gateway.node_id.clone(),
            started_at: *self
                .started_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            services: self.services.get_status().await,
            plugins: self.plugins.clone(),
            plugin_status: self.live.statuses().await,
            transports: self.outbound.transport_ids().await,
            router: self.router.get_stats().await,
            outbound: self.outbound.handle().snapshot().await,
            tasks: self.scheduler.get_active_tasks_summary().await,
            skipped_broadcasts: self.skipped_broadcasts.clone(),
            metrics: metrics::snapshot(),
        }
    }
}

/// Resolve enabled plugin names against the registry.
///
/// Unknown names are skipped, and so is any plugin whose declared
/// dependency is not itself selected; the check repeats until stable so a
/// missing plugin takes its whole dependent chain with it.
fn select_plugins(
    enabled: &[String],
    registry: &PluginRegistry,
) -> Vec<(String, Arc<dyn crate::plugin::Plugin>)> {
    let mut selected: Vec<(String, Arc<dyn crate::plugin::Plugin>)> = Vec::new();
    for name in enabled {
        if selected.iter().any(|(n, _)| n == name) {
            continue;
        }
        match registry.create(name) {
            Some(plugin) => selected.push((name.clone(), plugin)),
            None => warn!("Plugin {} is enabled but not registered; skipping", name),
        }
    }
    loop {
        let names: HashSet<String> = selected.iter().map(|(n, _)| n.clone()).collect();
        let before = selected.len();
        selected.retain(|(name, plugin)| {
            let missing: Vec<String> = plugin
                .dependencies()
                .into_iter()
                .filter(|d| !names.contains(d))
                .collect();
            if missing.is_empty() {
                true
            } else {
                warn!(
                    "Plugin {} skipped: requires plugin(s) {} which are not enabled",
                    name,
                    missing.join(", ")
                );
                false
            }
        });
        if selected.len() == before {
            return selected;
        }
    }
}

/// Start everything; if a core service fails, stop whatever did start.
async fn start_services(services: &ServiceManager) -> Result<StartupReport> {
    let report = services.start_all().await?;
    for (name, reason) in &report.failed {
        error!("Service {} failed to start: {}", name, reason);
    }
    if let Some((name, reason)) = report
        .failed
        .iter()
        .find(|(n, _)| CORE_SERVICES.contains(&n.as_str()))
    {
        for (svc, e) in services.stop_all().await {
            warn!("Rollback: stopping {} failed: {}", svc, e);
        }
        return Err(anyhow!("core service {} failed: {}", name, reason));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceState;
    use async_trait::async_trait;

    struct Part {
        fails: bool,
    }

    #[async_trait]
    impl Service for Part {
        async fn start(&self) -> Result<()> {
            if self.fails {
                anyhow::bail!("device busy");
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_core_service_rolls_back_what_started() {
        let services = ServiceManager::new();
        for (name, deps, fails) in [
            ("outbound", &[][..], false),
            ("scheduler", &["outbound"][..], false),
            ("router", &["outbound"][..], true),
        ] {
            services
                .register_service(name, deps, Arc::new(Part { fails }) as Arc<dyn Service>)
                .await
                .unwrap();
        }

        let err = start_services(&services).await.unwrap_err();
        assert!(err.to_string().contains("core service router failed"));
        assert_eq!(services.state("outbound").await, Some(ServiceState::Stopped));
        assert_eq!(services.state("scheduler").await, Some(ServiceState::Stopped));
        assert_eq!(services.state("router").await, Some(ServiceState::Failed));
    }

    #[tokio::test]
    async fn failed_plugin_is_reported_not_fatal() {
        let services = ServiceManager::new();
        services
            .register_service("outbound", &[], Arc::new(Part { fails: false }) as Arc<dyn Service>)
            .await
            .unwrap();
        services
            .register_service("weather", &["outbound"], Arc::new(Part { fails: true }) as Arc<dyn Service>)
            .await
            .unwrap();

        let report = start_services(&services).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(services.state("outbound").await, Some(ServiceState::Running));
    }

    #[test]
    fn plugin_selection_drops_missing_dependency_chains() {
        let registry = PluginRegistry::with_builtins();
        let picked = select_plugins(
            &["bulletin".into(), "nope".into(), "bulletin".into()],
            &registry,
        );
        assert!(picked.is_empty());

        let picked = select_plugins(&["core".into(), "bulletin".into()], &registry);
        let names: Vec<&str> = picked.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["core", "bulletin"]);
    }

    #[tokio::test]
    async fn zero_capacity_is_a_construction_error() {
        let mut config = Config::default();
        config.router.queue_max_size = 0;
        let err = Gateway::new(config).await.err().unwrap();
        assert!(err.to_string().contains("router.queue_max_size"));
    }

    #[tokio::test]
    async fn builds_service_graph_without_starting() {
        let gateway = Gateway::new(Config::default()).await.unwrap();
        let order = gateway.services().calculate_startup_order().await.unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("outbound") < pos("router"));
        assert!(pos("router") < pos("core"));
        assert!(pos("core") < pos("bulletin"));
        assert_eq!(
            gateway.services().state("bulletin").await,
            Some(ServiceState::Registered)
        );
        assert!(gateway.status().await.started_at.is_none());
    }
}
