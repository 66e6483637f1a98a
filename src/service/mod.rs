//! # Service Lifecycle Manager
//!
//! Every long-running piece of the gateway (the outbound writer, the router,
//! the scheduler, each plugin) is a named [`Service`] with declared
//! dependencies. The [`ServiceManager`] owns the descriptor table and drives
//! each service through its state machine:
//!
//! ```text
//! Registered ─► Starting ─► Running ─► Stopping ─► Stopped
//!                  │           │                     │
//!                  └─► Failed ◄┘          Restarting ◄┘ (stop then start)
//! ```
//!
//! Startup is dependency ordered (see [`order`]); a start hook failure marks
//! the service `Failed` and its dependents are skipped, while independent
//! trees still come up. The table lock is only held around reads and writes
//! of descriptor state, never across a start or stop hook, so hooks are free
//! to take as long as their I/O needs.

pub mod order;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::ServiceError;
use crate::validation::validate_service_name;

/// A component the manager can start and stop.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Restarting,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Registered => "registered",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
            ServiceState::Restarting => "restarting",
        }
    }

    fn can_start(self) -> bool {
        matches!(
            self,
            ServiceState::Registered
                | ServiceState::Stopped
                | ServiceState::Failed
                | ServiceState::Restarting
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

struct Descriptor {
    name: String,
    dependencies: Vec<String>,
    state: ServiceState,
    service: Arc<dyn Service>,
    last_error: Option<String>,
    since: DateTime<Utc>,
}

impl Descriptor {
    fn transition(&mut self, state: ServiceState) {
        debug!("service {}: {} -> {}", self.name, self.state, state);
        self.state = state;
        self.since = Utc::now();
    }
}

/// Read-only view of one service, as reported by [`ServiceManager::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub dependencies: Vec<String>,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

/// Outcome of [`ServiceManager::start_all`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct StartupReport {
    /// Services brought to `Running`, in start order.
    pub started: Vec<String>,
    /// Services whose own start hook failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Services not attempted because a dependency did not come up.
    pub skipped: Vec<String>,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Default)]
pub struct ServiceManager {
    services: Mutex<Vec<Descriptor>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service in `Registered` state. Dependencies may name services
    /// that are registered later; they are resolved when order is computed.
    pub async fn register_service(
        &self,
        name: &str,
        dependencies: &[&str],
        service: Arc<dyn Service>,
    ) -> Result<(), ServiceError> {
        let name = validate_service_name(name)?;
        let mut table = self.services.lock().await;
        if table.iter().any(|d| d.name == name) {
            return Err(ServiceError::Duplicate(name));
        }
        let mut deps: Vec<String> = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let dep = validate_service_name(dep)?;
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        debug!("Registered service {} (deps: [{}])", name, deps.join(", "));
        table.push(Descriptor {
            name,
            dependencies: deps,
            state: ServiceState::Registered,
            service,
            last_error: None,
            since: Utc::now(),
        });
        Ok(())
    }

    async fn nodes(&self) -> Vec<order::Node> {
        self.services
            .lock()
            .await
            .iter()
            .map(|d| (d.name.clone(), d.dependencies.clone()))
            .collect()
    }

    /// Dependency-safe startup order over the current registrations.
    ///
    /// Pure with respect to the manager: repeated calls without new
    /// registrations return the same order and change no state.
    pub async fn calculate_startup_order(&self) -> Result<Vec<String>, ServiceError> {
        order::startup_order(&self.nodes().await)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.services.lock().await.iter().any(|d| d.name == name)
    }

    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.services
            .lock()
            .await
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.state)
    }

    pub async fn get_status(&self) -> Vec<ServiceStatus> {
        self.services
            .lock()
            .await
            .iter()
            .map(|d| ServiceStatus {
                name: d.name.clone(),
                state: d.state,
                dependencies: d.dependencies.clone(),
                last_error: d.last_error.clone(),
                since: d.since,
            })
            .collect()
    }

    /// Start every registered service in dependency order.
    ///
    /// A cycle or missing dependency fails the whole sequence before any hook
    /// runs. Individual start failures do not abort the sequence: dependents
    /// of a failed service are skipped and reported.
    pub async fn start_all(&self) -> Result<StartupReport, ServiceError> {
        let order = self.calculate_startup_order().await?;
        info!("Starting {} services: {}", order.len(), order.join(" -> "));
        let deps: Vec<(String, Vec<String>)> = self.nodes().await;
        let mut down: HashSet<String> = HashSet::new();
        let mut report = StartupReport::default();

        for name in order {
            let blocked = deps
                .iter()
                .find(|(n, _)| *n == name)
                .and_then(|(_, ds)| ds.iter().find(|d| down.contains(*d)).cloned());
            if let Some(dep) = blocked {
                warn!("Skipping service {}: dependency {} is not running", name, dep);
                down.insert(name.clone());
                report.skipped.push(name);
                continue;
            }
            match self.start_one(&name).await {
                Ok(()) => report.started.push(name),
                Err(e) => {
                    down.insert(name.clone());
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Bring `name` to `Running`, starting its dependencies first.
    ///
    /// No-op if the service is already running or starting.
    pub async fn start_service(&self, name: &str) -> Result<(), ServiceError> {
        match self.state(name).await {
            None => return Err(ServiceError::Unknown(name.to_string())),
            Some(ServiceState::Running | ServiceState::Starting) => return Ok(()),
            Some(_) => {}
        }
        let closure = order::dependency_closure(&self.nodes().await, name)?;
        for dep in closure.iter().filter(|d| d.as_str() != name) {
            if let Err(e) = self.start_one(dep).await {
                warn!("Cannot start {}: dependency {} failed: {}", name, dep, e);
                return Err(ServiceError::DependencyFailed {
                    service: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
        self.start_one(name).await
    }

    /// Run one service's start hook; dependencies are the caller's concern.
    async fn start_one(&self, name: &str) -> Result<(), ServiceError> {
        let service = {
            let mut table = self.services.lock().await;
            let d = table
                .iter_mut()
                .find(|d| d.name == name)
                .ok_or_else(|| ServiceError::Unknown(name.to_string()))?;
            if matches!(d.state, ServiceState::Running | ServiceState::Starting) {
                return Ok(());
            }
            if !d.state.can_start() {
                return Err(ServiceError::StartFailed {
                    service: name.to_string(),
                    reason: format!("service is {}", d.state),
                });
            }
            d.transition(ServiceState::Starting);
            d.service.clone()
        };

        info!("Starting service {}", name);
        let result = service.start().await;

        let mut table = self.services.lock().await;
        let Some(d) = table.iter_mut().find(|d| d.name == name) else {
            return Err(ServiceError::Unknown(name.to_string()));
        };
        match result {
            Ok(()) => {
                d.last_error = None;
                d.transition(ServiceState::Running);
                info!("Service {} running", name);
                Ok(())
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!("Service {} failed to start: {}", name, reason);
                d.last_error = Some(reason.clone());
                d.transition(ServiceState::Failed);
                Err(ServiceError::StartFailed {
                    service: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Stop a running service. Without `force`, a service that still has
    /// running dependents is refused. Stopping a service that is not running
    /// is a no-op.
    pub async fn stop_service(&self, name: &str, force: bool) -> Result<(), ServiceError> {
        let service = {
            let mut table = self.services.lock().await;
            let idx = table
                .iter()
                .position(|d| d.name == name)
                .ok_or_else(|| ServiceError::Unknown(name.to_string()))?;
            if table[idx].state != ServiceState::Running {
                return Ok(());
            }
            if !force {
                let dependents: Vec<String> = table
                    .iter()
                    .filter(|d| {
                        matches!(d.state, ServiceState::Running | ServiceState::Starting)
                            && d.dependencies.iter().any(|dep| dep == name)
                    })
                    .map(|d| d.name.clone())
                    .collect();
                if !dependents.is_empty() {
                    return Err(ServiceError::HasRunningDependents {
                        service: name.to_string(),
                        dependents,
                    });
                }
            }
            let d = &mut table[idx];
            d.transition(ServiceState::Stopping);
            d.service.clone()
        };

        info!("Stopping service {}", name);
        let result = service.stop().await;

        let mut table = self.services.lock().await;
        let Some(d) = table.iter_mut().find(|d| d.name == name) else {
            return Err(ServiceError::Unknown(name.to_string()));
        };
        match result {
            Ok(()) => {
                d.transition(ServiceState::Stopped);
                info!("Service {} stopped", name);
                Ok(())
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!("Service {} failed to stop cleanly: {}", name, reason);
                d.last_error = Some(reason.clone());
                d.transition(ServiceState::Failed);
                Err(ServiceError::StopFailed {
                    service: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Forced stop followed by a start. A stop failure does not prevent the
    /// start attempt; it is returned once the start has been tried.
    pub async fn restart_service(&self, name: &str) -> Result<(), ServiceError> {
        let stop_result = self.stop_service(name, true).await;
        if let Err(ServiceError::Unknown(_)) = stop_result {
            return stop_result;
        }
        if let Err(e) = &stop_result {
            warn!("Restart of {}: stop failed ({}); starting anyway", name, e);
        }
        {
            let mut table = self.services.lock().await;
            if let Some(d) = table.iter_mut().find(|d| d.name == name) {
                d.transition(ServiceState::Restarting);
            }
        }
        self.start_service(name).await?;
        stop_result
    }

    /// Stop every running service, dependents before their dependencies.
    ///
    /// Errors are collected per service; one failure does not stop the rest.
    pub async fn stop_all(&self) -> Vec<(String, ServiceError)> {
        let order = match self.calculate_startup_order().await {
            Ok(order) => order,
            // A graph that never started cleanly: fall back to registration order.
            Err(_) => self.nodes().await.into_iter().map(|(n, _)| n).collect(),
        };
        let mut errors = Vec::new();
        for name in order.into_iter().rev() {
            if self.state(&name).await != Some(ServiceState::Running) {
                continue;
            }
            if let Err(e) = self.stop_service(&name, true).await {
                errors.push((name, e));
            }
        }
        errors
    }
}
