use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use meshgate::errors::ServiceError;
use meshgate::service::{Service, ServiceManager, ServiceState};

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: &'static str,
    journal: Journal,
    broken: bool,
}

#[async_trait]
impl Service for Recorder {
    async fn start(&self) -> Result<()> {
        self.journal.lock().unwrap().push(format!("+{}", self.name));
        if self.broken {
            bail!("{} could not open its device", self.name);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.journal.lock().unwrap().push(format!("-{}", self.name));
        Ok(())
    }
}

async fn add(manager: &ServiceManager, journal: &Journal, name: &'static str, deps: &[&str], broken: bool) {
    manager
        .register_service(
            name,
            deps,
            Arc::new(Recorder {
                name,
                journal: journal.clone(),
                broken,
            }),
        )
        .await
        .unwrap();
}

fn index(journal: &Journal, entry: &str) -> usize {
    journal
        .lock()
        .unwrap()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not in journal"))
}

/// outbound <- router <- core <- bulletin, outbound <- scheduler <- core
async fn gateway_shape(journal: &Journal) -> ServiceManager {
    let manager = ServiceManager::new();
    // registered out of order on purpose
    add(&manager, journal, "bulletin", &["core"], false).await;
    add(&manager, journal, "core", &["router", "scheduler"], false).await;
    add(&manager, journal, "scheduler", &["outbound"], false).await;
    add(&manager, journal, "router", &["outbound"], false).await;
    add(&manager, journal, "outbound", &[], false).await;
    manager
}

#[tokio::test]
async fn startup_respects_every_edge_and_shutdown_reverses_it() {
    let journal = Journal::default();
    let manager = gateway_shape(&journal).await;

    let report = manager.start_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.started.len(), 5);

    for (dep, svc) in [
        ("outbound", "router"),
        ("outbound", "scheduler"),
        ("router", "core"),
        ("scheduler", "core"),
        ("core", "bulletin"),
    ] {
        assert!(
            index(&journal, &format!("+{dep}")) < index(&journal, &format!("+{svc}")),
            "{dep} must start before {svc}"
        );
    }

    assert!(manager.stop_all().await.is_empty());
    for (dep, svc) in [("outbound", "router"), ("core", "bulletin"), ("router", "core")] {
        assert!(
            index(&journal, &format!("-{svc}")) < index(&journal, &format!("-{dep}")),
            "{svc} must stop before {dep}"
        );
    }
    for status in manager.get_status().await {
        assert_eq!(status.state, ServiceState::Stopped, "{}", status.name);
    }
}

#[tokio::test]
async fn cycle_is_reported_with_its_members_and_nothing_starts() {
    let journal = Journal::default();
    let manager = ServiceManager::new();
    add(&manager, &journal, "a", &["b"], false).await;
    add(&manager, &journal, "b", &["c"], false).await;
    add(&manager, &journal, "c", &["a"], false).await;
    add(&manager, &journal, "free", &[], false).await;

    let err = manager.start_all().await.unwrap_err();
    let mut members = err.cycle_members().to_vec();
    members.sort();
    members.dedup();
    assert_eq!(members, vec!["a", "b", "c"]);
    assert!(journal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn broken_service_takes_down_only_its_dependents() {
    let journal = Journal::default();
    let manager = ServiceManager::new();
    add(&manager, &journal, "outbound", &[], false).await;
    add(&manager, &journal, "router", &["outbound"], true).await;
    add(&manager, &journal, "core", &["router"], false).await;
    add(&manager, &journal, "scheduler", &["outbound"], false).await;

    let report = manager.start_all().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "router");
    assert!(report.failed[0].1.contains("could not open its device"));
    assert_eq!(report.skipped, vec!["core"]);
    assert_eq!(manager.state("scheduler").await, Some(ServiceState::Running));
    assert_eq!(manager.state("router").await, Some(ServiceState::Failed));
    assert_eq!(manager.state("core").await, Some(ServiceState::Registered));

    match manager.start_service("core").await {
        Err(ServiceError::DependencyFailed { dependency, .. }) => assert_eq!(dependency, "router"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn stopping_a_dependency_needs_force() {
    let journal = Journal::default();
    let manager = gateway_shape(&journal).await;
    manager.start_all().await.unwrap();

    match manager.stop_service("core", false).await {
        Err(ServiceError::HasRunningDependents { dependents, .. }) => {
            assert_eq!(dependents, vec!["bulletin"])
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(manager.state("core").await, Some(ServiceState::Running));

    manager.stop_service("bulletin", false).await.unwrap();
    manager.stop_service("core", false).await.unwrap();
    assert_eq!(manager.state("core").await, Some(ServiceState::Stopped));

    manager.restart_service("bulletin").await.unwrap();
    assert_eq!(manager.state("core").await, Some(ServiceState::Running));
    assert_eq!(manager.state("bulletin").await, Some(ServiceState::Running));
}
