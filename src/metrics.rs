//! Process-wide counters for the dispatch and scheduling paths.
//!
//! Component-local stats (router, queue, writer) live on the components; these
//! atomics aggregate across every instance so the `status` surface can report
//! totals without holding references to each one.
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static HANDLER_ERRORS: AtomicU64 = AtomicU64::new(0);
static HANDLER_PANICS: AtomicU64 = AtomicU64::new(0);
static SCHEDULER_FIRES: AtomicU64 = AtomicU64::new(0);
static SCHEDULER_FAILURES: AtomicU64 = AtomicU64::new(0);
static SCHEDULER_MISSED: AtomicU64 = AtomicU64::new(0);
static OUTBOUND_SENT: AtomicU64 = AtomicU64::new(0);
static OUTBOUND_FAILED: AtomicU64 = AtomicU64::new(0);

static COMMAND_COUNTERS: OnceLock<Mutex<HashMap<String, CommandCounter>>> = OnceLock::new();

pub fn inc_handler_errors() {
    HANDLER_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handler_panics() {
    HANDLER_PANICS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_scheduler_fires() {
    SCHEDULER_FIRES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_scheduler_failures() {
    SCHEDULER_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_scheduler_missed() {
    SCHEDULER_MISSED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_outbound_sent() {
    OUTBOUND_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_outbound_failed() {
    OUTBOUND_FAILED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandCounter {
    pub invocations: u64,
    pub errors: u64,
}

fn command_counter_lock() -> &'static Mutex<HashMap<String, CommandCounter>> {
    COMMAND_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Count one command invocation; `failed` also bumps the error count.
pub fn record_command(keyword: &str, failed: bool) -> CommandCounter {
    let mut guard = command_counter_lock()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let counter = guard.entry(keyword.to_string()).or_default();
    counter.invocations = counter.invocations.saturating_add(1);
    if failed {
        counter.errors = counter.errors.saturating_add(1);
    }
    *counter
}

pub fn command_counters_snapshot() -> HashMap<String, CommandCounter> {
    command_counter_lock()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub handler_errors: u64,
    pub handler_panics: u64,
    pub scheduler_fires: u64,
    pub scheduler_failures: u64,
    pub scheduler_missed: u64,
    pub outbound_sent: u64,
    pub outbound_failed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        handler_errors: HANDLER_ERRORS.load(Ordering::Relaxed),
        handler_panics: HANDLER_PANICS.load(Ordering::Relaxed),
        scheduler_fires: SCHEDULER_FIRES.load(Ordering::Relaxed),
        scheduler_failures: SCHEDULER_FAILURES.load(Ordering::Relaxed),
        scheduler_missed: SCHEDULER_MISSED.load(Ordering::Relaxed),
        outbound_sent: OUTBOUND_SENT.load(Ordering::Relaxed),
        outbound_failed: OUTBOUND_FAILED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_counters_accumulate() {
        // unique key: other tests in the process also record commands
        let key = "metrics-test-keyword";
        let first = record_command(key, false);
        assert_eq!(first, CommandCounter { invocations: 1, errors: 0 });
        let second = record_command(key, true);
        assert_eq!(second, CommandCounter { invocations: 2, errors: 1 });
        assert_eq!(command_counters_snapshot().get(key), Some(&second));
    }

    #[test]
    fn snapshot_counters_are_monotonic() {
        let before = snapshot();
        inc_scheduler_fires();
        inc_handler_errors();
        let after = snapshot();
        assert!(after.scheduler_fires > before.scheduler_fires);
        assert!(after.handler_errors > before.handler_errors);
    }
}
