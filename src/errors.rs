//! Structural and lifecycle error types.
//!
//! Handler and effect failures are not errors at this level: the router and
//! scheduler convert them into outcomes and keep running. The enums here cover
//! the failures that are fatal to the operation that detected them.

use thiserror::Error;

/// Errors raised when constructing a bounded queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// A queue must hold at least one entry.
    #[error("invalid queue capacity {0}: must be at least 1")]
    InvalidCapacity(usize),
}

/// Errors raised by the service lifecycle manager.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A service with this name is already registered.
    #[error("service already registered: {0}")]
    Duplicate(String),

    /// No service with this name is registered.
    #[error("unknown service: {0}")]
    Unknown(String),

    /// A service declares a dependency that was never registered.
    #[error("service {service} depends on unregistered service {dependency}")]
    MissingDependency { service: String, dependency: String },

    /// The dependency graph contains a cycle; none of the members can start.
    #[error("dependency cycle detected: {}", .members.join(" -> "))]
    Cycle { members: Vec<String> },

    /// Refused a non-forced stop because other services still rely on this one.
    #[error("cannot stop {service}: running dependents {}", .dependents.join(", "))]
    HasRunningDependents {
        service: String,
        dependents: Vec<String>,
    },

    /// A dependency could not be brought to RUNNING.
    #[error("cannot start {service}: dependency {dependency} failed")]
    DependencyFailed { service: String, dependency: String },

    /// The service's own start hook failed.
    #[error("start hook for {service} failed: {reason}")]
    StartFailed { service: String, reason: String },

    /// The service's own stop hook failed.
    #[error("stop hook for {service} failed: {reason}")]
    StopFailed { service: String, reason: String },

    /// Name rejected by validation.
    #[error("invalid service name: {0}")]
    InvalidName(#[from] crate::validation::NameError),
}

impl ServiceError {
    /// Names of the services in a detected cycle (empty for other variants).
    pub fn cycle_members(&self) -> &[String] {
        match self {
            ServiceError::Cycle { members } => members,
            _ => &[],
        }
    }
}

/// Errors raised while building or registering scheduled tasks.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The one-time timestamp is not a valid ISO-8601 / RFC 3339 value.
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// A field required by the schedule or task type is absent.
    #[error("task {task}: missing required field '{field}'")]
    MissingField { task: String, field: &'static str },

    /// A field has an unusable value.
    #[error("task {task}: invalid value for '{field}': {reason}")]
    InvalidField {
        task: String,
        field: &'static str,
        reason: String,
    },

    /// A configuration entry whose fields could not be read at all.
    #[error("malformed entry: {0}")]
    MalformedEntry(String),

    /// Task names are the execution-history key and must be unique.
    #[error("scheduled task already exists: {0}")]
    DuplicateTask(String),

    /// The name is held by a different owner.
    #[error("task {task} is owned by {owner}")]
    OwnerConflict { task: String, owner: String },

    /// Name rejected by validation.
    #[error("invalid task name: {0}")]
    InvalidName(#[from] crate::validation::NameError),
}

/// Errors raised by router registration calls.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid command keyword: {0}")]
    InvalidKeyword(crate::validation::NameError),

    #[error("invalid handler name: {0}")]
    InvalidName(crate::validation::NameError),
}
