//! Scheduled broadcasts from configuration.
//!
//! Each `[[scheduled_broadcasts]]` entry becomes one [`ScheduledTask`]. A
//! broken entry (missing schedule field, bad cron syntax, unparsable
//! timestamp, reused name) is skipped with a warning and the rest still load.

use log::warn;
use std::collections::HashSet;

use super::{check_interval, Delivery, Schedule, ScheduledTask, TaskEffect};
use crate::config::ScheduledBroadcastConfig;
use crate::errors::ScheduleError;
use crate::message::MessagePriority;
use crate::transport::OutgoingMessage;
use crate::validation::validate_task_name;

/// Values used when an entry leaves channel or hop limit unset.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastDefaults {
    pub channel: u32,
    pub hop_limit: u8,
}

impl Default for BroadcastDefaults {
    fn default() -> Self {
        Self {
            channel: 0,
            hop_limit: 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub tasks: Vec<ScheduledTask>,
    /// `(entry name, reason)` for every entry that was not loaded.
    pub skipped: Vec<(String, String)>,
}

/// Build tasks from every raw entry, skipping the malformed ones.
pub fn load_broadcasts(entries: &[toml::Value], defaults: BroadcastDefaults) -> LoadReport {
    let mut report = LoadReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    for (i, raw) in entries.iter().enumerate() {
        let label = match raw.get("name").and_then(toml::Value::as_str) {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => format!("#{}", i + 1),
        };
        let built = ScheduledBroadcastConfig::from_value(raw)
            .map_err(|e| ScheduleError::MalformedEntry(e.to_string().trim().to_string()))
            .and_then(|entry| build_task(&entry, defaults))
            .and_then(|task| {
                if seen.contains(&task.name) {
                    Err(ScheduleError::DuplicateTask(task.name))
                } else {
                    Ok(task)
                }
            });
        match built {
            Ok(task) => {
                seen.insert(task.name.clone());
                report.tasks.push(task);
            }
            Err(e) => {
                warn!("Skipping scheduled broadcast {}: {}", label, e);
                report.skipped.push((label, e.to_string()));
            }
        }
    }
    report
}

/// Build one task, or say why the entry is unusable.
pub fn build_task(
    entry: &ScheduledBroadcastConfig,
    defaults: BroadcastDefaults,
) -> Result<ScheduledTask, ScheduleError> {
    let name = validate_task_name(&entry.name)?;
    let missing = |field: &'static str| ScheduleError::MissingField {
        task: name.clone(),
        field,
    };

    let schedule = match entry.schedule_type.trim().to_lowercase().as_str() {
        "cron" => {
            let expr = entry
                .cron_expression
                .as_deref()
                .ok_or_else(|| missing("cron_expression"))?;
            Schedule::cron(expr)?
        }
        "interval" => {
            let seconds = entry
                .interval_seconds
                .ok_or_else(|| missing("interval_seconds"))?;
            check_interval(&name, seconds)?;
            Schedule::interval(seconds)
        }
        "one_time" | "onetime" | "once" => {
            let at = entry
                .scheduled_time
                .as_deref()
                .ok_or_else(|| missing("scheduled_time"))?;
            Schedule::one_time(Schedule::parse_timestamp(at)?)
        }
        other => {
            return Err(ScheduleError::InvalidField {
                task: name,
                field: "schedule_type",
                reason: format!("unknown schedule type '{other}'"),
            })
        }
    };

    let priority = match entry.priority.as_deref() {
        None => MessagePriority::Normal,
        Some(p) => MessagePriority::parse(p).ok_or_else(|| ScheduleError::InvalidField {
            task: name.clone(),
            field: "priority",
            reason: format!("unknown priority '{p}'"),
        })?,
    };
    let channel = entry.channel.unwrap_or(defaults.channel);
    let hop_limit = entry.hop_limit.unwrap_or(defaults.hop_limit);

    let has_plugin = entry.plugin_name.is_some() || entry.plugin_method.is_some();
    let kinds = [entry.message.is_some(), has_plugin, entry.command.is_some()]
        .iter()
        .filter(|&&set| set)
        .count();
    if kinds != 1 {
        return Err(ScheduleError::InvalidField {
            task: name,
            field: "message",
            reason: "exactly one of message, plugin_name/plugin_method, or command is required"
                .to_string(),
        });
    }

    let effect = if let Some(text) = &entry.message {
        TaskEffect::Broadcast(
            OutgoingMessage::broadcast(text.clone(), channel)
                .with_priority(priority)
                .with_hop_limit(hop_limit),
        )
    } else if let Some(command) = &entry.command {
        TaskEffect::ShellCommand(command.clone())
    } else {
        let plugin = entry.plugin_name.clone().ok_or_else(|| missing("plugin_name"))?;
        let method = entry
            .plugin_method
            .clone()
            .ok_or_else(|| missing("plugin_method"))?;
        TaskEffect::PluginCall {
            plugin,
            method,
            args: entry.plugin_args.clone().unwrap_or_default(),
            delivery: Delivery {
                channel,
                priority,
                hop_limit,
            },
        }
    };

    let mut task = ScheduledTask::new(name, schedule, effect);
    task.enabled = entry.enabled;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ScheduleType, TaskType};

    fn entry(name: &str, schedule_type: &str) -> ScheduledBroadcastConfig {
        ScheduledBroadcastConfig {
            name: name.to_string(),
            schedule_type: schedule_type.to_string(),
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn builds_each_schedule_kind() {
        let mut cron = entry("morning", "cron");
        cron.cron_expression = Some("0 8 * * *".into());
        cron.message = Some("Good morning mesh".into());
        cron.priority = Some("high".into());
        let task = build_task(&cron, BroadcastDefaults::default()).unwrap();
        assert_eq!(task.schedule_type(), ScheduleType::Cron);
        match &task.effect {
            TaskEffect::Broadcast(msg) => {
                assert_eq!(msg.priority, MessagePriority::High);
                assert_eq!(msg.hop_limit, 3);
            }
            other => panic!("unexpected effect {other:?}"),
        }

        let mut digest = entry("digest", "interval");
        digest.interval_seconds = Some(3600);
        digest.plugin_name = Some("bulletin".into());
        digest.plugin_method = Some("digest".into());
        digest.channel = Some(2);
        let task = build_task(&digest, BroadcastDefaults::default()).unwrap();
        assert_eq!(task.task_type(), TaskType::PluginCall);

        let mut once = entry("net", "one_time");
        once.scheduled_time = Some("2024-01-01T00:00:00Z".into());
        once.command = Some("echo hi".into());
        let task = build_task(&once, BroadcastDefaults::default()).unwrap();
        assert_eq!(task.task_type(), TaskType::ShellCommand);
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let mut good = entry("good", "interval");
        good.interval_seconds = Some(60);
        good.message = Some("ok".into());

        let no_cron = entry("no-cron", "cron");
        let mut bad_cron = entry("bad-cron", "cron");
        bad_cron.cron_expression = Some("every tuesday".into());
        bad_cron.message = Some("x".into());
        let mut bad_time = entry("bad-time", "one_time");
        bad_time.scheduled_time = Some("soon".into());
        bad_time.message = Some("x".into());
        let mut two_effects = entry("two", "interval");
        two_effects.interval_seconds = Some(5);
        two_effects.message = Some("x".into());
        two_effects.command = Some("y".into());
        let dup = good.clone();

        let raw: Vec<toml::Value> = [good, no_cron, bad_cron, bad_time, two_effects, dup]
            .iter()
            .map(|e| e.to_value().unwrap())
            .collect();
        let report = load_broadcasts(&raw, BroadcastDefaults::default());
        assert_eq!(report.tasks.len(), 1);
        let skipped: Vec<&str> = report.skipped.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(skipped, vec!["no-cron", "bad-cron", "bad-time", "two", "good"]);
        assert!(report.skipped[0].1.contains("cron_expression"));
        assert!(report.skipped[4].1.contains("already exists"));
    }

    #[test]
    fn unreadable_entries_are_labelled_by_position() {
        let raw: Vec<toml::Value> = toml::from_str::<toml::Table>(
            r#"
            entries = [
                { schedule_type = "interval", interval_seconds = 60, message = "no name" },
                "not a table",
                { name = "ok", schedule_type = "interval", interval_seconds = 60, message = "hi" },
            ]
            "#,
        )
        .unwrap()["entries"]
            .as_array()
            .unwrap()
            .clone();
        let report = load_broadcasts(&raw, BroadcastDefaults::default());
        assert_eq!(report.tasks.len(), 1);
        let skipped: Vec<&str> = report.skipped.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(skipped, vec!["#1", "#2"]);
        assert!(report.skipped[0].1.starts_with("malformed entry"));
    }
}
