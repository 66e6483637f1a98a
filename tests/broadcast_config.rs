use meshgate::config::Config;
use meshgate::gateway::Gateway;
use meshgate::scheduler::broadcast::{load_broadcasts, BroadcastDefaults};
use meshgate::scheduler::{ScheduleType, TaskEffect, TaskType};

const BROADCASTS: &str = r#"
[gateway]
default_channel = 3
default_hop_limit = 4

[[scheduled_broadcasts]]
name = "morning"
schedule_type = "cron"
cron_expression = "0 8 * * *"
message = "Good morning mesh"

[[scheduled_broadcasts]]
name = "weekly-net"
schedule_type = "cron"
cron_expression = "0 0 19 * * Wed"
priority = "high"
hop_limit = 6
message = "Weekly net starting"

[[scheduled_broadcasts]]
name = "digest"
schedule_type = "interval"
interval_seconds = 3600
plugin_name = "bulletin"
plugin_method = "digest"
plugin_args = { board = "general" }

[[scheduled_broadcasts]]
name = "field-day"
schedule_type = "one_time"
scheduled_time = "2030-06-22T18:00:00"
message = "Field day begins"

[[scheduled_broadcasts]]
name = "typo"
schedule_type = "cron"
cron_expression = "0 8 * *"
message = "never loads"

[[scheduled_broadcasts]]
name = "no-time"
schedule_type = "one_time"
message = "never loads"

[[scheduled_broadcasts]]
name = "morning"
schedule_type = "interval"
interval_seconds = 60
message = "duplicate name"

[[scheduled_broadcasts]]
name = "hourly"
schedule_type = "fortnightly"
message = "unknown type"
"#;

#[test]
fn loader_keeps_good_entries_and_reports_the_rest() {
    let config: Config = toml::from_str(BROADCASTS).unwrap();
    let report = load_broadcasts(&config.scheduled_broadcasts, config.broadcast_defaults());

    let loaded: Vec<&str> = report.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(loaded, vec!["morning", "weekly-net", "digest", "field-day"]);
    let skipped: Vec<&str> = report.skipped.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(skipped, vec!["typo", "no-time", "morning", "hourly"]);

    let kinds: Vec<(ScheduleType, TaskType)> = report
        .tasks
        .iter()
        .map(|t| (t.schedule_type(), t.task_type()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (ScheduleType::Cron, TaskType::Broadcast),
            (ScheduleType::Cron, TaskType::Broadcast),
            (ScheduleType::Interval, TaskType::PluginCall),
            (ScheduleType::OneTime, TaskType::Broadcast),
        ]
    );
}

#[test]
fn gateway_defaults_fill_unset_delivery_fields() {
    let config: Config = toml::from_str(BROADCASTS).unwrap();
    let report = load_broadcasts(&config.scheduled_broadcasts, config.broadcast_defaults());

    match &report.tasks[0].effect {
        TaskEffect::Broadcast(msg) => {
            assert_eq!(msg.channel, 3);
            assert_eq!(msg.hop_limit, 4);
        }
        other => panic!("unexpected {other:?}"),
    }
    match &report.tasks[1].effect {
        TaskEffect::Broadcast(msg) => assert_eq!(msg.hop_limit, 6),
        other => panic!("unexpected {other:?}"),
    }
    match &report.tasks[2].effect {
        TaskEffect::PluginCall { args, delivery, .. } => {
            assert_eq!(delivery.channel, 3);
            assert_eq!(args.get("board").and_then(|v| v.as_str()), Some("general"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let fallback = load_broadcasts(&config.scheduled_broadcasts[..1], BroadcastDefaults::default());
    match &fallback.tasks[0].effect {
        TaskEffect::Broadcast(msg) => assert_eq!(msg.channel, 0),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn gateway_registers_loaded_broadcasts_with_the_scheduler() {
    let mut config: Config = toml::from_str(BROADCASTS).unwrap();
    config.logging.file = None;
    let gateway = Gateway::new(config).await.unwrap();

    let scheduler = gateway.scheduler();
    assert_eq!(scheduler.task_count().await, 4);
    assert_eq!(gateway.skipped_broadcasts().len(), 4);

    let summary = scheduler.get_active_tasks_summary().await;
    let field_day = summary.iter().find(|t| t.name == "field-day").unwrap();
    assert_eq!(field_day.next_run.map(|t| t.to_rfc3339()).as_deref(), Some("2030-06-22T18:00:00+00:00"));
    assert!(summary.iter().all(|t| t.owner.is_none()));
}

#[tokio::test]
async fn one_bad_entry_does_not_sink_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[[scheduled_broadcasts]]
name = "beacon"
schedule_type = "interval"
interval_seconds = 600
message = "QRV on 0"

[[scheduled_broadcasts]]
name = "untyped"
interval_seconds = 60
message = "no schedule_type"

[[scheduled_broadcasts]]
name = "wordy"
schedule_type = "interval"
interval_seconds = "sixty"
message = "wrong type"
"#,
    )
    .unwrap();

    let config = Config::load(path.to_str().unwrap()).await.unwrap();
    let report = load_broadcasts(&config.scheduled_broadcasts, config.broadcast_defaults());
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].name, "beacon");
    let skipped: Vec<&str> = report.skipped.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(skipped, vec!["untyped", "wordy"]);
    assert!(report.skipped[0].1.contains("schedule_type"));
    assert!(report.skipped[1].1.contains("sixty"));
}
