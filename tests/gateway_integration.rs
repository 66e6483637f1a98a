mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use meshgate::gateway::{Gateway, LOG_INTERFACE};
use meshgate::message::{Message, MessagePriority};
use meshgate::scheduler::{Delivery, Schedule, ScheduledTask, TaskEffect};
use meshgate::service::ServiceState;
use meshgate::transport::LogTransport;

use common::{quiet_config, wait_for_sent, RADIO};

async fn running_gateway() -> (Gateway, Arc<LogTransport>) {
    let gateway = Gateway::new(quiet_config()).await.unwrap();
    let radio = Arc::new(LogTransport::new(RADIO));
    gateway.add_transport(radio.clone()).await;
    let report = gateway.start().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    (gateway, radio)
}

/// Send one direct message and return the reply text.
async fn ask(gateway: &Gateway, radio: &Arc<LogTransport>, from: &str, text: &str) -> String {
    let before = radio.sent().await.len();
    gateway
        .inject(Message::new(from, text).with_recipient("!gate"), RADIO)
        .await;
    let sent = wait_for_sent(radio, before + 1).await;
    sent.get(before).cloned().unwrap_or_default()
}

fn digest_task() -> ScheduledTask {
    ScheduledTask::new(
        "bulletin-digest",
        Schedule::interval(3600),
        TaskEffect::PluginCall {
            plugin: "bulletin".into(),
            method: "digest".into(),
            args: Map::new(),
            delivery: Delivery {
                channel: 0,
                priority: MessagePriority::Normal,
                hop_limit: 3,
            },
        },
    )
}

#[tokio::test]
async fn builtin_commands_answer_over_the_radio() {
    let (gateway, radio) = running_gateway().await;

    assert_eq!(ask(&gateway, &radio, "!a1", "ping").await, "pong");
    assert_eq!(
        ask(&gateway, &radio, "!a1", "HELP").await,
        "Commands: board, boards, help, ping, post, read, status"
    );
    assert_eq!(
        ask(&gateway, &radio, "!a1", "help post").await,
        "post <text> - post to the active board"
    );
    assert!(ask(&gateway, &radio, "!a1", "status").await.starts_with("up 0m | rx 4"));
    assert_eq!(
        ask(&gateway, &radio, "!a1", "what is this").await,
        "Unknown command. Send 'help' for a list."
    );

    let status = gateway.status().await;
    assert_eq!(status.plugin_status["core"]["hints_sent"], Value::from(1));
    gateway.shutdown().await;
}

#[tokio::test]
async fn bulletin_sessions_are_per_sender() {
    let (gateway, radio) = running_gateway().await;

    assert_eq!(
        ask(&gateway, &radio, "!a1", "board swap").await,
        "No board 'swap'. Try: boards"
    );
    assert_eq!(
        ask(&gateway, &radio, "!a1", "post hello all").await,
        "Posted #1 to general"
    );
    assert_eq!(
        ask(&gateway, &radio, "!b2", "read").await,
        "general: #1 !a1: hello all"
    );
    assert_eq!(ask(&gateway, &radio, "!b2", "board").await, "Active board: general");

    let status = gateway.status().await;
    assert_eq!(status.plugin_status["bulletin"]["posts"], Value::from(1));
    gateway.shutdown().await;
}

#[tokio::test]
async fn scheduled_digest_reaches_the_live_plugin() {
    let (gateway, radio) = running_gateway().await;
    let scheduler = gateway.scheduler();
    scheduler.add_task(digest_task()).await.unwrap();

    // nothing posted yet: the plugin reports no news and nothing is sent
    let digest = "bulletin-digest".to_string();
    let report = scheduler.tick(Utc::now()).await;
    assert!(report.fired.contains(&digest));
    assert!(report.failed.is_empty());
    assert!(radio.sent().await.is_empty());

    ask(&gateway, &radio, "!a1", "post net at 7pm").await;
    let later = Utc::now() + chrono::Duration::hours(2);
    assert!(scheduler.tick(later).await.fired.contains(&digest));
    let sent = wait_for_sent(&radio, 2).await;
    assert_eq!(sent[1], "Bulletin digest: general 1");
    gateway.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_everything_and_releases_plugins() {
    let gateway = Gateway::new(quiet_config()).await.unwrap();
    gateway.start().await.unwrap();

    let status = gateway.status().await;
    assert_eq!(status.transports, vec![LOG_INTERFACE]);
    assert!(status.started_at.is_some());
    assert!(status.services.iter().all(|s| s.state == ServiceState::Running));
    let live: Vec<&String> = status.plugin_status.keys().collect();
    assert_eq!(live, vec!["bulletin", "core"]);

    gateway.shutdown().await;
    let status = gateway.status().await;
    assert!(status.services.iter().all(|s| s.state == ServiceState::Stopped));
    assert!(status.plugin_status.is_empty());
    assert!(gateway.router().command_help().await.is_empty());

    // the digest call now has no live plugin to reach
    let scheduler = gateway.scheduler();
    scheduler.add_task(digest_task()).await.unwrap();
    assert_eq!(scheduler.tick(Utc::now()).await.failed, vec!["bulletin-digest"]);

    let purge = scheduler.task("bulletin session purge").await.unwrap();
    assert!(!purge.enabled);
}
