//! `core` plugin: the commands every gateway answers.
//!
//! - `help [command]` lists keywords, or shows one command's help line
//! - `ping` answers `pong`
//! - `status` summarizes uptime, router counters and scheduled tasks
//!
//! It also installs a last-resort message handler that tells a node which
//! sent an unrecognized direct message to try `help`. Channel broadcasts are
//! left alone; answering every chat line on a mesh channel would flood it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::plugin::{Plugin, PluginContext, PluginMetadata};
use crate::router::{command_fn, message_fn, HandlerOutcome};

/// Runs after every other message handler.
pub const FALLBACK_PRIORITY: i32 = 1000;

#[derive(Default)]
pub struct CorePlugin {
    hints_sent: Arc<AtomicU64>,
}

impl CorePlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (d, h, m) = (seconds / 86_400, (seconds % 86_400) / 3600, (seconds % 3600) / 60);
    if d > 0 {
        format!("{d}d{h}h")
    } else if h > 0 {
        format!("{h}h{m}m")
    } else {
        format!("{m}m")
    }
}

#[async_trait]
impl Plugin for CorePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("core", env!("CARGO_PKG_VERSION"), "help, ping and status")
            .author("meshgate")
            .priority(10)
    }

    async fn initialize(&self, ctx: &PluginContext) -> Result<bool> {
        let priority = self.metadata().priority;

        let help_view = ctx.view();
        ctx.register_command(
            "help",
            "help [cmd] - list commands",
            priority,
            command_fn(move |args, _msg| {
                let view = help_view.clone();
                async move {
                    let table = view.command_help().await;
                    match args.first() {
                        Some(cmd) => match table.get(&cmd.to_lowercase()) {
                            Some(help) => HandlerOutcome::reply(help.clone()),
                            None => HandlerOutcome::reply(format!("No command '{cmd}'")),
                        },
                        None => {
                            let names: Vec<&str> = table.keys().map(String::as_str).collect();
                            HandlerOutcome::reply(format!("Commands: {}", names.join(", ")))
                        }
                    }
                }
            }),
        )
        .await?;

        ctx.register_command(
            "ping",
            "ping - check the gateway is alive",
            priority,
            command_fn(|_args, _msg| async { HandlerOutcome::reply("pong") }),
        )
        .await?;

        let status_view = ctx.view();
        ctx.register_command(
            "status",
            "status - gateway counters",
            priority,
            command_fn(move |_args, _msg| {
                let view = status_view.clone();
                async move {
                    let stats = view.router_stats().await;
                    let tasks = view.task_summaries().await;
                    let active = tasks.iter().filter(|t| t.enabled && !t.expired).count();
                    let uptime = Utc::now().signed_duration_since(view.started_at()).num_seconds();
                    HandlerOutcome::reply(format!(
                        "up {} | rx {} ok {} drop {} | tasks {}/{}",
                        format_uptime(uptime),
                        stats.messages_received,
                        stats.messages_processed,
                        stats.messages_dropped,
                        active,
                        tasks.len()
                    ))
                }
            }),
        )
        .await?;

        let hints = self.hints_sent.clone();
        ctx.register_message_handler(
            "fallback",
            FALLBACK_PRIORITY,
            message_fn(move |_msg, mctx| {
                let hints = hints.clone();
                async move {
                    if !mctx.is_direct() {
                        return HandlerOutcome::NotHandled;
                    }
                    hints.fetch_add(1, Ordering::Relaxed);
                    HandlerOutcome::reply("Unknown command. Send 'help' for a list.")
                }
            }),
        )
        .await?;
        Ok(true)
    }

    async fn get_status(&self) -> Map<String, Value> {
        let mut status = Map::new();
        status.insert(
            "hints_sent".into(),
            Value::from(self.hints_sent.load(Ordering::Relaxed)),
        );
        status
    }
}
