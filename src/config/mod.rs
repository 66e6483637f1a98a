//! # Configuration
//!
//! The gateway reads one TOML file. Every section has defaults, so a partial
//! file (or an empty one) is valid:
//!
//! ```toml
//! [gateway]
//! name = "meshgate"
//! default_channel = 0
//! default_hop_limit = 3
//!
//! [router]
//! queue_max_size = 1000
//!
//! [plugins]
//! enabled = ["core", "bulletin"]
//!
//! [plugins.settings.bulletin]
//! max_posts_per_board = 50
//!
//! [[scheduled_broadcasts]]
//! name = "morning"
//! schedule_type = "cron"
//! cron_expression = "0 8 * * *"
//! message = "Good morning mesh"
//! ```
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Gateway: {}", config.gateway.name);
//!     Ok(())
//! }
//! ```
//!
//! Values are not range-checked here; a zero queue size is rejected when the
//! gateway builds its queues.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::fs;

use crate::plugin::SendDefaults;
use crate::router::RouterConfig;
use crate::scheduler::broadcast::BroadcastDefaults;
use crate::scheduler::SchedulerConfig;
use crate::transport::OutboundConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub router: RouterSection,
    pub outbound: OutboundSection,
    pub scheduler: SchedulerSection,
    pub logging: LoggingConfig,
    pub plugins: PluginsConfig,
    /// Raw `[[scheduled_broadcasts]]` tables. Each one is read into a
    /// [`ScheduledBroadcastConfig`] by the broadcast loader, so a malformed
    /// entry is skipped there instead of failing the whole file.
    pub scheduled_broadcasts: Vec<toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: String,
    /// Shown in status output only.
    pub node_id: String,
    pub default_channel: u32,
    pub default_hop_limit: u8,
    /// Outbound content longer than this is split on UTF-8 boundaries.
    pub max_message_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "meshgate".to_string(),
            node_id: String::new(),
            default_channel: 0,
            default_hop_limit: 3,
            max_message_bytes: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub queue_max_size: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            queue_max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundSection {
    pub queue_max_size: usize,
    pub min_send_gap_ms: u64,
    /// 0 disables the periodic stats line.
    pub stats_interval_ms: u64,
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            queue_max_size: 500,
            min_send_gap_ms: 2000,
            stats_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    /// Also how far back a cron task looks on its first evaluation.
    pub poll_interval_seconds: u64,
    /// How late a one-time task may still fire.
    pub grace_seconds: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 30,
            grace_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshgate.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugins to create from the registry, by name.
    pub enabled: Vec<String>,
    /// Per-plugin tables, handed to the plugin as its settings.
    pub settings: HashMap<String, toml::Table>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["core".to_string(), "bulletin".to_string()],
            settings: HashMap::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One `[[scheduled_broadcasts]]` entry.
///
/// `schedule_type` selects which of `cron_expression`, `interval_seconds`,
/// or `scheduled_time` must be present. Exactly one of `message`,
/// `plugin_name`/`plugin_method`, or `command` names the effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledBroadcastConfig {
    pub name: String,
    pub schedule_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    /// ISO-8601 timestamp; without an offset it is read as UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_limit: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_args: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduledBroadcastConfig {
    /// Read one raw entry; missing or mistyped fields are reported, not panicked on.
    pub fn from_value(value: &toml::Value) -> Result<Self, toml::de::Error> {
        value.clone().try_into()
    }

    pub fn to_value(&self) -> Result<toml::Value> {
        toml::Value::try_from(self)
            .map_err(|e| anyhow!("Failed to serialize scheduled broadcast {}: {}", self.name, e))
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default_with_example()?)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Defaults plus one disabled broadcast showing the entry format.
    fn default_with_example() -> Result<Self> {
        let mut config = Config::default();
        config.plugins.settings.insert("bulletin".to_string(), {
            let mut table = toml::Table::new();
            table.insert("max_posts_per_board".into(), toml::Value::Integer(50));
            table.insert(
                "boards".into(),
                toml::Value::Array(vec![
                    toml::Value::String("general".into()),
                    toml::Value::String("swap".into()),
                ]),
            );
            table
        });
        let morning = ScheduledBroadcastConfig {
            name: "morning".to_string(),
            schedule_type: "cron".to_string(),
            cron_expression: Some("0 8 * * *".to_string()),
            channel: Some(0),
            priority: Some("normal".to_string()),
            message: Some("Good morning mesh".to_string()),
            enabled: false,
            ..Default::default()
        };
        config.scheduled_broadcasts.push(morning.to_value()?);
        Ok(config)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            queue_max_size: self.router.queue_max_size,
            reply_hop_limit: self.gateway.default_hop_limit,
        }
    }

    pub fn outbound_config(&self) -> OutboundConfig {
        OutboundConfig {
            max_queue: self.outbound.queue_max_size,
            min_send_gap_ms: self.outbound.min_send_gap_ms,
            stats_interval_ms: self.outbound.stats_interval_ms,
            max_message_bytes: self.gateway.max_message_bytes,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.scheduler.enabled,
            poll_interval_seconds: self.scheduler.poll_interval_seconds,
            grace_seconds: self.scheduler.grace_seconds,
        }
    }

    pub fn broadcast_defaults(&self) -> BroadcastDefaults {
        BroadcastDefaults {
            channel: self.gateway.default_channel,
            hop_limit: self.gateway.default_hop_limit,
        }
    }

    pub fn send_defaults(&self) -> SendDefaults {
        SendDefaults {
            channel: self.gateway.default_channel,
            hop_limit: self.gateway.default_hop_limit,
        }
    }

    pub fn plugin_settings(&self, name: &str) -> toml::Table {
        self.plugins.settings.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.gateway.name, "meshgate");
        assert_eq!(config.router.queue_max_size, 1000);
        assert_eq!(config.outbound.queue_max_size, 500);
        assert_eq!(config.scheduler.poll_interval_seconds, 30);
        assert_eq!(config.plugins.enabled, vec!["core", "bulletin"]);
        assert!(config.scheduled_broadcasts.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            default_hop_limit = 5

            [scheduler]
            grace_seconds = 120

            [plugins.settings.bulletin]
            boards = ["general", "swap"]

            [[scheduled_broadcasts]]
            name = "digest"
            schedule_type = "interval"
            interval_seconds = 3600
            plugin_name = "bulletin"
            plugin_method = "digest"
            plugin_args = { board = "swap" }
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.default_channel, 0);
        assert_eq!(config.router_config().reply_hop_limit, 5);
        assert_eq!(config.broadcast_defaults().hop_limit, 5);
        assert_eq!(config.scheduler_config().grace_seconds, 120);
        assert!(config.scheduler_config().enabled);
        assert!(config.plugin_settings("bulletin").contains_key("boards"));
        assert!(config.plugin_settings("core").is_empty());

        let entry = ScheduledBroadcastConfig::from_value(&config.scheduled_broadcasts[0]).unwrap();
        assert!(entry.enabled);
        assert_eq!(
            entry.plugin_args.as_ref().and_then(|a| a.get("board")),
            Some(&Value::String("swap".into()))
        );
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();

        let config = Config::load(path).await.unwrap();
        assert_eq!(config.outbound_config().max_message_bytes, 200);
        assert_eq!(config.scheduled_broadcasts.len(), 1);
        let morning = ScheduledBroadcastConfig::from_value(&config.scheduled_broadcasts[0]).unwrap();
        assert!(!morning.enabled);
        assert_eq!(morning.cron_expression.as_deref(), Some("0 8 * * *"));
        assert_eq!(
            config.plugin_settings("bulletin").get("max_posts_per_board"),
            Some(&toml::Value::Integer(50))
        );
    }

    #[test]
    fn bad_broadcast_entry_does_not_fail_the_file() {
        let config: Config = toml::from_str(
            r#"
            [[scheduled_broadcasts]]
            name = "beacon"
            schedule_type = "interval"
            interval_seconds = "sixty"
            message = "QRV"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduled_broadcasts.len(), 1);
        let err = ScheduledBroadcastConfig::from_value(&config.scheduled_broadcasts[0]).unwrap_err();
        assert!(err.to_string().contains("sixty"), "{err}");
    }

    #[tokio::test]
    async fn load_reports_path_on_error() {
        let err = Config::load("/nonexistent/meshgate.toml").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/meshgate.toml"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[router\nqueue_max_size = ").unwrap();
        let err = Config::load(path.to_str().unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
