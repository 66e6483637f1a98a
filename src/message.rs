//! Message data model shared by transports, the router, and plugins.
//!
//! A [`Message`] is immutable once built: transports and plugins construct one
//! with [`Message::new`] and the builder-style `with_*` helpers, then hand it to
//! the router, which owns it while it sits in the inbound queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Urgency class of a message. Totally ordered: `Emergency > High > Normal > Low`.
///
/// The derived `Ord` follows declaration order, so `Low < Normal < High < Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Emergency,
}

impl MessagePriority {
    /// All levels, most urgent first (the order the queue drains them in).
    pub const DESCENDING: [MessagePriority; 4] = [
        MessagePriority::Emergency,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// Dense index used by the per-level queue storage (0 = Low).
    pub fn index(self) -> usize {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Emergency => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Emergency => "emergency",
        }
    }

    /// Parse from a string (case-insensitive). Accepts a few common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "background" => Some(MessagePriority::Low),
            "normal" | "default" => Some(MessagePriority::Normal),
            "high" | "urgent" => Some(MessagePriority::High),
            "emergency" | "critical" => Some(MessagePriority::Emergency),
            _ => None,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of payload carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Command,
    System,
    Position,
    Telemetry,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Text
    }
}

/// An inbound or internally generated mesh message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    /// `None` means the message was a channel broadcast.
    pub recipient_id: Option<String>,
    pub channel: u32,
    pub content: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    /// Transport the message arrived on (empty until the router stamps it).
    pub interface_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            recipient_id: None,
            channel: 0,
            content: content.into(),
            message_type: MessageType::Text,
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
            interface_id: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn with_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_interface(mut self, interface_id: impl Into<String>) -> Self {
        self.interface_id = interface_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    pub fn is_direct(&self) -> bool {
        self.recipient_id.is_some()
    }

    /// First whitespace-delimited token of the content, if any.
    pub fn first_token(&self) -> Option<&str> {
        self.content.split_whitespace().next()
    }
}
