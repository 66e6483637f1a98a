//! # Transport Interface Module
//!
//! Transports are the radio links (serial, TCP, BLE) that move text between the
//! mesh and the gateway. Device drivers live outside this crate; the core only
//! sees them through two narrow seams:
//!
//! - **Inbound**: a driver builds a [`Message`](crate::message::Message) and
//!   hands it to [`MessageRouter::process_message`](crate::router::MessageRouter::process_message)
//!   together with its interface id.
//! - **Outbound**: a driver implements [`Transport`] and is registered with the
//!   [`Outbound`] writer, which drains a bounded priority queue and paces sends.
//!
//! ```text
//! driver ──process_message──► Router ──► handler ──► Outbound queue ──► Transport::send
//! ```
//!
//! [`LogTransport`] stands in for a device when none is attached: it logs each
//! send and keeps a short history, which is what tests inspect.

pub mod outbound;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::logutil::escape_log;
use crate::message::MessagePriority;

pub use outbound::{Outbound, OutboundConfig, OutboundHandle, OutboundStats};

/// Topic used for outbound entries that should go to every transport.
pub const ALL_INTERFACES: &str = "*";

/// Outgoing message structure for the writer task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    /// `None` for a channel broadcast, `Some(node)` for a direct message.
    pub recipient_id: Option<String>,
    pub channel: u32,
    pub content: String,
    pub priority: MessagePriority,
    pub hop_limit: u8,
    /// Restrict delivery to one interface; `None` sends on all of them.
    pub interface_id: Option<String>,
}

impl OutgoingMessage {
    pub fn broadcast(content: impl Into<String>, channel: u32) -> Self {
        Self {
            recipient_id: None,
            channel,
            content: content.into(),
            priority: MessagePriority::Normal,
            hop_limit: 3,
            interface_id: None,
        }
    }

    pub fn direct(recipient_id: impl Into<String>, content: impl Into<String>, channel: u32) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            ..Self::broadcast(content, channel)
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn via(mut self, interface_id: impl Into<String>) -> Self {
        self.interface_id = Some(interface_id.into());
        self
    }

    /// Queue topic for this message: its interface, or every interface.
    pub fn topic(&self) -> &str {
        self.interface_id.as_deref().unwrap_or(ALL_INTERFACES)
    }
}

/// An outbound radio link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier stamped onto inbound messages from this link.
    fn interface_id(&self) -> &str;

    /// Deliver one message. Errors are counted by the writer and never retried.
    async fn send(&self, msg: &OutgoingMessage) -> Result<()>;
}

/// Transport used when no device is attached: logs and remembers what was sent.
pub struct LogTransport {
    interface_id: String,
    history: Mutex<VecDeque<OutgoingMessage>>,
    history_limit: usize,
}

impl LogTransport {
    pub fn new(interface_id: impl Into<String>) -> Self {
        Self {
            interface_id: interface_id.into(),
            history: Mutex::new(VecDeque::new()),
            history_limit: 256,
        }
    }

    /// Messages sent so far, oldest first (bounded history).
    pub async fn sent(&self) -> Vec<OutgoingMessage> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn sent_contents(&self) -> Vec<String> {
        self.history
            .lock()
            .await
            .iter()
            .map(|m| m.content.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn interface_id(&self) -> &str {
        &self.interface_id
    }

    async fn send(&self, msg: &OutgoingMessage) -> Result<()> {
        debug!(
            "Mock send (no device) on {} to {} ch{}: {}",
            self.interface_id,
            msg.recipient_id.as_deref().unwrap_or("*"),
            msg.channel,
            escape_log(&msg.content)
        );
        let mut history = self.history.lock().await;
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(msg.clone());
        Ok(())
    }
}
