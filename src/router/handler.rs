//! Handler contract for the router.
//!
//! Handlers never signal "not mine" by failing. Each call returns a
//! [`HandlerOutcome`] and the router decides what happens next: a handled
//! message stops the chain, `NotHandled` moves on to the next handler, and
//! `Error` is logged and treated as not handled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::message::{Message, MessagePriority};

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler consumed the message; `Some(text)` is sent back to the sender.
    Handled(Option<String>),
    NotHandled,
    /// The handler failed; the detail is logged and, for commands, echoed to the sender.
    Error(String),
}

impl HandlerOutcome {
    pub fn handled() -> Self {
        HandlerOutcome::Handled(None)
    }

    pub fn reply(text: impl Into<String>) -> Self {
        HandlerOutcome::Handled(Some(text.into()))
    }

    pub fn error(detail: impl Into<String>) -> Self {
        HandlerOutcome::Error(detail.into())
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, HandlerOutcome::Handled(_))
    }
}

impl From<anyhow::Result<Option<String>>> for HandlerOutcome {
    fn from(result: anyhow::Result<Option<String>>) -> Self {
        match result {
            Ok(reply) => HandlerOutcome::Handled(reply),
            Err(e) => HandlerOutcome::Error(format!("{e:#}")),
        }
    }
}

/// Per-message facts handed to every handler alongside the payload.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub message_id: Uuid,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub channel: u32,
    pub interface_id: String,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl HandlerContext {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            channel: message.channel,
            interface_id: message.interface_id.clone(),
            priority: message.priority,
            timestamp: message.timestamp,
            metadata: message.metadata.clone(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.recipient_id.is_some()
    }
}

/// Bound to one command keyword; receives the tokens after the keyword.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, args: &[String], ctx: &HandlerContext) -> HandlerOutcome;
}

/// Offered every message that did not match a command.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message, ctx: &HandlerContext) -> HandlerOutcome;
}

struct FnCommand<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnCommand<F>
where
    F: Fn(Vec<String>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(&self, args: &[String], ctx: &HandlerContext) -> HandlerOutcome {
        (self.0)(args.to_vec(), ctx.clone()).await
    }
}

struct FnMessage<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnMessage<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(&self, message: &Message, ctx: &HandlerContext) -> HandlerOutcome {
        (self.0)(message.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a [`CommandHandler`].
pub fn command_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Vec<String>, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnCommand(f))
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnMessage(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_handlers_see_args_and_context() {
        let cmd = command_fn(|args, ctx| async move {
            HandlerOutcome::reply(format!("{}:{}", ctx.sender_id, args.join(",")))
        });
        let msg = Message::new("!a1", "echo x y").with_channel(2);
        let ctx = HandlerContext::from_message(&msg);
        let out = cmd.handle(&["x".into(), "y".into()], &ctx).await;
        assert_eq!(out, HandlerOutcome::reply("!a1:x,y"));
        assert_eq!(ctx.channel, 2);
        assert!(!ctx.is_direct());
    }

    #[test]
    fn anyhow_results_convert() {
        let ok: HandlerOutcome = Ok(Some("done".to_string())).into();
        assert!(ok.is_handled());
        let err: HandlerOutcome = Err(anyhow::anyhow!("disk full")).into();
        assert_eq!(err, HandlerOutcome::error("disk full"));
        assert!(!HandlerOutcome::NotHandled.is_handled());
    }
}
