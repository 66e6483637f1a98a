//! # Message Router
//!
//! Transports call [`MessageRouter::process_message`], which stamps the
//! message and drops it into a [`BoundedPriorityQueue`] without waiting on
//! any handler. One consumer task drains the queue, most urgent first:
//!
//! 1. If the first token of the content is a registered command keyword
//!    (case-insensitive), the winning [`CommandHandler`] for that keyword gets
//!    the remaining tokens. Only that one handler runs.
//! 2. Otherwise every [`MessageHandler`] is offered the message in ascending
//!    priority order until one reports it handled. If none does, the message
//!    is counted as dropped.
//!
//! Handler errors and panics are caught per call and never reach the
//! consumer loop. A `Handled(Some(text))` outcome is sent back to the sender
//! through the outbound queue; a failed command answers `Error: <detail>`.
//!
//! Registrations are keyed by `(owner, name)`: registering the same pair
//! again replaces the entry in place, and [`MessageRouter::unregister_owner`]
//! removes everything a plugin registered when it stops.

pub mod handler;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::errors::{QueueError, RegistrationError};
use crate::logutil::{describe_message, escape_log};
use crate::message::Message;
use crate::metrics;
use crate::queue::{BoundedPriorityQueue, QueueEntry};
use crate::service::Service;
use crate::transport::{OutboundHandle, OutgoingMessage};
use crate::validation::{sanitize_content, validate_keyword, validate_service_name};

pub use handler::{
    command_fn, message_fn, CommandHandler, HandlerContext, HandlerOutcome, MessageHandler,
};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub queue_max_size: usize,
    /// Hop limit applied to replies sent back to a message's sender.
    pub reply_hop_limit: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 1000,
            reply_hop_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub messages_received: u64,
    /// Messages some handler reported as handled.
    pub messages_processed: u64,
    /// Messages no handler took (including failed commands).
    pub messages_dropped: u64,
    /// Messages evicted from a full inbound queue before dispatch.
    pub queue_overflow: u64,
    pub handler_errors: u64,
    pub queue_depth: usize,
    pub commands: usize,
    pub message_handlers: usize,
}

/// What the consumer did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled by the named command keyword or message handler.
    Handled { by: String },
    /// A command handler matched but declined or failed.
    CommandFailed { keyword: String, detail: Option<String> },
    /// No message handler took it.
    Unhandled,
}

struct CommandRegistration {
    owner: String,
    keyword: String,
    help: String,
    priority: i32,
    seq: u64,
    handler: Arc<dyn CommandHandler>,
}

struct MessageRegistration {
    owner: String,
    name: String,
    priority: i32,
    seq: u64,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct Tables {
    commands: Vec<CommandRegistration>,
    message_handlers: Vec<MessageRegistration>,
    next_seq: u64,
}

impl Tables {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Lowest priority value wins a keyword; ties go to the earliest registration.
    fn winner(&self, keyword: &str) -> Option<&CommandRegistration> {
        self.commands
            .iter()
            .filter(|c| c.keyword == keyword)
            .min_by_key(|c| (c.priority, c.seq))
    }

    fn chain(&self) -> Vec<(String, Arc<dyn MessageHandler>)> {
        let mut regs: Vec<&MessageRegistration> = self.message_handlers.iter().collect();
        regs.sort_by_key(|r| (r.priority, r.seq));
        regs.into_iter()
            .map(|r| (r.name.clone(), r.handler.clone()))
            .collect()
    }

    fn keywords(&self) -> Vec<&str> {
        let mut kws: Vec<&str> = self.commands.iter().map(|c| c.keyword.as_str()).collect();
        kws.sort_unstable();
        kws.dedup();
        kws
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
}

struct Inner {
    cfg: RouterConfig,
    queue: Mutex<BoundedPriorityQueue<Message>>,
    notify: Notify,
    tables: RwLock<Tables>,
    counters: Counters,
    outbound: OutboundHandle,
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Inbound dispatch pipeline; registered with the lifecycle manager as `router`.
pub struct MessageRouter {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl MessageRouter {
    pub fn new(cfg: RouterConfig, outbound: OutboundHandle) -> Result<Self, QueueError> {
        let queue = BoundedPriorityQueue::new(cfg.queue_max_size)?;
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                queue: Mutex::new(queue),
                notify: Notify::new(),
                tables: RwLock::new(Tables::default()),
                counters: Counters::default(),
                outbound,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Accept a message from a transport. Returns as soon as it is queued.
    ///
    /// `interface_id` overrides whatever the message carried. A full queue
    /// evicts its oldest least-urgent entry rather than blocking.
    pub async fn process_message(&self, mut message: Message, interface_id: &str) {
        if !interface_id.is_empty() {
            message.interface_id = interface_id.to_string();
        }
        message.content = sanitize_content(&message.content);
        trace!("inbound {}", describe_message(&message));
        self.inner.counters.received.fetch_add(1, Ordering::Relaxed);

        let priority = message.priority;
        let evicted = {
            let mut queue = self.inner.queue.lock().await;
            queue.enqueue_evicting(QueueEntry::new(message, priority), priority)
        };
        if let Some(victim) = evicted {
            warn!(
                "inbound queue full; evicted {} message from {}",
                victim.priority, victim.payload.sender_id
            );
        }
        self.inner.notify.notify_one();
    }

    /// Bind `keyword` to `handler` on behalf of `owner`.
    pub async fn register_command(
        &self,
        owner: &str,
        keyword: &str,
        help: &str,
        priority: i32,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistrationError> {
        let keyword = validate_keyword(keyword).map_err(RegistrationError::InvalidKeyword)?;
        let owner = validate_service_name(owner).map_err(RegistrationError::InvalidName)?;
        let mut tables = self.inner.tables.write().await;
        if let Some(existing) = tables
            .commands
            .iter_mut()
            .find(|c| c.owner == owner && c.keyword == keyword)
        {
            existing.help = help.to_string();
            existing.priority = priority;
            existing.handler = handler;
            debug!("Replaced command '{}' for {}", keyword, owner);
            return Ok(());
        }
        if let Some(current) = tables.winner(&keyword) {
            if current.priority <= priority {
                info!(
                    "Command '{}' from {} is shadowed by {} (priority {} <= {})",
                    keyword, owner, current.owner, current.priority, priority
                );
            }
        }
        let seq = tables.seq();
        debug!("Registered command '{}' for {} (priority {})", keyword, owner, priority);
        tables.commands.push(CommandRegistration {
            owner,
            keyword,
            help: help.to_string(),
            priority,
            seq,
            handler,
        });
        Ok(())
    }

    /// Add an unconditional handler; lower `priority` runs earlier.
    pub async fn register_message_handler(
        &self,
        owner: &str,
        name: &str,
        priority: i32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistrationError> {
        let owner = validate_service_name(owner).map_err(RegistrationError::InvalidName)?;
        let name = validate_service_name(name).map_err(RegistrationError::InvalidName)?;
        let mut tables = self.inner.tables.write().await;
        if let Some(existing) = tables
            .message_handlers
            .iter_mut()
            .find(|h| h.owner == owner && h.name == name)
        {
            existing.priority = priority;
            existing.handler = handler;
            debug!("Replaced message handler {} for {}", name, owner);
            return Ok(());
        }
        let seq = tables.seq();
        debug!("Registered message handler {} for {} (priority {})", name, owner, priority);
        tables.message_handlers.push(MessageRegistration {
            owner,
            name,
            priority,
            seq,
            handler,
        });
        Ok(())
    }

    /// Remove every command and message handler registered by `owner`.
    /// Returns how many registrations were removed.
    pub async fn unregister_owner(&self, owner: &str) -> usize {
        let mut tables = self.inner.tables.write().await;
        let before = tables.commands.len() + tables.message_handlers.len();
        tables.commands.retain(|c| c.owner != owner);
        tables.message_handlers.retain(|h| h.owner != owner);
        let removed = before - tables.commands.len() - tables.message_handlers.len();
        if removed > 0 {
            debug!("Unregistered {} handlers owned by {}", removed, owner);
        }
        removed
    }

    /// Help text of each keyword's winning registration.
    pub async fn command_help(&self) -> BTreeMap<String, String> {
        let tables = self.inner.tables.read().await;
        tables
            .keywords()
            .into_iter()
            .filter_map(|kw| tables.winner(kw).map(|c| (kw.to_string(), c.help.clone())))
            .collect()
    }

    pub async fn get_stats(&self) -> RouterStats {
        let (queue_depth, queue_overflow) = {
            let queue = self.inner.queue.lock().await;
            let stats = queue.statistics();
            (stats.size, stats.dropped)
        };
        let tables = self.inner.tables.read().await;
        let c = &self.inner.counters;
        RouterStats {
            messages_received: c.received.load(Ordering::Relaxed),
            messages_processed: c.processed.load(Ordering::Relaxed),
            messages_dropped: c.dropped.load(Ordering::Relaxed),
            queue_overflow,
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            queue_depth,
            commands: tables.keywords().len(),
            message_handlers: tables.message_handlers.len(),
        }
    }

    /// Dispatch everything currently queued on the calling task.
    ///
    /// For embedding without the background consumer (tests, one-shot tools);
    /// do not mix with a running consumer if strict ordering matters.
    pub async fn process_pending(&self) -> Vec<Disposition> {
        let mut out = Vec::new();
        while let Some(message) = self.inner.pop().await {
            out.push(self.inner.dispatch(message).await);
        }
        out
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }
}

impl Inner {
    async fn pop(&self) -> Option<Message> {
        self.queue.lock().await.dequeue().map(|e| e.payload)
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            // The queue lock is released before the handler runs.
            loop {
                if !matches!(shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    debug!("router consumer stopping");
                    return;
                }
                let Some(message) = self.pop().await else { break };
                self.dispatch(message).await;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("router consumer stopping");
                    return;
                }
                _ = self.notify.notified() => {}
            }
        }
    }

    async fn dispatch(&self, message: Message) -> Disposition {
        let ctx = HandlerContext::from_message(&message);
        let keyword = message.first_token().map(str::to_lowercase);

        let command = match keyword.as_deref() {
            Some(kw) => {
                let tables = self.tables.read().await;
                tables.winner(kw).map(|c| (c.keyword.clone(), c.handler.clone()))
            }
            None => None,
        };
        if let Some((keyword, handler)) = command {
            let args: Vec<String> = message
                .content
                .split_whitespace()
                .skip(1)
                .map(str::to_string)
                .collect();
            debug!(
                "command '{}' from {} ({} args)",
                keyword,
                message.sender_id,
                args.len()
            );
            let outcome = guarded(&keyword, handler.handle(&args, &ctx)).await;
            metrics::record_command(&keyword, matches!(outcome, HandlerOutcome::Error(_)));
            return match outcome {
                HandlerOutcome::Handled(reply) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    if let Some(text) = reply {
                        self.reply(&message, text);
                    }
                    Disposition::Handled { by: keyword }
                }
                HandlerOutcome::NotHandled => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    Disposition::CommandFailed { keyword, detail: None }
                }
                HandlerOutcome::Error(detail) => {
                    self.note_error(&keyword, &detail);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    self.reply(&message, format!("Error: {detail}"));
                    Disposition::CommandFailed {
                        keyword,
                        detail: Some(detail),
                    }
                }
            };
        }

        let chain = self.tables.read().await.chain();
        for (name, handler) in chain {
            match guarded(&name, handler.handle(&message, &ctx)).await {
                HandlerOutcome::Handled(reply) => {
                    trace!("message {} handled by {}", message.id, name);
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    if let Some(text) = reply {
                        self.reply(&message, text);
                    }
                    return Disposition::Handled { by: name };
                }
                HandlerOutcome::NotHandled => {}
                HandlerOutcome::Error(detail) => self.note_error(&name, &detail),
            }
        }
        debug!("unhandled: {}", describe_message(&message));
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        Disposition::Unhandled
    }

    fn note_error(&self, handler: &str, detail: &str) {
        warn!("handler {} failed: {}", handler, escape_log(detail));
        self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
        metrics::inc_handler_errors();
    }

    fn reply(&self, to: &Message, text: String) {
        let mut out = OutgoingMessage::direct(to.sender_id.clone(), text, to.channel)
            .with_priority(to.priority)
            .with_hop_limit(self.cfg.reply_hop_limit);
        if !to.interface_id.is_empty() {
            out = out.via(to.interface_id.clone());
        }
        if let Err(e) = self.outbound.send(out) {
            warn!("reply to {} not queued: {e:#}", to.sender_id);
        }
    }
}

/// Run one handler call, converting a panic into [`HandlerOutcome::Error`].
async fn guarded<F>(label: &str, fut: F) -> HandlerOutcome
where
    F: Future<Output = HandlerOutcome>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            metrics::inc_handler_panics();
            let detail = panic_detail(panic.as_ref());
            error!("handler {} panicked: {}", label, escape_log(&detail));
            HandlerOutcome::Error(format!("handler panicked: {detail}"))
        }
    }
}

pub(crate) fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Service for MessageRouter {
    async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let join = tokio::spawn(self.inner.clone().run(rx));
        *worker = Some(Worker { shutdown: tx, join });
        info!(
            "Message router started (queue_max_size={})",
            self.inner.cfg.queue_max_size
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        let _ = worker.shutdown.send(());
        worker
            .join
            .await
            .map_err(|e| anyhow!("router consumer task failed: {e}"))?;
        info!("Message router stopped");
        Ok(())
    }
}
