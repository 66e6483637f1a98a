//! Outbound gateway queue (writer actor).
//!
//! Every reply, plugin send, and scheduled broadcast is enqueued here rather
//! than written to a transport directly. The writer task owns a
//! [`BoundedPriorityQueue`] and receives commands over an unbounded channel, so
//! producers never wait on radio I/O:
//!
//! * `Enqueue` inserts an entry (payload = message, topic = interface,
//!   qos = hop limit). A full queue evicts its oldest least-urgent entry.
//! * The loop sends the most urgent entry once the minimum gap since the
//!   previous send has elapsed. LoRa links rate-limit aggressively; the gap
//!   keeps the device from rejecting bursts.
//! * `Snapshot` returns [`OutboundStats`]; `Shutdown` stops the loop without
//!   sending anything further.
//!
//! The command channel is created up front so the router and scheduler can hold
//! an [`OutboundHandle`] before the writer is started. Stopping the writer hands
//! the receiver back: entries already queued are discarded, but anything sent
//! while the writer is down waits in the channel for the next start.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::{OutgoingMessage, Transport, ALL_INTERFACES};
use crate::errors::QueueError;
use crate::logutil::escape_log;
use crate::metrics;
use crate::queue::{BoundedPriorityQueue, QueueEntry, QueueStats};
use crate::service::Service;
use crate::validation::chunk_utf8;

/// Writer tuning parameters, typically sourced from Config
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub max_queue: usize,
    /// Minimum gap between consecutive sends (ms).
    pub min_send_gap_ms: u64,
    /// Interval for periodic stats logging (0 disables).
    pub stats_interval_ms: u64,
    /// Content longer than this is split into several queued parts.
    pub max_message_bytes: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_queue: 500,
            min_send_gap_ms: 2000,
            stats_interval_ms: 10_000,
            max_message_bytes: 200,
        }
    }
}

impl OutboundConfig {
    fn min_send_gap(&self) -> Duration {
        Duration::from_millis(self.min_send_gap_ms)
    }
    fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

pub enum OutboundCommand {
    Enqueue(QueueEntry<OutgoingMessage>),
    Snapshot(oneshot::Sender<OutboundStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundStats {
    pub queue: QueueStats,
    pub sent: u64,
    /// Transport `send` returned an error.
    pub failed: u64,
    /// No registered transport matched the entry's topic.
    pub unrouted: u64,
}

#[derive(Clone, Debug)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<OutboundCommand>,
    max_message_bytes: usize,
    running: Arc<AtomicBool>,
}

impl OutboundHandle {
    /// Queue a message, splitting oversize content into ordered parts.
    pub fn send(&self, msg: OutgoingMessage) -> Result<()> {
        let parts = chunk_utf8(&msg.content, self.max_message_bytes);
        for part in parts {
            let mut piece = msg.clone();
            piece.content = part;
            let topic = piece.topic().to_string();
            let qos = piece.hop_limit;
            let priority = piece.priority;
            let entry = QueueEntry::new(piece, priority).with_topic(topic).with_qos(qos);
            self.tx
                .send(OutboundCommand::Enqueue(entry))
                .map_err(|_| anyhow!("outbound writer is gone"))?;
        }
        Ok(())
    }

    /// Stats from the running writer; `None` when it is not running.
    pub async fn snapshot(&self) -> Option<OutboundStats> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        if self.tx.send(OutboundCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(OutboundCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

type TransportList = Arc<RwLock<Vec<Arc<dyn Transport>>>>;

/// Owner of the writer task; registered with the lifecycle manager as `outbound`.
pub struct Outbound {
    cfg: OutboundConfig,
    handle: OutboundHandle,
    /// Present while the writer is stopped.
    idle_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundCommand>>>,
    task: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<OutboundCommand>>>>,
    transports: TransportList,
}

impl Outbound {
    pub fn new(cfg: OutboundConfig) -> Result<Self, QueueError> {
        if cfg.max_queue == 0 {
            return Err(QueueError::InvalidCapacity(0));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = OutboundHandle {
            tx,
            max_message_bytes: cfg.max_message_bytes,
            running: Arc::new(AtomicBool::new(false)),
        };
        Ok(Self {
            cfg,
            handle,
            idle_rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
            transports: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn handle(&self) -> OutboundHandle {
        self.handle.clone()
    }

    pub async fn add_transport(&self, transport: Arc<dyn Transport>) {
        info!("Registered transport {}", transport.interface_id());
        self.transports.write().await.push(transport);
    }

    pub async fn transport_ids(&self) -> Vec<String> {
        self.transports
            .read()
            .await
            .iter()
            .map(|t| t.interface_id().to_string())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.handle.running.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Service for Outbound {
    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let rx = self
            .idle_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("outbound command channel unavailable"))?;
        let queue = BoundedPriorityQueue::new(self.cfg.max_queue)?;
        let writer = Writer {
            cfg: self.cfg.clone(),
            queue,
            transports: self.transports.clone(),
            stats: OutboundStats::default(),
            last_sent: None,
        };
        *task = Some(tokio::spawn(writer.run(rx)));
        self.handle.running.store(true, Ordering::Release);
        info!(
            "Outbound writer started (max_queue={}, min_gap={}ms)",
            self.cfg.max_queue, self.cfg.min_send_gap_ms
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(join) = self.task.lock().await.take() else {
            return Ok(());
        };
        self.handle.running.store(false, Ordering::Release);
        self.handle.shutdown().await;
        let rx = join
            .await
            .map_err(|e| anyhow!("outbound writer task failed: {e}"))?;
        *self.idle_rx.lock().await = Some(rx);
        info!("Outbound writer stopped");
        Ok(())
    }
}

struct Writer {
    cfg: OutboundConfig,
    queue: BoundedPriorityQueue<OutgoingMessage>,
    transports: TransportList,
    stats: OutboundStats,
    last_sent: Option<Instant>,
}

impl Writer {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<OutboundCommand>,
    ) -> mpsc::UnboundedReceiver<OutboundCommand> {
        let mut last_stats_log = Instant::now();
        loop {
            let wake = self.next_send_at();
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.apply(cmd).is_break() {
                        break;
                    }
                    // Absorb the rest of a burst so the next send sees every queued entry.
                    let mut stop = false;
                    while let Ok(cmd) = rx.try_recv() {
                        if self.apply(cmd).is_break() {
                            stop = true;
                            break;
                        }
                    }
                    if stop {
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }

            let now = Instant::now();
            if self.cfg.stats_interval_ms > 0
                && now.duration_since(last_stats_log) >= self.cfg.stats_interval()
            {
                let s = self.snapshot();
                debug!(
                    "outbound stats: queued={} sent={} dropped={} failed={} unrouted={}",
                    s.queue.size, s.sent, s.queue.dropped, s.failed, s.unrouted
                );
                last_stats_log = now;
            }

            if self.next_send_at().is_some_and(|at| at <= now) {
                self.send_next().await;
            }
        }
        debug!("outbound writer loop terminated");
        rx
    }

    fn apply(&mut self, cmd: OutboundCommand) -> ControlFlow<()> {
        match cmd {
            OutboundCommand::Enqueue(entry) => self.admit(entry),
            OutboundCommand::Snapshot(resp) => {
                let _ = resp.send(self.snapshot());
            }
            OutboundCommand::Shutdown(done) => {
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn admit(&mut self, entry: QueueEntry<OutgoingMessage>) {
        let priority = entry.priority;
        if let Some(victim) = self.queue.enqueue_evicting(entry, priority) {
            warn!(
                "outbound overflow: dropped {} message (queue_full={}): {}",
                victim.priority,
                self.queue.size(),
                escape_log(&victim.payload.content)
            );
        }
    }

    /// When the next entry may go out, or `None` when the queue is empty.
    fn next_send_at(&self) -> Option<Instant> {
        if self.queue.is_empty() {
            return None;
        }
        Some(match self.last_sent {
            Some(last) => last + self.cfg.min_send_gap(),
            None => Instant::now(),
        })
    }

    async fn send_next(&mut self) {
        let Some(entry) = self.queue.dequeue() else {
            return;
        };
        let topic = entry.topic.as_deref().unwrap_or(ALL_INTERFACES);
        let targets: Vec<Arc<dyn Transport>> = self
            .transports
            .read()
            .await
            .iter()
            .filter(|t| topic == ALL_INTERFACES || t.interface_id() == topic)
            .cloned()
            .collect();
        self.last_sent = Some(Instant::now());

        if targets.is_empty() {
            debug!(
                "no transport for topic {}; dropping: {}",
                topic,
                escape_log(&entry.payload.content)
            );
            self.stats.unrouted += 1;
            return;
        }
        for transport in targets {
            match transport.send(&entry.payload).await {
                Ok(()) => {
                    self.stats.sent += 1;
                    metrics::inc_outbound_sent();
                }
                Err(e) => {
                    warn!("send via {} failed: {e:#}", transport.interface_id());
                    self.stats.failed += 1;
                    metrics::inc_outbound_failed();
                }
            }
        }
    }

    fn snapshot(&self) -> OutboundStats {
        OutboundStats {
            queue: self.queue.statistics(),
            ..self.stats.clone()
        }
    }
}
