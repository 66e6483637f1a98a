//! # meshgate - plugin gateway for Meshtastic mesh networks
//!
//! meshgate sits between one or more radio transports and a set of plugins.
//! Inbound text is queued by urgency and dispatched to command and message
//! handlers; replies and scheduled broadcasts leave through a paced outbound
//! writer. Every long-running piece is a service with declared dependencies,
//! started and stopped in order by one lifecycle manager.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//! use meshgate::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let gateway = Gateway::new(config).await?;
//!     gateway.run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`queue`] - bounded four-level priority queue with overflow eviction
//! - [`router`] - inbound queue, command table, and message handler chain
//! - [`scheduler`] - cron, interval, and one-time tasks with a poll loop
//! - [`service`] - dependency-ordered lifecycle manager
//! - [`plugin`] - plugin contract, registry, and bundled plugins
//! - [`transport`] - transport trait and the outbound writer
//! - [`gateway`] - wiring from configuration to running services
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   process_message   ┌──────────┐   handlers   ┌─────────┐
//! │  Transport  │ ──────────────────▶ │  Router  │ ───────────▶ │ Plugins │
//! └─────────────┘                     └──────────┘              └─────────┘
//!        ▲                                  │ replies               │
//!        │            ┌──────────┐          ▼                       │
//!        └─────────── │ Outbound │ ◀──── Scheduler ◀────────────────┘
//!                     └──────────┘    (broadcasts, plugin calls)
//! ```

pub mod config;
pub mod errors;
pub mod gateway;
pub mod logutil;
pub mod message;
pub mod metrics;
pub mod plugin;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod transport;
pub mod validation;
