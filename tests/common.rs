//! Shared fixtures for the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshgate::config::Config;
use meshgate::service::Service;
use meshgate::transport::{LogTransport, Outbound, OutboundConfig};

pub const RADIO: &str = "radio0";

/// Writer settings that send immediately and never log stats.
pub fn fast_outbound_config() -> OutboundConfig {
    OutboundConfig {
        min_send_gap_ms: 0,
        stats_interval_ms: 0,
        ..OutboundConfig::default()
    }
}

/// A running outbound writer with one recording transport on [`RADIO`].
pub async fn running_outbound() -> (Arc<Outbound>, Arc<LogTransport>) {
    let outbound = Arc::new(Outbound::new(fast_outbound_config()).expect("outbound"));
    let radio = Arc::new(LogTransport::new(RADIO));
    outbound.add_transport(radio.clone()).await;
    outbound.start().await.expect("outbound start");
    (outbound, radio)
}

/// Default config minus anything that touches the filesystem, waits, or polls.
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.logging.file = None;
    config.outbound.min_send_gap_ms = 0;
    config.outbound.stats_interval_ms = 0;
    // tests drive scheduler ticks by hand
    config.scheduler.enabled = false;
    config
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `radio` has sent at least `n` messages.
pub async fn wait_for_sent(radio: &Arc<LogTransport>, n: usize) -> Vec<String> {
    let r = radio.clone();
    wait_for(Duration::from_secs(2), move || {
        let r = r.clone();
        async move { r.sent().await.len() >= n }
    })
    .await;
    radio.sent_contents().await
}
