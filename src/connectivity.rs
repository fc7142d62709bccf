//! Connectivity signal.
//!
//! A boolean "currently reachable" value published through a `watch`
//! channel. Consumers only see rising edges (unreachable -> reachable).
//! Rapid flaps between two observations collapse into the latest value.

use crate::config::Config;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ConnectivitySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivitySignal {
    pub fn new(initially_reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_reachable);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.tx.send_if_modified(|cur| {
            if *cur == reachable {
                false
            } else {
                *cur = reachable;
                true
            }
        });
    }

    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn events(&self) -> ConnectivityEvents {
        let rx = self.tx.subscribe();
        let last = *rx.borrow();
        ConnectivityEvents { rx, last }
    }
}

pub struct ConnectivityEvents {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl ConnectivityEvents {
    /// Wait for the next unreachable -> reachable edge. `None` once every
    /// signal handle is gone.
    pub async fn next_regained(&mut self) -> Option<()> {
        loop {
            self.rx.changed().await.ok()?;
            let now = *self.rx.borrow_and_update();
            let was = std::mem::replace(&mut self.last, now);
            if now && !was {
                return Some(());
            }
        }
    }
}

/// Poll the probe URL and publish reachability. Any HTTP response counts as
/// reachable; transport failure or timeout counts as unreachable.
pub fn spawn_probe(cfg: &Config, signal: ConnectivitySignal) -> anyhow::Result<JoinHandle<()>> {
    let url = if cfg.connectivity.probe_url.trim().is_empty() {
        cfg.remote.base_url.clone()
    } else {
        cfg.connectivity.probe_url.clone()
    };
    let interval = Duration::from_millis(cfg.connectivity.probe_interval_ms);
    let client = Client::builder()
        .timeout(Duration::from_millis(cfg.connectivity.probe_timeout_ms.max(1)))
        .user_agent(cfg.remote.user_agent.clone())
        .build()?;

    info!(url = %url, interval_ms = cfg.connectivity.probe_interval_ms, "connectivity probe started");
    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = probe_once(&client, &url).await;
            if reachable != signal.is_reachable() {
                if reachable {
                    info!("connectivity regained");
                } else {
                    warn!("connectivity lost");
                }
            }
            signal.set_reachable(reachable);
        }
    }))
}

pub async fn probe_once(client: &Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(resp) => {
            debug!(status = resp.status().as_u16(), "probe ok");
            true
        }
        Err(e) => {
            debug!("probe failed: {e}");
            false
        }
    }
}
