//! Scheduler: the control loop over every configured peer.
//!
//! Each tick visits the peers in configuration order. A peer whose session
//! was lost (or replaced) since its last sweep is cleaned up first; a peer
//! whose check interval has elapsed is then swept. One peer's failure or
//! panic never stops the others.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use beacon_core::DaemonSettings;

use crate::peer::Peer;

pub struct Scheduler {
    peers: Vec<Peer>,
    settings: DaemonSettings,
}

impl Scheduler {
    pub fn new(settings: DaemonSettings, peers: Vec<Peer>) -> Self {
        Self { peers, settings }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, index: usize) -> Option<&Peer> {
        self.peers.get(index)
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Run one pass over every peer.
    pub async fn tick(&mut self) {
        self.sweep(None).await;
    }

    /// Tick every `tick_interval` until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            peers = self.peers.len(),
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            check_interval_secs = self.settings.check_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.sweep(Some(&mut shutdown)).await {
                        break;
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!("scheduler shutting down");
    }

    /// Returns false if shutdown cut the pass short.
    async fn sweep(&mut self, mut shutdown: Option<&mut watch::Receiver<bool>>) -> bool {
        let check_interval = self.settings.check_interval;

        for peer in &mut self.peers {
            if shutdown.as_deref().is_some_and(|rx| *rx.borrow()) {
                return false;
            }

            if peer.needs_cleanup() {
                peer.cleanup();
            }

            let due = peer
                .last_check()
                .is_none_or(|last| Instant::now().duration_since(last) >= check_interval);
            if !due {
                continue;
            }

            let name = peer.name().to_string();
            let check = AssertUnwindSafe(peer.check_targets()).catch_unwind();
            let outcome = match shutdown.as_deref_mut() {
                Some(rx) => tokio::select! {
                    outcome = check => outcome,
                    _ = shutdown_requested(rx) => return false,
                },
                None => check.await,
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(peer = %name, error = %e, "target check failed"),
                Err(panic) => error!(
                    peer = %name,
                    panic = panic_message(panic.as_ref()),
                    "target check panicked"
                ),
            }
        }
        true
    }
}

/// Resolves once the flag is true or the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
