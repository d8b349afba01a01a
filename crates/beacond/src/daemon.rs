//! Daemon wiring: one session task per peer, one control loop, and
//! signal-driven shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use beacon_bgp::{BgpSession, SessionConfig};
use beacon_core::Config;
use beacon_engine::{Peer, Scheduler};
use beacon_health::{CommandProbe, HealthProbe};

pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        peers = config.enabled_peers().len(),
        disabled = config.disabled_peers(),
        "beacond starting"
    );
    let (settings, specs) = config.into_parts();
    if specs.is_empty() {
        warn!("no enabled peers configured, nothing will be advertised");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Sessions and peers ─────────────────────────────────────

    let probe: Arc<dyn HealthProbe> = Arc::new(CommandProbe::new(settings.probe_timeout));
    let mut session_tasks = Vec::with_capacity(specs.len());
    let mut peers = Vec::with_capacity(specs.len());

    for spec in &specs {
        let session_config = SessionConfig::from_spec(spec, &settings);
        let (session, task) = BgpSession::start(session_config, shutdown_rx.clone());
        session_tasks.push(task);
        peers.push(Peer::from_spec(spec, &settings, Box::new(session), Arc::clone(&probe)));
        info!(
            peer = %spec.name,
            remote = %spec.remote_address,
            family = %spec.address_family,
            targets = spec.targets.len(),
            "peer configured"
        );
    }

    // ── Control loop ───────────────────────────────────────────

    let mut scheduler = Scheduler::new(settings, peers);
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    wait_for_signal().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    scheduler_handle.await.context("scheduler task failed")?;
    for task in session_tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "session task failed");
        }
    }

    info!("beacond stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
