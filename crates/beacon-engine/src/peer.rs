//! One upstream peering and the targets announced on it.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use tokio::time::Instant;
use tracing::{debug, info_span, warn};

use beacon_bgp::ProtocolSession;
use beacon_core::{DaemonSettings, PeerSpec};
use beacon_health::{BoxFuture, HealthProbe, ProbeResult};

use crate::advertiser::PeerContext;
use crate::error::{EngineError, EngineResult};
use crate::target::{Target, TargetState};

pub struct Peer {
    name: String,
    ctx: PeerContext,
    session: Box<dyn ProtocolSession>,
    probe: Arc<dyn HealthProbe>,
    targets: Vec<Target>,
    max_concurrent_probes: usize,
    /// When the last sweep started. `None` until the first sweep.
    last_check: Option<Instant>,
    /// The session was established at the last sweep.
    ok: bool,
    /// Session generation recorded at the last sweep.
    observed_generation: u64,
}

impl Peer {
    pub fn new(
        name: impl Into<String>,
        ctx: PeerContext,
        session: Box<dyn ProtocolSession>,
        probe: Arc<dyn HealthProbe>,
        targets: Vec<Target>,
        max_concurrent_probes: usize,
    ) -> Self {
        Self {
            name: name.into(),
            ctx,
            session,
            probe,
            targets,
            max_concurrent_probes: max_concurrent_probes.max(1),
            last_check: None,
            ok: false,
            observed_generation: 0,
        }
    }

    pub fn from_spec(
        spec: &PeerSpec,
        settings: &DaemonSettings,
        session: Box<dyn ProtocolSession>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let targets = spec.targets.iter().cloned().map(Target::from_spec).collect();
        Self::new(
            spec.name.clone(),
            PeerContext::from_spec(spec),
            session,
            probe,
            targets,
            settings.max_concurrent_probes,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn last_check(&self) -> Option<Instant> {
        self.last_check
    }

    pub fn connected(&self) -> bool {
        self.session.is_established()
    }

    /// The session went away, or came back as a new session, since the
    /// last sweep.
    pub fn needs_cleanup(&self) -> bool {
        self.ok && (!self.connected() || self.session.generation() != self.observed_generation)
    }

    /// Forget every announcement. Sends nothing: the routes died with the
    /// session that carried them.
    pub fn cleanup(&mut self) {
        let mut withdrawn = 0;
        for target in &mut self.targets {
            if target.reset() {
                withdrawn += 1;
            }
        }
        if self.ok || withdrawn > 0 {
            warn!(peer = %self.name, withdrawn, "session lost, resetting targets");
        }
        self.ok = false;
    }

    /// Probe every target and send whatever UPDATEs the results call for.
    ///
    /// Probes run concurrently, bounded by `max_concurrent_probes`, and are
    /// all joined before any target changes. A failed send leaves that
    /// target as it was; later targets are still processed and the first
    /// error is returned.
    pub async fn check_targets(&mut self) -> EngineResult<()> {
        self.last_check = Some(Instant::now());
        if !self.connected() {
            debug!(peer = %self.name, "session not established, skipping checks");
            return Ok(());
        }
        self.ok = true;
        self.observed_generation = self.session.generation();

        let probe = &*self.probe;
        // Probe futures are built up front (they are lazy until polled) so
        // the returned future stays `Send` for `tokio::spawn`.
        let checks: Vec<BoxFuture<'_, ProbeResult>> =
            self.targets.iter().map(|target| probe.run(target.check())).collect();
        let results: Vec<ProbeResult> = stream::iter(checks)
            .buffered(self.max_concurrent_probes)
            .collect()
            .await;

        self.apply_results(results)
    }

    fn apply_results(&mut self, results: Vec<ProbeResult>) -> EngineResult<()> {
        let span = info_span!("peer", peer = %self.name);
        let _entered = span.enter();

        let mut first_error = None;
        for (target, result) in self.targets.iter_mut().zip(results) {
            if let Err(source) = target.apply(result, self.session.as_ref(), &self.ctx) {
                warn!(target_name = target.name(), error = %source, "failed to send update");
                first_error.get_or_insert(EngineError::Send {
                    peer: self.name.clone(),
                    target: target.name().to_string(),
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of targets currently advertised.
    pub fn advertised(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.state() == TargetState::Advertised)
            .count()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("ok", &self.ok)
            .field("targets", &self.targets.len())
            .field("advertised", &self.advertised())
            .finish()
    }
}
