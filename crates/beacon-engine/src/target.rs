//! A monitored target and its advertisement state machine.

use tracing::{info, warn};

use beacon_bgp::{ProtocolSession, SessionError};
use beacon_core::TargetSpec;
use beacon_health::ProbeResult;

use crate::advertiser::{self, PeerContext};

/// Whether the target's prefixes are currently announced on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    #[default]
    Withdrawn,
    Advertised,
}

/// What [`Target::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// An advertise was sent.
    Advertised,
    /// A withdraw was sent.
    Withdrawn,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Target {
    spec: TargetSpec,
    state: TargetState,
}

impl Target {
    /// A new target always starts withdrawn.
    pub fn from_spec(spec: TargetSpec) -> Self {
        Self {
            spec,
            state: TargetState::Withdrawn,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn check(&self) -> &str {
        &self.spec.check
    }

    pub fn spec(&self) -> &TargetSpec {
        &self.spec
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    /// Force the target withdrawn without sending anything. Returns true if
    /// it was advertised.
    pub(crate) fn reset(&mut self) -> bool {
        std::mem::take(&mut self.state) == TargetState::Advertised
    }

    /// Apply one probe result. State changes only after every UPDATE of the
    /// transition was sent, so a failed send leaves the target where it was
    /// and the next result repeats the whole transition.
    pub fn apply(
        &mut self,
        result: ProbeResult,
        session: &dyn ProtocolSession,
        ctx: &PeerContext,
    ) -> Result<Transition, SessionError> {
        match (result.is_healthy(), self.state) {
            (true, TargetState::Withdrawn) => {
                info!(
                    target_name = %self.spec.name,
                    prefixes = self.spec.prefixes.len(),
                    destination = %self.spec.destination,
                    "advertising route(s)"
                );
                for update in advertiser::advertise(self, ctx) {
                    session.send(update)?;
                }
                self.state = TargetState::Advertised;
                Ok(Transition::Advertised)
            }
            (false, TargetState::Advertised) => {
                warn!(
                    target_name = %self.spec.name,
                    prefixes = self.spec.prefixes.len(),
                    result = ?result,
                    "withdrawing route(s)"
                );
                for update in advertiser::withdraw(self, ctx) {
                    session.send(update)?;
                }
                self.state = TargetState::Withdrawn;
                Ok(Transition::Withdrawn)
            }
            _ => Ok(Transition::Unchanged),
        }
    }
}
