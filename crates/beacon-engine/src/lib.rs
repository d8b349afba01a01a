//! beacon-engine: health-driven route advertisement.
//!
//! The engine decides, per peer and per target, when prefixes should be
//! announced or withdrawn. It talks to the outside world only through the
//! [`ProtocolSession`](beacon_bgp::ProtocolSession) and
//! [`HealthProbe`](beacon_health::HealthProbe) traits.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (owns every Peer, configuration order)
//!   └── tick()
//!         ├── Peer::needs_cleanup() → Peer::cleanup()
//!         └── check interval elapsed → Peer::check_targets()
//!               ├── probes, bounded fan-out, joined in order
//!               └── Target::apply() → advertiser → session.send()
//! ```
//!
//! # State
//!
//! A target is `Advertised` only if an advertise went out on the current
//! session and no withdraw followed. When a peer's session drops, or is
//! replaced by a new one between two sweeps, every target is reset to
//! `Withdrawn` without sending anything.

pub mod advertiser;
pub mod error;
pub mod peer;
pub mod scheduler;
pub mod target;

#[cfg(test)]
mod testing;

pub use advertiser::{PeerContext, advertise, withdraw};
pub use error::{EngineError, EngineResult};
pub use peer::Peer;
pub use scheduler::Scheduler;
pub use target::{Target, TargetState, Transition};
