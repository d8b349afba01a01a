//! beacon-health: health probes for advertised services.
//!
//! A probe runs one check and reports a [`ProbeResult`]. The engine treats
//! `Failed` exactly like `Unhealthy`; probe failures are results, never
//! errors.
//!
//! # Probes
//!
//! ```text
//! HealthProbe (trait, object safe)
//!   └── CommandProbe
//!         ├── sh -c <check>, stdio null, kill_on_drop
//!         ├── exit 0 → Healthy, non-zero → Unhealthy
//!         └── spawn error / empty / timeout → Failed
//! ```

pub mod probe;

pub use probe::{BoxFuture, CommandProbe, HealthProbe, ProbeResult};
