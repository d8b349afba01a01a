//! beacon-core: shared types and configuration for the Beacon daemon.
//!
//! The configuration file is parsed into raw serde records and then
//! validated into [`PeerSpec`] / [`TargetSpec`]. Nothing downstream ever
//! sees an unvalidated record.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, DaemonSettings, PeerSpec, TargetSpec};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
