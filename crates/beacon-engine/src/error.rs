//! Engine error types.

use thiserror::Error;

use beacon_bgp::SessionError;

/// Errors from a peer sweep.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("peer {peer}: failed to send update for target {target}: {source}")]
    Send {
        peer: String,
        target: String,
        #[source]
        source: SessionError,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
