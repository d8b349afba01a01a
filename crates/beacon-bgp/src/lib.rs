//! beacon-bgp: a minimal BGP-4 speaker for announcing service routes.
//!
//! Only what an advertise-only speaker needs is implemented: OPEN
//! negotiation (multiprotocol and 4-octet AS capabilities), keepalives,
//! the hold timer, and sending UPDATEs. Routes received from the peer are
//! read and discarded.
//!
//! # Architecture
//!
//! ```text
//! BgpSession (handle, implements ProtocolSession)
//!   ├── watch<SessionState>   ← is_established()
//!   ├── generation counter    ← bumped on every Established
//!   └── mpsc<encoded UPDATE>  → session task
//!                                 ├── connect / retry loop
//!                                 ├── OPEN / KEEPALIVE handshake
//!                                 ├── frame reader task → codec::decode
//!                                 └── keepalive + hold timers
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod session;

pub use codec::CodecOptions;
pub use error::{CodecError, SessionError};
pub use message::*;
pub use session::{BgpSession, ProtocolSession, SessionConfig, SessionState, read_frame};
