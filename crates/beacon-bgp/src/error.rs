//! BGP codec and session error types.

use thiserror::Error;

use crate::message::NotificationMessage;

/// Errors produced while encoding or decoding BGP messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message marker is not all ones")]
    BadMarker,

    #[error("invalid message length: {0}")]
    BadLength(usize),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("encoded message is {0} bytes, longer than the 4096 byte limit")]
    TooLong(usize),
}

/// Errors from driving a BGP session or handing it messages.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not established")]
    NotEstablished,

    #[error("session task has stopped")]
    Closed,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("hold timer expired")]
    HoldTimerExpired,

    #[error("peer sent notification: {0}")]
    PeerNotification(NotificationMessage),

    #[error("sent notification to peer: {0}")]
    LocalNotification(NotificationMessage),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
