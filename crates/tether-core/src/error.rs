//! Session-layer error taxonomy.
//!
//! Every user-visible failure is a value. Send and stream operations return
//! a byte count on success or a [`SendError`]; receive-side failures reach
//! the application through the transmit-error hook carrying a
//! [`TransmitError`].

use thiserror::Error;

use crate::socket::SockError;

/// The session-layer error kinds, shared by both transmit directions.
///
/// Each kind maps to a stable negative code (see [`TransmitError::code`])
/// preserving the wire-era numeric contract for applications that log or
/// compare raw values.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// Nothing to send or receive.
    #[error("nothing to transmit")]
    NoTransmit,

    /// A datagram arrived from a sender id no live session owns.
    #[error("no session matches the packet's sender id")]
    ClientNotFound,

    /// A datagram operation was requested before the companion socket bound.
    #[error("datagram socket is not bound")]
    StreamNotBound,

    /// The session is not in a state that can transmit.
    #[error("session is not connected")]
    ClientNotConnected,

    /// A verified datagram frame failed its checksum.
    #[error("packet checksum does not match its contents")]
    InvalidChecksum,

    /// The frame's data id is not registered with this session.
    #[error("packet carries an unregistered data id")]
    InvalidDataId,

    /// The frame header declares a payload larger than any frame may carry.
    #[error("declared payload size exceeds the frame budget")]
    InvalidPayloadSize,
}

impl TransmitError {
    /// Stable negative code for this error kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::NoTransmit => -1,
            Self::ClientNotFound => -2,
            Self::StreamNotBound => -3,
            Self::ClientNotConnected => -4,
            Self::InvalidChecksum => -5,
            Self::InvalidDataId => -6,
            Self::InvalidPayloadSize => -7,
        }
    }
}

/// Failure of a send or stream operation.
///
/// Socket-level conditions are surfaced directly so a caller that opted out
/// of blocking sees the would-block rather than a translated value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Session-layer refusal.
    #[error(transparent)]
    Transmit(#[from] TransmitError),

    /// The underlying socket reported a failure.
    #[error(transparent)]
    Socket(#[from] SockError),
}

/// Result alias for send and stream operations: bytes written on success.
pub type SendResult = std::result::Result<usize, SendError>;
