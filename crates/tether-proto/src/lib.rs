//! Wire protocol for the Tether session layer.
//!
//! This crate defines everything both ends of a session agree on before any
//! state machine runs: the framed packet format, the payload codec, the
//! reserved control message ids, and the aliveness arithmetic. It performs
//! no I/O and holds no session state, so the client and server crates can
//! share it as their single source of wire truth.
//!
//! # Frame layout
//!
//! ```text
//! [ dataID: u16 | payloadSize: u16 | flags: u8 ]   header, 5 bytes
//! [ payload: payloadSize bytes ]
//! [ checksum: i32 ]                               iff flags bit 0
//! [ senderID: u32 ]                               iff flags bit 1
//! ```
//!
//! All multi-byte integers are little-endian on the wire. A frame never
//! exceeds [`MAX_FRAME_SIZE`] bytes, so a single UDP datagram always carries
//! a whole frame.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod control;
pub mod errors;
pub mod flags;
pub mod header;
pub mod packet;
pub mod session;

pub use control::ControlId;
pub use errors::{CodecError, Result};
pub use flags::PacketFlags;
pub use header::{PacketFooter, PacketHeader};
pub use packet::{decode_frame, FrameStep, Packet, PayloadValue};

/// Numeric tag identifying a message kind on the wire.
///
/// Values `0..=6` are reserved for control traffic (see [`ControlId`]);
/// application ids start at [`control::USER_DATA_START`].
pub type DataId = u16;

/// Session-unique peer identifier issued by the server.
///
/// Zero is reserved: it names the server itself and doubles as the
/// "unassigned" sentinel before identity issuance completes.
pub type ClientId = u32;

/// Largest frame that travels on the wire, header and footer included.
pub const MAX_FRAME_SIZE: usize = 1500;

/// Payload capacity of a frame once the header and the largest possible
/// footer are accounted for.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - PacketHeader::SIZE - PacketFooter::MAX_SIZE;

/// Capacity of the per-peer receive accumulator.
pub const RECV_BUFFER_SIZE: usize = 65536;

/// Longest registrable message name in bytes; longer names are truncated
/// before any comparison.
pub const MAX_DATA_NAME_LEN: usize = 1024;
