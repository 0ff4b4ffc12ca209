//! Packet header flags.
//!
//! Bits 0 and 1 describe the footer and are frozen once a packet is
//! finalized. Bits 2 through 7 are free for application use and stay
//! writable for the packet's whole life.

use bitflags::bitflags;

bitflags! {
    /// Feature flags carried in the packet header (8 bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        /// Footer carries a checksum over header, payload, and sender id.
        const CHECKSUM = 0b0000_0001;

        /// Footer carries the sender's client id. Mandatory for datagram
        /// transmission so the receiver can attribute the packet.
        const SENDER_ID = 0b0000_0010;

        /// Application custom flag.
        const CUSTOM_1 = 0b0000_0100;
        /// Application custom flag.
        const CUSTOM_2 = 0b0000_1000;
        /// Application custom flag.
        const CUSTOM_3 = 0b0001_0000;
        /// Application custom flag.
        const CUSTOM_4 = 0b0010_0000;
        /// Application custom flag.
        const CUSTOM_5 = 0b0100_0000;
        /// Application custom flag.
        const CUSTOM_6 = 0b1000_0000;
    }
}

impl PacketFlags {
    /// The flag bits locked by finalization.
    pub const FOOTER_BITS: Self = Self::CHECKSUM.union(Self::SENDER_ID);

    /// Parse flags from the raw header byte.
    ///
    /// Infallible: every bit pattern is valid, unknown bits are preserved.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Raw header byte value.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }
}

impl Default for PacketFlags {
    fn default() -> Self {
        Self::empty()
    }
}
