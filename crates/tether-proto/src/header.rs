//! Fixed packet header and flag-dependent footer.
//!
//! The header is five bytes, little-endian, with no magic or version field:
//! framing relies entirely on the declared payload size, and the footer's
//! presence and width are derived from the flag bits.

use bytes::BufMut;

use crate::{
    errors::{CodecError, Result},
    ClientId, DataId, PacketFlags,
};

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message kind tag.
    pub data_id: DataId,
    /// Bytes of payload following the header.
    pub payload_size: u16,
    /// Feature flags; bits 0 and 1 describe the footer.
    pub flags: PacketFlags,
}

impl PacketHeader {
    /// Serialized header width in bytes.
    pub const SIZE: usize = 5;

    /// Decode a header from the front of `bytes` without consuming them.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooShort`] when fewer than
    /// [`PacketHeader::SIZE`] bytes are available.
    pub fn peek(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(CodecError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            data_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            payload_size: u16::from_le_bytes([bytes[2], bytes[3]]),
            flags: PacketFlags::from_byte(bytes[4]),
        })
    }

    /// Append the wire image of this header.
    pub fn write(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.data_id);
        dst.put_u16_le(self.payload_size);
        dst.put_u8(self.flags.to_byte());
    }

    /// Footer width implied by the flag bits.
    #[must_use]
    pub fn footer_len(&self) -> usize {
        PacketFooter::len_for(self.flags)
    }

    /// Total frame size: header, payload, and footer.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        Self::SIZE + self.payload_size as usize + self.footer_len()
    }
}

/// Decoded packet footer.
///
/// Fields not indicated by the header flags decode as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFooter {
    /// Wrapping signed sum over payload, header fields, and sender id.
    pub checksum: i32,
    /// Client id of the packet's origin; zero names the server.
    pub sender_id: ClientId,
}

impl PacketFooter {
    /// Largest possible footer: checksum plus sender id.
    pub const MAX_SIZE: usize = 8;

    /// Footer width for a given flag set.
    #[must_use]
    pub fn len_for(flags: PacketFlags) -> usize {
        let checksum = if flags.contains(PacketFlags::CHECKSUM) { 4 } else { 0 };
        let sender = if flags.contains(PacketFlags::SENDER_ID) { 4 } else { 0 };
        checksum + sender
    }

    /// Decode the footer of a frame whose header has already been read.
    ///
    /// Fields appear in fixed order, checksum then sender id, each present
    /// only when its flag bit is set.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooShort`] when the buffer does not hold
    /// the whole frame the header describes.
    pub fn peek(bytes: &[u8], header: &PacketHeader) -> Result<Self> {
        let start = PacketHeader::SIZE + header.payload_size as usize;
        let needed = start + header.footer_len();
        if bytes.len() < needed {
            return Err(CodecError::FrameTooShort {
                expected: needed,
                actual: bytes.len(),
            });
        }

        let mut footer = Self::default();
        let mut at = start;
        if header.flags.contains(PacketFlags::CHECKSUM) {
            footer.checksum =
                i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            at += 4;
        }
        if header.flags.contains(PacketFlags::SENDER_ID) {
            footer.sender_id =
                u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        Ok(footer)
    }

    /// Append the wire image of this footer for the given flag set.
    pub fn write(&self, flags: PacketFlags, dst: &mut impl BufMut) {
        if flags.contains(PacketFlags::CHECKSUM) {
            dst.put_i32_le(self.checksum);
        }
        if flags.contains(PacketFlags::SENDER_ID) {
            dst.put_u32_le(self.sender_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_wire_layout_is_little_endian() {
        let header = PacketHeader {
            data_id: 0x1234,
            payload_size: 0x0102,
            flags: PacketFlags::CHECKSUM,
        };
        let mut wire = Vec::new();
        header.write(&mut wire);
        assert_eq!(wire, [0x34, 0x12, 0x02, 0x01, 0x01]);

        let parsed = PacketHeader::peek(&wire).expect("should parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn reject_short_header() {
        let result = PacketHeader::peek(&[0u8; 4]);
        assert_eq!(
            result,
            Err(CodecError::FrameTooShort { expected: 5, actual: 4 })
        );
    }

    #[test]
    fn footer_len_tracks_flags() {
        assert_eq!(PacketFooter::len_for(PacketFlags::empty()), 0);
        assert_eq!(PacketFooter::len_for(PacketFlags::CHECKSUM), 4);
        assert_eq!(PacketFooter::len_for(PacketFlags::SENDER_ID), 4);
        assert_eq!(PacketFooter::len_for(PacketFlags::FOOTER_BITS), 8);
    }

    #[test]
    fn footer_fixed_order_checksum_then_sender() {
        let header = PacketHeader {
            data_id: 9,
            payload_size: 0,
            flags: PacketFlags::FOOTER_BITS,
        };
        let mut wire = Vec::new();
        header.write(&mut wire);
        let footer = PacketFooter { checksum: -2, sender_id: 7 };
        footer.write(header.flags, &mut wire);

        let parsed = PacketFooter::peek(&wire, &header).expect("should parse");
        assert_eq!(parsed, footer);
    }

    #[test]
    fn footer_peek_rejects_truncation() {
        let header = PacketHeader {
            data_id: 1,
            payload_size: 0,
            flags: PacketFlags::CHECKSUM,
        };
        let mut wire = Vec::new();
        header.write(&mut wire);
        wire.extend_from_slice(&[0, 0]); // half a checksum
        assert!(matches!(
            PacketFooter::peek(&wire, &header),
            Err(CodecError::FrameTooShort { .. })
        ));
    }
}
