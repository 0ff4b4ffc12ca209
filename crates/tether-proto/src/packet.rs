//! The packet: a self-describing framed message with a stack-style payload.
//!
//! Writes append to the payload tail; reads consume from a cursor that only
//! moves forward. The cursor and the cached wire image live behind interior
//! mutability so a dispatched `&Packet` can be popped from and re-read
//! (`reset`) by several handlers in turn.
//!
//! A packet can be *finalized*, which freezes the footer content and the two
//! footer flag bits, and *serialized*, which lays the frame out contiguously
//! and caches the image until the next mutation.

use std::cell::{Cell, RefCell};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    control::ControlId,
    errors::{CodecError, Result},
    header::{PacketFooter, PacketHeader},
    ClientId, DataId, PacketFlags, MAX_PAYLOAD_SIZE,
};

/// Fixed-size scalar that can travel in a packet payload.
///
/// Implementations encode as little-endian regardless of host order; raw
/// byte runs that are already network-ordered go through
/// [`Packet::add_bytes`] instead, which never swaps.
pub trait PayloadValue: Sized + Default {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Append the little-endian image of `self`.
    fn put_le(&self, out: &mut Vec<u8>);

    /// Decode from exactly [`Self::WIDTH`] bytes.
    fn get_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_payload_value {
    ($($ty:ty),* $(,)?) => {$(
        impl PayloadValue for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn put_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn get_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(raw)
            }
        }
    )*};
}

impl_payload_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// A single framed message.
#[derive(Debug, Clone)]
pub struct Packet {
    data_id: DataId,
    flags: PacketFlags,
    payload: Vec<u8>,
    checksum: i32,
    sender_id: ClientId,
    read_idx: Cell<usize>,
    finalized: bool,
    wire: RefCell<Option<Bytes>>,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Packet {
    /// Semantic equality: header, payload, and footer content. The read
    /// cursor and the serialization cache are transient and ignored.
    fn eq(&self, other: &Self) -> bool {
        self.data_id == other.data_id
            && self.flags == other.flags
            && self.payload == other.payload
            && self.checksum == other.checksum
            && self.sender_id == other.sender_id
    }
}

impl Eq for Packet {}

impl Packet {
    /// Create an empty packet with the unassigned-name sentinel id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(ControlId::Unknown.to_data_id())
    }

    /// Create an empty packet carrying the given data id.
    #[must_use]
    pub fn with_id(data_id: DataId) -> Self {
        Self {
            data_id,
            flags: PacketFlags::empty(),
            payload: Vec::new(),
            checksum: 0,
            sender_id: 0,
            read_idx: Cell::new(0),
            finalized: false,
            wire: RefCell::new(None),
        }
    }

    /// Reassemble a packet from decoded frame pieces.
    #[must_use]
    pub fn from_parts(header: PacketHeader, footer: PacketFooter, payload: &[u8]) -> Self {
        Self {
            data_id: header.data_id,
            flags: header.flags,
            payload: payload.to_vec(),
            checksum: footer.checksum,
            sender_id: footer.sender_id,
            read_idx: Cell::new(0),
            finalized: false,
            wire: RefCell::new(None),
        }
    }

    fn touch(&mut self) {
        self.wire.get_mut().take();
    }

    /// Message kind tag.
    #[must_use]
    pub fn data_id(&self) -> DataId {
        self.data_id
    }

    /// Replace the message kind tag.
    pub fn set_data_id(&mut self, data_id: DataId) {
        self.data_id = data_id;
        self.touch();
    }

    /// Current payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Bytes of payload not yet consumed by the read cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len().saturating_sub(self.read_idx.get())
    }

    /// Append a typed scalar, little-endian.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadOverflow`] when the value does not fit.
    pub fn add<T: PayloadValue>(&mut self, value: T) -> Result<()> {
        self.reserve(T::WIDTH)?;
        value.put_le(&mut self.payload);
        self.touch();
        Ok(())
    }

    /// Append raw bytes verbatim, with no endianness adjustment.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadOverflow`] when the run does not fit.
    pub fn add_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?;
        self.payload.extend_from_slice(data);
        self.touch();
        Ok(())
    }

    /// Append a string as a 16-bit length prefix followed by its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadOverflow`] when prefix plus bytes do
    /// not fit; the payload is left untouched on failure.
    pub fn add_string(&mut self, value: &str) -> Result<()> {
        self.reserve(2 + value.len())?;
        self.add(value.len() as u16)?;
        self.add_bytes(value.as_bytes())
    }

    fn reserve(&self, extra: usize) -> Result<()> {
        if self.payload.len() + extra > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadOverflow {
                requested: extra,
                capacity: MAX_PAYLOAD_SIZE - self.payload.len(),
            });
        }
        Ok(())
    }

    /// Pop a typed scalar from the read cursor.
    ///
    /// Reading past the available payload yields the zero value and leaves
    /// the cursor where it was.
    #[must_use]
    pub fn remove<T: PayloadValue>(&self) -> T {
        let at = self.read_idx.get();
        if self.payload.len() < at + T::WIDTH {
            return T::default();
        }
        let value = T::get_le(&self.payload[at..]);
        self.read_idx.set(at + T::WIDTH);
        value
    }

    /// Pop a raw byte run from the read cursor.
    ///
    /// Returns `None` without moving the cursor when fewer than `len` bytes
    /// remain.
    #[must_use]
    pub fn remove_bytes(&self, len: usize) -> Option<&[u8]> {
        let at = self.read_idx.get();
        if self.payload.len() < at + len {
            return None;
        }
        self.read_idx.set(at + len);
        Some(&self.payload[at..at + len])
    }

    /// Pop a length-prefixed string from the read cursor.
    ///
    /// Returns the empty string when the prefix or the bytes it promises
    /// are not present.
    #[must_use]
    pub fn remove_string(&self) -> String {
        if self.remaining() < 2 {
            return String::new();
        }
        let len = self.remove::<u16>() as usize;
        match self.remove_bytes(len) {
            Some(raw) => String::from_utf8_lossy(raw).into_owned(),
            None => String::new(),
        }
    }

    /// Rewind the read cursor to the payload front.
    pub fn reset(&self) {
        self.read_idx.set(0);
    }

    /// Drop all payload data, rewind the cursor, and undo finalization.
    pub fn clear(&mut self) {
        self.reset();
        self.payload.clear();
        self.finalized = false;
        self.touch();
    }

    /// Check a flag bit.
    #[must_use]
    pub fn flag(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    /// All current flags.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Set or clear a flag bit.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Finalized`] for the footer bits (checksum,
    /// sender id) once the packet has been finalized. Custom bits stay
    /// writable.
    pub fn set_flag(&mut self, flag: PacketFlags, on: bool) -> Result<()> {
        if self.finalized && flag.intersects(PacketFlags::FOOTER_BITS) {
            return Err(CodecError::Finalized);
        }
        self.flags.set(flag, on);
        self.touch();
        Ok(())
    }

    /// Whether the footer has been frozen.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Freeze the footer.
    ///
    /// Sets the footer flag bits to the requested combination, records the
    /// sender id, and computes the checksum last so it covers the final
    /// flag byte and sender id. Must precede datagram transmission of
    /// application packets.
    pub fn finalize(&mut self, add_checksum: bool, add_sender: bool, sender_id: ClientId) {
        self.finalized = false;
        self.flags.set(PacketFlags::CHECKSUM, add_checksum);
        self.flags.set(PacketFlags::SENDER_ID, add_sender);
        if add_sender {
            self.sender_id = sender_id;
        }
        if add_checksum {
            self.checksum = self.compute_checksum();
        }
        self.finalized = true;
        self.touch();
    }

    /// Wrapping signed 32-bit sum over the payload bytes (as i8), the data
    /// id, the payload size, the flag byte (as i8), and the sender id.
    #[must_use]
    pub fn compute_checksum(&self) -> i32 {
        let mut sum: i32 = 0;
        for &byte in &self.payload {
            sum = sum.wrapping_add(i32::from(byte as i8));
        }
        sum.wrapping_add(i32::from(self.data_id))
            .wrapping_add(self.payload.len() as u16 as i32)
            .wrapping_add(i32::from(self.flags.to_byte() as i8))
            .wrapping_add(self.sender_id as i32)
    }

    /// True when the checksum flag is clear, or when the stored checksum
    /// matches a fresh computation.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.flag(PacketFlags::CHECKSUM) || self.checksum == self.compute_checksum()
    }

    /// The sender id recorded in the footer. Only meaningful when the
    /// sender-id flag is set.
    #[must_use]
    pub fn sender_id(&self) -> ClientId {
        self.sender_id
    }

    /// The checksum recorded in the footer. Only meaningful when the
    /// checksum flag is set.
    #[must_use]
    pub fn checksum(&self) -> i32 {
        self.checksum
    }

    /// Header view of this packet's current state.
    #[must_use]
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            data_id: self.data_id,
            payload_size: self.payload.len() as u16,
            flags: self.flags,
        }
    }

    /// Footer width implied by the current flags.
    #[must_use]
    pub fn footer_len(&self) -> usize {
        PacketFooter::len_for(self.flags)
    }

    /// Total on-wire size of this packet.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        PacketHeader::SIZE + self.payload.len() + self.footer_len()
    }

    /// Lay the frame out contiguously and return its byte image.
    ///
    /// The image is cached: repeated calls without an intervening mutation
    /// return the identical bytes at no cost.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut cache = self.wire.borrow_mut();
        if let Some(image) = cache.as_ref() {
            return image.clone();
        }

        let mut out = BytesMut::with_capacity(self.frame_size());
        self.header().write(&mut out);
        out.put_slice(&self.payload);
        PacketFooter {
            checksum: self.checksum,
            sender_id: self.sender_id,
        }
        .write(self.flags, &mut out);

        let image = out.freeze();
        *cache = Some(image.clone());
        image
    }
}

/// Outcome of scanning a receive accumulator for one frame.
#[derive(Debug)]
pub enum FrameStep {
    /// Not enough bytes for a whole frame yet; wait for more.
    Incomplete,
    /// The header declares a payload larger than any frame may carry. The
    /// accumulator cannot be resynchronized and must be discarded.
    Oversize,
    /// One whole frame, decoded, along with the bytes it occupied.
    Frame {
        /// The decoded packet.
        packet: Packet,
        /// Bytes consumed from the front of the buffer.
        size: usize,
    },
}

/// Scan the front of `buf` for a single frame.
///
/// This is the shared entry point of both receive pipelines: it tolerates
/// partial frames (returning [`FrameStep::Incomplete`]) and flags headers
/// whose declared payload exceeds the frame budget before any allocation.
#[must_use]
pub fn decode_frame(buf: &[u8]) -> FrameStep {
    let Ok(header) = PacketHeader::peek(buf) else {
        return FrameStep::Incomplete;
    };
    if header.payload_size as usize > MAX_PAYLOAD_SIZE {
        return FrameStep::Oversize;
    }
    let size = header.frame_size();
    if buf.len() < size {
        return FrameStep::Incomplete;
    }
    let Ok(footer) = PacketFooter::peek(buf, &header) else {
        return FrameStep::Incomplete;
    };
    let payload = &buf[PacketHeader::SIZE..PacketHeader::SIZE + header.payload_size as usize];
    FrameStep::Frame {
        packet: Packet::from_parts(header, footer, payload),
        size,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::MAX_FRAME_SIZE;

    #[test]
    fn payload_is_a_stack() {
        let mut pack = Packet::with_id(9);
        pack.add(0xAABBu16).unwrap();
        pack.add_string("hello").unwrap();
        pack.add(1.5f32).unwrap();

        assert_eq!(pack.remove::<u16>(), 0xAABB);
        assert_eq!(pack.remove_string(), "hello");
        assert_eq!(pack.remove::<f32>(), 1.5);
        assert_eq!(pack.remaining(), 0);

        pack.reset();
        assert_eq!(pack.remove::<u16>(), 0xAABB);
    }

    #[test]
    fn over_read_yields_zero() {
        let mut pack = Packet::with_id(9);
        pack.add(7u8).unwrap();
        assert_eq!(pack.remove::<u32>(), 0);
        assert_eq!(pack.remove::<u8>(), 7);
        assert_eq!(pack.remove::<u8>(), 0);
    }

    #[test]
    fn malformed_string_length_yields_empty() {
        let mut pack = Packet::with_id(9);
        pack.add(200u16).unwrap(); // promises 200 bytes that never follow
        assert_eq!(pack.remove_string(), "");
    }

    #[test]
    fn payload_capacity_is_enforced() {
        let mut pack = Packet::with_id(9);
        pack.add_bytes(&vec![0u8; crate::MAX_PAYLOAD_SIZE]).unwrap();
        assert_eq!(
            pack.add(0u8),
            Err(CodecError::PayloadOverflow { requested: 1, capacity: 0 })
        );
        assert!(pack.frame_size() <= MAX_FRAME_SIZE);
    }

    #[test]
    fn checksum_known_value() {
        let mut pack = Packet::with_id(7);
        pack.add(0xFFu8).unwrap(); // -1 as a signed byte
        pack.finalize(true, true, 0);

        // -1 (payload) + 7 (id) + 1 (size) + 3 (flag byte) + 0 (sender)
        assert_eq!(pack.checksum(), 10);
        assert!(pack.is_valid());
    }

    #[test]
    fn checksum_covers_sender_id() {
        let mut a = Packet::with_id(7);
        a.add(1u8).unwrap();
        a.finalize(true, true, 1);
        let mut b = a.clone();
        b.finalize(true, true, 2);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn flipping_any_payload_byte_breaks_the_checksum() {
        let mut pack = Packet::with_id(8);
        pack.add_string("payload under test").unwrap();
        pack.finalize(true, true, 3);
        let wire = pack.serialize();

        for idx in PacketHeader::SIZE..PacketHeader::SIZE + pack.payload_len() {
            let mut corrupt = wire.to_vec();
            corrupt[idx] ^= 0x40;
            match decode_frame(&corrupt) {
                FrameStep::Frame { packet, .. } => {
                    assert!(!packet.is_valid(), "byte {idx} flip went unnoticed");
                }
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn finalize_locks_footer_flags_only() {
        let mut pack = Packet::with_id(9);
        pack.finalize(true, false, 0);
        assert_eq!(
            pack.set_flag(PacketFlags::SENDER_ID, true),
            Err(CodecError::Finalized)
        );
        assert_eq!(pack.set_flag(PacketFlags::CUSTOM_2, true), Ok(()));
        assert!(pack.flag(PacketFlags::CUSTOM_2));
    }

    #[test]
    fn serialize_is_idempotent_until_mutation() {
        let mut pack = Packet::with_id(21);
        pack.add(99u32).unwrap();
        let first = pack.serialize();
        let second = pack.serialize();
        assert_eq!(first, second);

        pack.add(1u8).unwrap();
        assert_ne!(pack.serialize(), first);
    }

    #[test]
    fn wire_image_is_byte_exact() {
        let mut pack = Packet::with_id(0x0102);
        pack.add(0x0A0Bu16).unwrap();
        let wire = pack.serialize();
        // host byte order never leaks into the image
        assert_eq!(&wire[..], [0x02, 0x01, 0x02, 0x00, 0x00, 0x0B, 0x0A]);
    }

    #[test]
    fn decode_frame_tolerates_partial_input() {
        let mut pack = Packet::with_id(30);
        pack.add_string("split me").unwrap();
        pack.finalize(true, true, 4);
        let wire = pack.serialize();

        for cut in 0..wire.len() {
            assert!(
                matches!(decode_frame(&wire[..cut]), FrameStep::Incomplete),
                "prefix of {cut} bytes should be incomplete"
            );
        }
        match decode_frame(&wire) {
            FrameStep::Frame { packet, size } => {
                assert_eq!(size, wire.len());
                assert_eq!(packet, pack);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn decode_frame_flags_oversize_headers() {
        let header = PacketHeader {
            data_id: 7,
            payload_size: (crate::MAX_PAYLOAD_SIZE + 1) as u16,
            flags: PacketFlags::empty(),
        };
        let mut wire = Vec::new();
        header.write(&mut wire);
        assert!(matches!(decode_frame(&wire), FrameStep::Oversize));
    }

    proptest! {
        #[test]
        fn frame_round_trip(
            data_id in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..=crate::MAX_PAYLOAD_SIZE),
            with_checksum in any::<bool>(),
            with_sender in any::<bool>(),
            sender in any::<u32>(),
        ) {
            let mut pack = Packet::with_id(data_id);
            pack.add_bytes(&payload).unwrap();
            pack.finalize(with_checksum, with_sender, sender);

            let wire = pack.serialize();
            prop_assert!(wire.len() <= MAX_FRAME_SIZE);

            match decode_frame(&wire) {
                FrameStep::Frame { packet, size } => {
                    prop_assert_eq!(size, wire.len());
                    prop_assert_eq!(&packet, &pack);
                    prop_assert!(packet.is_valid());
                    // re-serialization of the decoded side is byte identical
                    prop_assert_eq!(packet.serialize(), wire);
                }
                other => prop_assert!(false, "expected frame, got {:?}", other),
            }
        }
    }
}
