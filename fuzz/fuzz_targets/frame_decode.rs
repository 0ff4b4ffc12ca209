//! Frame decoding fuzzer.
//!
//! Throws arbitrary bytes at the framing entry point and checks the
//! structural invariants: no panic on any input, and any frame that does
//! decode re-serializes to the exact bytes it was cut from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::{decode_frame, FrameStep, PacketHeader, MAX_PAYLOAD_SIZE};

fuzz_target!(|data: &[u8]| {
    match decode_frame(data) {
        FrameStep::Incomplete => {
            // a whole well-formed frame must never be reported incomplete
            if let Ok(header) = PacketHeader::peek(data) {
                if header.payload_size as usize <= MAX_PAYLOAD_SIZE {
                    assert!(data.len() < header.frame_size());
                }
            }
        }
        FrameStep::Oversize => {
            let header = PacketHeader::peek(data).expect("oversize implies a readable header");
            assert!(header.payload_size as usize > MAX_PAYLOAD_SIZE);
        }
        FrameStep::Frame { packet, size } => {
            assert!(size <= data.len());
            assert_eq!(packet.frame_size(), size);
            // reading past the payload yields zeros, never a fault
            let _ = packet.remove::<u64>();
            let _ = packet.remove_string();
            // the byte image round-trips exactly
            assert_eq!(&packet.serialize()[..], &data[..size]);
        }
    }
});
