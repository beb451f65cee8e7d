//! Fuzz target for frame parsing
//!
//! The reader must only ever return frames, a clean end, or an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::FrameReader;

fuzz_target!(|data: &[u8]| {
    for buffered in [true, false] {
        let mut reader = FrameReader::new(data, buffered);
        while let Ok(Some(frame)) = reader.read_frame() {
            // Payload-carrying frames consume their declared size
            if let Ok(size) = frame.parse_arg::<usize>(frame.args().len().saturating_sub(1)) {
                if reader.discard(size.min(1 << 16)).is_err() {
                    break;
                }
            }
        }
    }
});
