//! Fuzz target for the pre-authentication read path
//!
//! Arbitrary bytes arriving on a fresh connection are decrypted with the
//! obfuscation key and parsed unbuffered, exactly as an acceptor does.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::FrameReader;
use tether_core::stream::{CipherReader, obfuscation_key};

fuzz_target!(|data: &[u8]| {
    let mut inner = CipherReader::new(data, &obfuscation_key());
    inner.start_capture();
    let mut reader = FrameReader::new(inner, false);
    while let Ok(Some(_)) = reader.read_frame() {}
    let _ = reader.get_mut().take_capture();
});
