//! Fuzz target for identifier parsing
//!
//! Anything that parses must print back to a string that parses to the
//! same identifier.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::Identifier;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(id) = s.parse::<Identifier>() {
        let again: Identifier = id.to_string().parse().expect("display output parses");
        assert_eq!(again, id);
    }
});
