//! Multi-round digest.
//!
//! Every identifier, authentication hash and session key in the protocol is
//! the output of one digest applied `R` times: the first round hashes the
//! input, each further round hashes the previous output.

use sha2::Digest as _;

/// A fixed-output digest that can be iterated.
pub trait Digest {
    /// Output size in bytes.
    const OUTPUT_SIZE: usize;

    /// Hash `data` once.
    fn digest(data: &[u8]) -> Vec<u8>;

    /// Hash `data`, then re-hash the output until `rounds` hashes were applied.
    ///
    /// `rounds == 0` is treated as a single round.
    fn digest_rounds(data: &[u8], rounds: u32) -> Vec<u8> {
        let mut out = Self::digest(data);
        for _ in 1..rounds {
            out = Self::digest(&out);
        }
        out
    }
}

/// SHA-512 digest (64-byte output).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha512;

impl Digest for Sha512 {
    const OUTPUT_SIZE: usize = 64;

    fn digest(data: &[u8]) -> Vec<u8> {
        sha2::Sha512::digest(data).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha512_known_vector() {
        let out = Sha512::digest(b"abc");
        assert_eq!(
            hex::encode(&out[..16]),
            "ddaf35a193617abacc417349ae204131"
        );
        assert_eq!(out.len(), Sha512::OUTPUT_SIZE);
    }

    #[test]
    fn test_rounds_chain_previous_output() {
        let once = Sha512::digest(b"tether");
        let twice = Sha512::digest(&once);
        assert_eq!(Sha512::digest_rounds(b"tether", 2), twice);
        assert_eq!(Sha512::digest_rounds(b"tether", 1), once);
        assert_eq!(Sha512::digest_rounds(b"tether", 0), once);
    }

    #[test]
    fn test_round_count_changes_output() {
        assert_ne!(
            Sha512::digest_rounds(b"secret", 10),
            Sha512::digest_rounds(b"secret", 11)
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn extra_round_hashes_previous_output(
                data in prop::collection::vec(any::<u8>(), 0..128),
                rounds in 1u32..16,
            ) {
                let previous = Sha512::digest_rounds(&data, rounds);
                prop_assert_eq!(
                    Sha512::digest_rounds(&data, rounds + 1),
                    Sha512::digest(&previous)
                );
            }
        }
    }
}
