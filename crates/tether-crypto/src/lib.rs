//! # Tether Crypto
//!
//! Cryptographic primitives for the Tether peer-connection engine.
//!
//! This crate provides:
//! - A multi-round digest used for peering identifiers, authentication
//!   hashes and session key derivation
//! - A keyed stream cipher applied to the connection byte stream
//! - Session key material that is zeroized on drop
//! - Secure random number generation
//! - Constant-time comparison
//!
//! ## Primitive Suite
//!
//! | Function | Algorithm | Output / Key |
//! |----------|-----------|--------------|
//! | Digest | SHA-512, repeated `R` rounds | 64 bytes |
//! | Stream cipher | AES-256-CTR | 32-byte key, 16-byte IV |
//! | Randomness | OS CSPRNG | - |
//!
//! Both primitives sit behind small traits ([`Digest`], [`KeyStream`]) so the
//! engine never depends on the concrete algorithm.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cipher;
pub mod constant_time;
pub mod digest;
pub mod error;
pub mod random;

pub use cipher::{Aes256Ctr, CipherKey, KeyStream};
pub use digest::{Digest, Sha512};
pub use error::CryptoError;

/// Shared round count `R` applied by every protocol digest.
pub const DIGEST_ROUNDS: u32 = 5000;

/// Digest output size in bytes.
pub const DIGEST_SIZE: usize = 64;

/// Stream cipher key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Stream cipher IV size in bytes.
pub const IV_SIZE: usize = 16;

/// Handshake nonce size in bytes.
pub const NONCE_SIZE: usize = 16;

/// Authentication salt size in bytes.
pub const SALT_SIZE: usize = 16;
