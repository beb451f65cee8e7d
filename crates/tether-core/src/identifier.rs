//! Peer identifiers.
//!
//! An [`Identifier`] is a digest naming one directed peering, optionally
//! qualified by an instance name when the same identity runs on several
//! devices. Peerings are derived from a shared secret and an ordered name
//! pair, so both ends of a relationship can compute each other's ids
//! without exchanging anything.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tether_crypto::{DIGEST_ROUNDS, DIGEST_SIZE, Digest, Sha512};

/// A peering digest with an optional instance qualifier
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    digest: [u8; DIGEST_SIZE],
    instance: Option<String>,
}

impl Identifier {
    /// Create an identifier from a raw digest
    #[must_use]
    pub fn new(digest: [u8; DIGEST_SIZE]) -> Self {
        Self {
            digest,
            instance: None,
        }
    }

    /// Create an identifier from digest output
    ///
    /// # Errors
    ///
    /// Returns a protocol error if `bytes` is not exactly one digest long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let digest: [u8; DIGEST_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::protocol("identifier has wrong length"))?;
        Ok(Self::new(digest))
    }

    /// Same digest, qualified by `instance`
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Same digest, without instance
    #[must_use]
    pub fn peering(&self) -> Self {
        Self::new(self.digest)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Instance name, if any
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Lowercase hex of the digest alone
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// True if digests are equal and the instances do not contradict each
    /// other (an absent instance matches any instance)
    #[must_use]
    pub fn matches(&self, other: &Identifier) -> bool {
        self.digest == other.digest
            && match (&self.instance, &other.instance) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())?;
        if let Some(instance) = &self.instance {
            write!(f, ":{instance}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({}", &self.to_hex()[..16])?;
        if let Some(instance) = &self.instance {
            write!(f, ":{instance}")?;
        }
        f.write_str(")")
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (digest, instance) = match s.split_once(':') {
            Some((digest, instance)) => (digest, Some(instance)),
            None => (s, None),
        };

        let bytes = hex::decode(digest).map_err(|_| Error::protocol("identifier is not hex"))?;
        let id = Self::from_slice(&bytes)?;
        Ok(match instance {
            Some(instance) if !instance.is_empty() => id.with_instance(instance),
            _ => id,
        })
    }
}

/// The pair of ids naming one relationship from the local side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peering {
    /// Id under which the local side registers the relationship
    pub peering: Identifier,
    /// Id the remote side registers it under (the reverse direction)
    pub remote_peering: Identifier,
}

impl Peering {
    /// Derive both directions of a relationship from a shared secret
    ///
    /// `peering = Digest(secret ‖ local ‖ remote, R)` and `remote_peering`
    /// swaps the names, each component line-terminated.
    #[must_use]
    pub fn derive(secret: &[u8], local_name: &str, remote_name: &str) -> Self {
        Self {
            peering: derive_directed(secret, local_name, remote_name),
            remote_peering: derive_directed(secret, remote_name, local_name),
        }
    }
}

fn derive_directed(secret: &[u8], from: &str, to: &str) -> Identifier {
    let mut aggregate = Vec::with_capacity(secret.len() + from.len() + to.len() + 3);
    for part in [secret, from.as_bytes(), to.as_bytes()] {
        aggregate.extend_from_slice(part);
        aggregate.push(b'\n');
    }

    let out = Sha512::digest_rounds(&aggregate, DIGEST_ROUNDS);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&out[..DIGEST_SIZE]);
    Identifier::new(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peering_symmetry() {
        let alice = Peering::derive(b"shared secret", "alice", "bob");
        let bob = Peering::derive(b"shared secret", "bob", "alice");

        assert_eq!(alice.peering, bob.remote_peering);
        assert_eq!(alice.remote_peering, bob.peering);
        assert_ne!(alice.peering, alice.remote_peering);
    }

    #[test]
    fn test_peering_depends_on_secret() {
        let a = Peering::derive(b"one", "alice", "bob");
        let b = Peering::derive(b"two", "alice", "bob");
        assert_ne!(a.peering, b.peering);
    }

    #[test]
    fn test_display_parse_roundtrip_with_instance() {
        let id = Identifier::new([0xAB; DIGEST_SIZE]).with_instance("laptop");
        let text = id.to_string();
        assert!(text.ends_with(":laptop"));
        assert_eq!(text.parse::<Identifier>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("zz".parse::<Identifier>().is_err());
        assert!("abcd".parse::<Identifier>().is_err());
    }

    #[test]
    fn test_matches_ignores_missing_instance() {
        let base = Identifier::new([1; DIGEST_SIZE]);
        let laptop = base.clone().with_instance("laptop");
        let phone = base.clone().with_instance("phone");

        assert!(base.matches(&laptop));
        assert!(laptop.matches(&base));
        assert!(!laptop.matches(&phone));
        assert_eq!(laptop.peering(), base);
        assert!(!Identifier::new([2; DIGEST_SIZE]).matches(&base));
    }
}
