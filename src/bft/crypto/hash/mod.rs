//! Content hashing, used to address requests, operations and checkpoints.
//!
//! Backed by `blake3`, matching the teacher crate's own
//! `crypto_hash_blake3_blake3` default feature.

use std::fmt;
use std::hash::{Hash, Hasher};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// Incremental hasher, producing a `Digest` once finalized.
pub struct Context(blake3::Hasher);

impl Context {
    /// Creates a new, empty hashing context.
    pub fn new() -> Self {
        Context(blake3::Hasher::new())
    }

    /// Feeds more data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Consumes the context, producing the final `Digest`.
    pub fn finish(self) -> Digest {
        Digest(*self.0.finalize().as_bytes())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A cryptographic content digest.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    /// Length, in bytes, of a digest.
    pub const LENGTH: usize = blake3::OUT_LEN;

    /// Digest of an empty byte slice, used as the initial checkpoint's
    /// placeholder hash before any real checkpoint has stabilized.
    ///
    /// Mirrors the original implementation's `INITIAL_CHECKPOINT_HASH`
    /// sentinel (there stored as the literal string `"<null db state>"`).
    pub fn initial() -> Self {
        Self::from_data(b"<null db state>")
    }

    /// Sentinel hash standing in for a re-issued no-op pre-prepare during a
    /// view-change, when no prepared-proof exists for a given sequence.
    pub fn no_op() -> Self {
        Self::from_data(b"<no-op>")
    }

    /// Hashes `data` in one shot.
    pub fn from_data(data: &[u8]) -> Self {
        let mut ctx = Context::new();
        ctx.update(data);
        ctx.finish()
    }

    /// Parses a `Digest` out of a byte slice of the appropriate length.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHash);
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Hash for Digest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_digest() {
        let a = Digest::from_data(b"swarm");
        let b = Digest::from_data(b"swarm");
        assert_eq!(a, b);
    }

    #[test]
    fn different_input_different_digest() {
        let a = Digest::from_data(b"swarm");
        let b = Digest::from_data(b"swarm!");
        assert_ne!(a, b);
    }
}
