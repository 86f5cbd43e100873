//! Digital signatures over consensus envelopes, backed by `ring`'s ECDSA
//! implementation over the P-256 curve.

use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, EcdsaVerificationAlgorithm, KeyPair as RingKeyPair, UnparsedPublicKey,
    ECDSA_P256_SHA256_ASN1, ECDSA_P256_SHA256_ASN1_SIGNING,
};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

const VERIFY_ALG: &EcdsaVerificationAlgorithm = &ECDSA_P256_SHA256_ASN1;

/// A keypair used to sign outgoing envelopes.
pub struct KeyPair {
    pkcs8: Vec<u8>,
    inner: EcdsaKeyPair,
}

impl KeyPair {
    /// Generates a fresh keypair.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .simple(ErrorKind::CryptoSignature)?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Loads a keypair from a PKCS#8-encoded document.
    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self> {
        let inner = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, bytes)
            .simple(ErrorKind::CryptoSignature)?;
        Ok(Self {
            pkcs8: bytes.to_vec(),
            inner,
        })
    }

    /// Returns the public key matching this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.public_key().as_ref().to_vec())
    }

    /// Signs an arbitrary message, producing a `Signature`.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let rng = SystemRandom::new();
        let sig = self
            .inner
            .sign(&rng, message)
            .simple(ErrorKind::CryptoSignature)?;
        Ok(Signature(sig.as_ref().to_vec()))
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_pkcs8(&self.pkcs8).expect("previously-valid pkcs8 document became invalid")
    }
}

/// A peer's public key, used to verify envelope signatures.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Verifies that `signature` is a valid signature of `message` under
    /// this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        UnparsedPublicKey::new(VERIFY_ALG, &self.0)
            .verify(message, &signature.0)
            .simple(ErrorKind::CryptoSignature)
    }
}

/// A detached ECDSA signature, serialized in ASN.1/DER form.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone, Eq, PartialEq)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Max length of an ECDSA P-256 ASN.1 signature.
    pub const LENGTH: usize = 72;

    /// Builds a `Signature` directly out of its raw bytes.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.is_empty() {
            return Err("Signature has an invalid length").wrapped(ErrorKind::CryptoSignature);
        }
        Ok(Signature(raw_bytes.to_vec()))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"hello swarm").unwrap();
        kp.public_key().verify(b"hello swarm", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"hello swarm").unwrap();
        assert!(kp.public_key().verify(b"goodbye swarm", &sig).is_err());
    }
}
