//! 160-bit identifiers and keypair primitives.
//!
//! IDs are the truncated BLAKE3 digest of their defining bytes, rendered as
//! 40 lowercase hex characters. Truncating to 20 bytes keeps every ID in the
//! repository on a single, deterministic hash function while matching the
//! 160-bit width Kademlia-style DHTs conventionally use for node and key IDs.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Width of every identifier in the data model, in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// A 160-bit content or node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id160(pub [u8; ID_LEN]);

impl Id160 {
    pub const ZERO: Id160 = Id160([0u8; ID_LEN]);

    /// Deterministic content hash: `newID(bytes)`.
    pub fn new(bytes: &[u8]) -> Self {
        let digest = blake3::hash(bytes);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Id160(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Validation(format!("bad hex id: {e}")))?;
        if bytes.len() != ID_LEN {
            return Err(Error::Validation(format!(
                "id must be {ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&bytes);
        Ok(Id160(id))
    }
}

impl fmt::Display for Id160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id160({})", self.to_hex())
    }
}

/// An Ed25519 keypair used by publishers and subscribers to sign their
/// respective records.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// `generateKeypair()`
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic construction from a 32-byte seed, for tests and local
    /// identity recovery.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// The 32-byte seed `from_seed` can later reconstruct this keypair from,
    /// for callers that persist identity across restarts.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// `sign(privateKey, bytes)`
    pub fn sign(&self, bytes: &[u8]) -> Signature64 {
        Signature64(self.signing_key.sign(bytes).to_bytes())
    }
}

/// An Ed25519 public key, 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn id(&self) -> Id160 {
        Id160::new(&self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// A detached Ed25519 signature, 64 bytes.
#[derive(Clone, Serialize, Deserialize)]
pub struct Signature64(pub [u8; 64]);

impl fmt::Debug for Signature64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature64({}…)", &hex::encode(self.0)[..16])
    }
}

/// `verify(publicKey, bytes, signature) -> bool`
pub fn verify(public_key: &PublicKey, bytes: &[u8], signature: &Signature64) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    let sig = Signature::from_bytes(&signature.0);
    verifying_key.verify(bytes, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic() {
        let a = Id160::new(b"topic-one");
        let b = Id160::new(b"topic-one");
        assert_eq!(a, b);
        assert_ne!(a, Id160::new(b"topic-two"));
    }

    #[test]
    fn id_hex_round_trips() {
        let id = Id160::new(b"round trip me");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(Id160::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello stickypub";
        let sig = kp.sign(msg);
        assert!(verify(&kp.public_key(), msg, &sig));

        let other = KeyPair::generate();
        assert!(!verify(&other.public_key(), msg, &sig));
    }

    #[test]
    fn seeded_keypair_is_deterministic() {
        let seed = [7u8; 32];
        let a = KeyPair::from_seed(&seed);
        let b = KeyPair::from_seed(&seed);
        assert_eq!(a.public_key().0, b.public_key().0);
    }
}
