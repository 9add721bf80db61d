//! Message: a single signed, immutable publication record.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::id::{verify, Id160, KeyPair, PublicKey, Signature64};

/// A single signed, immutable publication.
///
/// `added_in_version` is set once at construction time (a placeholder of `0`
/// until the publisher learns the coordinator's version) and is **not**
/// covered by the signature: a message's effective "added in version" is
/// revised via the compact [`MessageMeta`] entry carried in a
/// `MessageCollection`, never by re-signing the `Message` itself. Everything
/// else is signed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub topic_id: Id160,
    pub publisher_id: Id160,
    pub publisher_sequence: u64,
    pub added_in_version: u64,
    pub data: Vec<u8>,
    pub published_at: i64,
    pub expires_at: i64,
    pub message_id: Id160,
    pub signature: Option<Signature64>,
}

/// The fields covered by a message's signature, in signing order.
#[derive(Serialize)]
struct Signable<'a> {
    topic_id: &'a Id160,
    publisher_id: &'a Id160,
    publisher_sequence: u64,
    data: &'a [u8],
    published_at: i64,
    expires_at: i64,
    message_id: &'a Id160,
}

/// The fields that define `messageID`:
/// `messageID = hash(topicID ∥ publisherID ∥ publisherSequence ∥ publishedAt)`.
#[derive(Serialize)]
struct IdInput<'a> {
    topic_id: &'a Id160,
    publisher_id: &'a Id160,
    publisher_sequence: u64,
    published_at: i64,
}

fn compute_message_id(
    topic_id: &Id160,
    publisher_id: &Id160,
    publisher_sequence: u64,
    published_at: i64,
) -> Result<Id160> {
    let input = IdInput {
        topic_id,
        publisher_id,
        publisher_sequence,
        published_at,
    };
    Ok(Id160::new(&canonical_bytes(&input)?))
}

impl Message {
    /// Construct an unsigned message. `added_in_version` starts at the
    /// placeholder value `0` until a coordinator write assigns the real one.
    pub fn new(
        topic_id: Id160,
        publisher_id: Id160,
        publisher_sequence: u64,
        data: Vec<u8>,
        published_at: i64,
        expires_at: i64,
    ) -> Result<Self> {
        if published_at > expires_at {
            return Err(Error::InvalidTimeRange(
                "published_at must be <= expires_at".into(),
            ));
        }
        let message_id = compute_message_id(&topic_id, &publisher_id, publisher_sequence, published_at)?;
        Ok(Self {
            topic_id,
            publisher_id,
            publisher_sequence,
            added_in_version: 0,
            data,
            published_at,
            expires_at,
            message_id,
            signature: None,
        })
    }

    fn signable_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(&Signable {
            topic_id: &self.topic_id,
            publisher_id: &self.publisher_id,
            publisher_sequence: self.publisher_sequence,
            data: &self.data,
            published_at: self.published_at,
            expires_at: self.expires_at,
            message_id: &self.message_id,
        })
    }

    /// `sign(privateKey)`: fills in `signature`.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(keypair.sign(&bytes));
        Ok(())
    }

    /// `verify(publicKey)`
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        let Some(sig) = &self.signature else {
            return false;
        };
        let Ok(bytes) = self.signable_bytes() else {
            return false;
        };
        verify(public_key, &bytes, sig)
    }

    /// `isExpired(now)`
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// `validate(publicKey)`: presence, messageID derivation, time range, signature.
    pub fn validate(&self, public_key: &PublicKey) -> Result<()> {
        if self.signature.is_none() {
            return Err(Error::InvalidSignature);
        }
        if self.published_at > self.expires_at {
            return Err(Error::InvalidTimeRange(
                "published_at must be <= expires_at".into(),
            ));
        }
        let computed = compute_message_id(
            &self.topic_id,
            &self.publisher_id,
            self.publisher_sequence,
            self.published_at,
        )?;
        if computed != self.message_id {
            return Err(Error::HashMismatch {
                computed: computed.to_hex(),
                transmitted: self.message_id.to_hex(),
            });
        }
        if !self.verify(public_key) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// The compact metadata record this message contributes to a
    /// `MessageCollection`.
    pub fn to_meta(&self) -> MessageMeta {
        MessageMeta {
            message_id: self.message_id,
            publisher_id: self.publisher_id,
            publisher_sequence: self.publisher_sequence,
            added_in_version: self.added_in_version,
            expires_at: self.expires_at,
        }
    }
}

/// Compact message-metadata record carried inside a `MessageCollection`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMeta {
    pub message_id: Id160,
    pub publisher_id: Id160,
    pub publisher_sequence: u64,
    pub added_in_version: u64,
    pub expires_at: i64,
}
