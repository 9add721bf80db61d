//! stickypub-core
//!
//! Content-addressed data model, canonical encoding, and signing primitives
//! for the StickyPub sticky publish/subscribe protocol.
//!
//! # Modules
//!
//! - [`id`]: 160-bit identifiers and Ed25519 keypair primitives
//! - [`canonical`]: deterministic serialization for hashing/signing
//! - [`message`]: a single signed publication (`Message`, `MessageMeta`)
//! - [`message_collection`]: content-addressed message-metadata sets
//! - [`subscriber_collection`]: content-addressed subscriber sets
//! - [`coordinator`]: the per-topic coordinator head and its snapshots
//! - [`error`]: error types

pub mod canonical;
pub mod coordinator;
pub mod error;
pub mod id;
pub mod message;
pub mod message_collection;
pub mod subscriber_collection;

pub use coordinator::{CoordinatorObject, CoordinatorSnapshot, CoordinatorState};
pub use error::{Error, Result};
pub use id::{verify, Id160, KeyPair, PublicKey, Signature64};
pub use message::{Message, MessageMeta};
pub use message_collection::MessageCollection;
pub use subscriber_collection::{assign_initiator_index, coordinator_slot, SubscriberCollection, SubscriberMeta};
