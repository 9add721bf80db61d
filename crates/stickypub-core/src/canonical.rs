//! Canonical encoding for signing and hashing.
//!
//! All hashed/signed objects use postcard serialization: field order is Rust
//! struct field order, which is why every "unsigned"/"without_id" hashable
//! view below lists its fields in the same order as the public type it
//! mirrors. The same encoding is used for signing (the view simply omits the
//! `signature` field) and for DHT wire values.

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations in
/// stickypub; every participant must produce identical bytes for identical
/// values.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn canonical_bytes_is_deterministic() {
        let p = Pair { a: 1, b: 2 };
        assert_eq!(canonical_bytes(&p).unwrap(), canonical_bytes(&p).unwrap());
    }

    #[test]
    fn canonical_bytes_is_field_order_sensitive() {
        let p1 = Pair { a: 1, b: 2 };
        let p2 = Pair { a: 2, b: 1 };
        assert_ne!(canonical_bytes(&p1).unwrap(), canonical_bytes(&p2).unwrap());
    }
}
