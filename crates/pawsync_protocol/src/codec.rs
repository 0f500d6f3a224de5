//! CBOR encoding and payload checksums.
//!
//! Every persisted record is encoded with `ciborium`. Struct fields are
//! emitted in declaration order, so encoding the same value twice yields
//! identical bytes, which is what makes the payload checksum stable.

use crate::entity::EntityPayload;
use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 digest of an encoded payload.
pub type Checksum = [u8; 32];

/// Encodes a value to CBOR bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Computes the checksum stored next to every entity payload.
pub fn payload_checksum(payload: &EntityPayload) -> ProtocolResult<Checksum> {
    let bytes = encode(payload)?;
    Ok(Sha256::digest(&bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Feeding;

    fn feeding(amount: u32) -> EntityPayload {
        EntityPayload::Feeding(Feeding {
            dog_id: "dog-1".into(),
            product_id: None,
            amount_grams: amount,
            fed_at: 1_700_000_000_000,
            notes: None,
        })
    }

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let a = payload_checksum(&feeding(100)).unwrap();
        let b = payload_checksum(&feeding(100)).unwrap();
        let c = payload_checksum(&feeding(150)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn decode_rejects_garbage() {
        let result: ProtocolResult<EntityPayload> = decode(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
