//! Canonical encoding and entry hashing
//!
//! Peer messages are serialized with postcard. Entry hashes are BLAKE3 over a
//! domain-separated, length-prefixed layout of the hashed fields, so every
//! node derives the same 64-bit digest for the same `(version, originator,
//! value)` triple regardless of how the entry reached it.

use crate::error::{Error, Result};
use crate::types::PeerMessage;
use blake3::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Domain prefix for entry hashes
pub const DOMAIN_VALUE: &[u8] = b"areakv-value-v1";

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize canonical bytes produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Encode a peer message for the wire.
pub fn encode_message(message: &PeerMessage) -> Result<Vec<u8>> {
    canonical_bytes(message)
}

/// Decode a peer message from the wire.
pub fn decode_message(bytes: &[u8]) -> Result<PeerMessage> {
    from_canonical_bytes(bytes)
}

/// Compute the entry hash.
///
/// `hash = le_u64(BLAKE3("areakv-value-v1" || version || len(originator) ||
/// originator || tag(value) [|| len(value) || value])[..8])`
///
/// TTL fields are deliberately outside the hash: they change per hop.
pub fn value_hash(version: u64, originator_id: &str, value: Option<&[u8]>) -> u64 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_VALUE);
    hasher.update(&version.to_le_bytes());
    hasher.update(&(originator_id.len() as u64).to_le_bytes());
    hasher.update(originator_id.as_bytes());
    match value {
        Some(bytes) => {
            hasher.update(&[1]);
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        None => {
            hasher.update(&[0]);
        }
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Render a hash for logs.
pub fn hash_hex(hash: u64) -> String {
    hex::encode(hash.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    #[test]
    fn test_value_hash_deterministic() {
        let a = value_hash(1, "node1", Some(b"value1"));
        let b = value_hash(1, "node1", Some(b"value1"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_value_hash_covers_fields() {
        let base = value_hash(1, "node1", Some(b"value1"));
        assert_ne!(base, value_hash(2, "node1", Some(b"value1")));
        assert_ne!(base, value_hash(1, "node2", Some(b"value1")));
        assert_ne!(base, value_hash(1, "node1", Some(b"value2")));
        // Tombstone and absent value are distinct
        assert_ne!(value_hash(1, "node1", Some(b"")), value_hash(1, "node1", None));
    }

    #[test]
    fn test_length_prefix_prevents_ambiguity() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(
            value_hash(1, "ab", Some(b"c")),
            value_hash(1, "a", Some(b"bc"))
        );
    }

    #[test]
    fn test_message_encoding() {
        let mut entries = KeyVals::new();
        entries.insert("key1".into(), Value::new(3, "node1", b"v".to_vec(), 1000));
        let message = PeerMessage {
            area: AreaId::from("spine"),
            sender: NodeId::from("node1"),
            body: MessageBody::Update { entries },
        };

        let bytes = encode_message(&message).unwrap();
        let decoded = decode_message(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decoded_value_rehashes_payload() {
        let value = Value::new(4, "node9", b"payload".to_vec(), TTL_INFINITY);
        let bytes = canonical_bytes(&value).unwrap();
        let decoded: Value = from_canonical_bytes(&bytes).unwrap();
        assert_eq!(decoded.hash(), value_hash(4, "node9", Some(b"payload")));
        assert!(decoded.verify_hash().is_ok());
    }
}
