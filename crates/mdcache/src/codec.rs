//! bincode helpers shared by the wire payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Serializes `value`.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserializes a `T` that must span all of `bytes`.
pub fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut cursor = bytes;
    let value = bincode::deserialize_from(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(CacheError::TrailingBytes(cursor.len()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_exact_rejects_trailing() {
        let mut bytes = encode(&7u32).unwrap();
        assert_eq!(decode_exact::<u32>(&bytes).unwrap(), 7);
        bytes.push(0);
        match decode_exact::<u32>(&bytes) {
            Err(CacheError::TrailingBytes(1)) => {}
            other => panic!("expected TrailingBytes(1), got {:?}", other),
        }
    }

    #[test]
    fn test_decode_exact_rejects_truncated() {
        let bytes = encode(&(1u64, 2u64)).unwrap();
        match decode_exact::<(u64, u64)>(&bytes[..10]) {
            Err(CacheError::Decode(_)) => {}
            other => panic!("expected Decode, got {:?}", other),
        }
    }
}
