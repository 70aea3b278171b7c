//! Binary encoding of [`BucketState`] for storage and replication.
//!
//! Layout: `[b"TB"][u8 version][u32 CRC32 BE][bincode payload]`.

use thiserror::Error;

use super::bucket::BucketState;

const MAGIC: &[u8; 2] = b"TB";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Stored bytes could not be read back as a bucket state.
///
/// Callers recover by treating the bucket as absent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorruptStateError {
    #[error("Corrupt bucket state: truncated to {0} bytes")]
    Truncated(usize),
    #[error("Corrupt bucket state: bad magic bytes")]
    BadMagic,
    #[error("Corrupt bucket state: unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("Corrupt bucket state: checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Corrupt bucket state: {0}")]
    Malformed(String),
}

/// Encode a bucket state. Equal states always produce equal bytes.
pub fn encode(state: &BucketState) -> Vec<u8> {
    // Serializing fixed-width integers cannot fail
    let payload = bincode::serialize(state).unwrap_or_default();
    let crc = crc32fast::hash(&payload);

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&crc.to_be_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

/// Decode a bucket state, rejecting anything malformed or inconsistent.
pub fn decode(bytes: &[u8]) -> Result<BucketState, CorruptStateError> {
    if bytes.len() < HEADER_LEN {
        return Err(CorruptStateError::Truncated(bytes.len()));
    }
    if &bytes[..2] != MAGIC {
        return Err(CorruptStateError::BadMagic);
    }
    if bytes[2] != FORMAT_VERSION {
        return Err(CorruptStateError::UnsupportedVersion(bytes[2]));
    }

    let stored = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let payload = &bytes[HEADER_LEN..];
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(CorruptStateError::ChecksumMismatch { stored, computed });
    }

    let state: BucketState = bincode::deserialize(payload)
        .map_err(|e| CorruptStateError::Malformed(e.to_string()))?;

    if state.capacity == 0 || state.available_tokens > state.capacity {
        return Err(CorruptStateError::Malformed(format!(
            "{} tokens available in a bucket of capacity {}",
            state.available_tokens, state.capacity
        )));
    }

    Ok(state)
}
