//! # Persistence Format
//!
//! Binary serialization for stored schema snapshots.
//!
//! Format: Header (5 bytes) + postcard-serialized [`Schema`].
//! - 4 bytes: Magic ("FDB1")
//! - 1 byte: Version
//!
//! The payload size is validated before deserialization and the header is
//! checked before the payload is parsed.

use crate::schema::Schema;
use crate::{FactDbError, primitives};

/// Maximum allowed payload size of an encoded schema snapshot.
pub const MAX_SCHEMA_PAYLOAD_SIZE: usize = 64 * 1024 * 1024; // 64 MB

const HEADER_SIZE: usize = 5;

// =============================================================================
// HEADER
// =============================================================================

/// The persistence header precedes every encoded snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    /// Create a new header with the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), FactDbError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(FactDbError::Serialization("invalid magic bytes".to_string()));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(FactDbError::Serialization(format!(
                "unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FactDbError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FactDbError::Serialization("header too short".to_string()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for PersistenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Encode a schema snapshot (header + payload).
pub fn schema_to_bytes(schema: &Schema) -> Result<Vec<u8>, FactDbError> {
    let payload = postcard::to_stdvec(schema).map_err(|e| FactDbError::Serialization(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&PersistenceHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Decode a schema snapshot.
pub fn schema_from_bytes(bytes: &[u8]) -> Result<Schema, FactDbError> {
    let header = PersistenceHeader::from_bytes(bytes)?;
    header.validate()?;

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() > MAX_SCHEMA_PAYLOAD_SIZE {
        return Err(FactDbError::Serialization(format!(
            "payload too large: {} bytes (max {MAX_SCHEMA_PAYLOAD_SIZE})",
            payload.len()
        )));
    }

    postcard::from_bytes(payload).map_err(|e| FactDbError::Serialization(e.to_string()))
}
