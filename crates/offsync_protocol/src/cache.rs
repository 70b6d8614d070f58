//! Local cache entries.

use crate::codec::{decode, encode};
use crate::error::CodecResult;
use crate::record::{Payload, Record, Version};
use serde::{Deserialize, Serialize};

/// Last-known state of one row, as held by the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical table name.
    pub table: String,
    /// Row id.
    pub id: String,
    /// Row fields.
    pub payload: Payload,
    /// Write time of the state held here.
    pub version: Version,
    /// Local time the entry was stored (ms since epoch).
    pub fetched_at: u64,
}

impl CacheEntry {
    /// Creates a cache entry from a record.
    pub fn from_record(record: &Record, fetched_at: u64) -> Self {
        Self {
            table: record.table.clone(),
            id: record.id.clone(),
            payload: record.payload.clone(),
            version: record.version,
            fetched_at,
        }
    }

    /// Converts back into a record.
    pub fn to_record(&self) -> Record {
        Record::new(
            self.table.clone(),
            self.id.clone(),
            self.payload.clone(),
            self.version,
        )
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        decode(bytes)
    }
}
