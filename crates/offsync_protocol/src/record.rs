//! Rows of logical tables.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wall-clock write time of a row, in milliseconds since the Unix epoch.
///
/// Remote rows carry the time of their last write; locally written rows carry
/// the time the mutation was queued. Last-write-wins compares these.
pub type Version = u64;

/// Field map of a row.
pub type Payload = serde_json::Map<String, Value>;

/// Identifies one row across all tables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Logical table name.
    pub table: String,
    /// Row id within the table.
    pub id: String,
}

impl RecordKey {
    /// Creates a new record key.
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// A row of a logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Logical table name.
    pub table: String,
    /// Row id within the table.
    pub id: String,
    /// Row fields, including `id`.
    pub payload: Payload,
    /// Last-known write time of the row.
    pub version: Version,
}

impl Record {
    /// Creates a record from its parts.
    pub fn new(
        table: impl Into<String>,
        id: impl Into<String>,
        payload: Payload,
        version: Version,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            payload,
            version,
        }
    }

    /// Builds a record from any serializable row.
    ///
    /// The row must serialize to a JSON object with an `id` field holding a
    /// string or an integer.
    pub fn from_row<T: Serialize + ?Sized>(
        table: impl Into<String>,
        row: &T,
        version: Version,
    ) -> CodecResult<Self> {
        let value = serde_json::to_value(row).map_err(|e| CodecError::Encode(e.to_string()))?;
        let Value::Object(payload) = value else {
            return Err(CodecError::invalid_record("row must be an object"));
        };
        let id = extract_id(&payload)?;
        Ok(Self::new(table, id, payload, version))
    }

    /// Deserializes the payload into a typed row.
    pub fn to_row<T: DeserializeOwned>(&self) -> CodecResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Returns this row's key.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }

    /// Returns a field of the payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

fn extract_id(payload: &Payload) -> CodecResult<String> {
    match payload.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(_) => Err(CodecError::invalid_record(
            "`id` must be a non-empty string or an integer",
        )),
        None => Err(CodecError::invalid_record("row has no `id` field")),
    }
}

/// Row selection for remote fetches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Filter {
    /// Every row of the table.
    #[default]
    All,
    /// Rows whose id is in the list.
    Ids(Vec<String>),
    /// Rows whose field equals the value.
    FieldEquals {
        /// Field name.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Rows written after the given version.
    UpdatedSince(Version),
}

impl Filter {
    /// Returns true if the record is selected by this filter.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Ids(ids) => ids.iter().any(|id| *id == record.id),
            Filter::FieldEquals { field, value } => record.payload.get(field) == Some(value),
            Filter::UpdatedSince(version) => record.version > *version,
        }
    }
}
