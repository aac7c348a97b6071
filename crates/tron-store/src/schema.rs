//! Self-describing envelope wrapped around every persisted artifact.
//!
//! ```json
//! { "schema": "tron.session", "version": 1, "data": { ... } }
//! ```
//!
//! A reader rejects envelopes naming another schema or a newer version
//! instead of guessing at their layout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A type that can be persisted through the atomic store.
pub trait Record: Serialize + DeserializeOwned {
    const SCHEMA: &'static str;
    const VERSION: u32;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: &'a str,
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    schema: String,
    version: u32,
    data: serde_json::Value,
}

/// Why bytes on disk could not be turned into a record.
#[derive(Debug)]
pub enum DecodeError {
    /// Not an envelope, or the payload does not match the declared schema.
    Corrupt(String),
    /// A well-formed envelope this build must not interpret.
    Incompatible { found: String, expected: String },
}

impl DecodeError {
    pub fn into_store_error(self, path: &std::path::Path) -> StoreError {
        match self {
            DecodeError::Corrupt(reason) => {
                StoreError::Serialization(format!("{}: {reason}", path.display()))
            }
            DecodeError::Incompatible { found, expected } => StoreError::IncompatibleSchema {
                path: path.display().to_string(),
                found,
                expected,
            },
        }
    }
}

pub fn encode<T: Record>(record: &T) -> Result<Vec<u8>, StoreError> {
    let envelope = EnvelopeRef {
        schema: T::SCHEMA,
        version: T::VERSION,
        data: record,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

pub fn decode<T: Record>(bytes: &[u8]) -> Result<T, DecodeError> {
    let raw: RawEnvelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    if raw.schema != T::SCHEMA || raw.version > T::VERSION {
        return Err(DecodeError::Incompatible {
            found: format!("{} v{}", raw.schema, raw.version),
            expected: format!("{} v{}", T::SCHEMA, T::VERSION),
        });
    }
    serde_json::from_value(raw.data).map_err(|e| DecodeError::Corrupt(e.to_string()))
}
