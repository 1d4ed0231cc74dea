//! Session value serializers
//!
//! The binary format is the default for stored session blobs. Claims contain
//! arbitrary JSON user attributes, so each value is kept as JSON text inside
//! a bincode envelope.

use std::collections::BTreeMap;

use super::{SessionValues, StoreError};

/// Encodes and decodes a session's value map
pub trait SessionSerializer: Send + Sync {
    fn name(&self) -> &'static str;
    fn serialize(&self, values: &SessionValues) -> Result<Vec<u8>, StoreError>;
    fn deserialize(&self, data: &[u8]) -> Result<SessionValues, StoreError>;
}

/// Compact binary encoding (default)
#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

impl SessionSerializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn serialize(&self, values: &SessionValues) -> Result<Vec<u8>, StoreError> {
        let envelope: BTreeMap<&str, String> = values
            .iter()
            .map(|(key, value)| (key.as_str(), value.to_string()))
            .collect();
        bincode::serialize(&envelope).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<SessionValues, StoreError> {
        let envelope: BTreeMap<String, String> =
            bincode::deserialize(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        envelope
            .into_iter()
            .map(|(key, text)| Ok((key, serde_json::from_str(&text)?)))
            .collect()
    }
}

/// Plain JSON encoding, handy for inspecting rows by hand
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl SessionSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, values: &SessionValues) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(values)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<SessionValues, StoreError> {
        Ok(serde_json::from_slice(data)?)
    }
}
