//! Conversion of typed records into provider-agnostic JSON maps.
//!
//! Identity providers and the policy engine both speak in loosely shaped JSON
//! documents. Callers hand over their own typed structs and get back a plain
//! `Map<String, Value>`, so nothing downstream depends on a provider's native
//! record schema.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepresentationError {
    #[error("serializing record")]
    Marshal(#[source] serde_json::Error),

    #[error("deserializing record into a generic JSON object")]
    Unmarshal(#[source] serde_json::Error),
}

/// Serialize `record` to bytes and read the bytes back as a generic JSON
/// object. Records that do not serialize to an object are rejected.
pub fn to_generic_map<T>(record: &T) -> Result<Map<String, Value>, RepresentationError>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(record).map_err(RepresentationError::Marshal)?;
    tracing::trace!(document = %String::from_utf8_lossy(&bytes), "intermediate representation");
    serde_json::from_slice(&bytes).map_err(RepresentationError::Unmarshal)
}
