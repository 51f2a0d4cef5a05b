//! Record envelope and the type-version normalization shim
//!
//! Blobs are stored as `{"typeVersion": N, "data": {...}}`. Polymorphic
//! values inside `data` carry a `"$type": "Name@N"` tag. When a blob written
//! by an older build fails to deserialize, every tag is rewritten to the
//! current version and deserialization is retried once.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stride_common::{Error, Result};
use tracing::{info, warn};

/// Type version written by this build
pub const RECORD_TYPE_VERSION: u32 = 2;

/// Blobs without an envelope predate versioning
const UNVERSIONED: u32 = 1;

const TYPE_TAG: &str = "$type";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, T> {
    type_version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeOwned {
    type_version: u32,
    data: Value,
}

/// Result of decoding a blob
#[derive(Debug)]
pub struct Decoded<T> {
    /// The decoded record
    pub value: T,
    /// True if the blob had to be normalized from an older type version
    pub normalized: bool,
}

/// Serialize `value` inside a current-version envelope
pub fn encode<T: Serialize>(kind: &str, value: &T) -> Result<String> {
    serde_json::to_string(&EnvelopeRef {
        type_version: RECORD_TYPE_VERSION,
        data: value,
    })
    .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Deserialize a blob, normalizing older type versions if needed
pub fn decode<T: DeserializeOwned>(kind: &str, blob: &str) -> Result<Decoded<T>> {
    let raw: Value = serde_json::from_str(blob)
        .map_err(|e| Error::serialization_for_kind(kind, format!("malformed blob: {}", e)))?;

    let (version, data) = split_envelope(raw);

    let first_err = match serde_json::from_value::<T>(data.clone()) {
        Ok(value) => {
            return Ok(Decoded {
                value,
                normalized: version != RECORD_TYPE_VERSION,
            })
        }
        Err(e) => e,
    };

    if version == RECORD_TYPE_VERSION {
        return Err(Error::serialization_for_kind(kind, first_err.to_string()));
    }

    let mut migrated = data;
    let rewritten = normalize_type_tags(&mut migrated);
    match serde_json::from_value::<T>(migrated) {
        Ok(value) => {
            info!(
                kind,
                from_version = version,
                to_version = RECORD_TYPE_VERSION,
                rewritten_tags = rewritten,
                "normalized record from older type version"
            );
            Ok(Decoded {
                value,
                normalized: true,
            })
        }
        Err(e) => {
            warn!(
                kind,
                from_version = version,
                error = %e,
                "normalization did not produce a readable record"
            );
            Err(Error::serialization_for_kind(kind, first_err.to_string()))
        }
    }
}

fn split_envelope(raw: Value) -> (u32, Value) {
    let is_envelope = raw
        .as_object()
        .map(|o| o.contains_key("typeVersion") && o.contains_key("data"))
        .unwrap_or(false);
    if !is_envelope {
        return (UNVERSIONED, raw);
    }
    match serde_json::from_value::<EnvelopeOwned>(raw.clone()) {
        Ok(env) => (env.type_version, env.data),
        Err(_) => (UNVERSIONED, raw),
    }
}

/// Rewrite every `"$type": "Name@N"` tag to the current version.
///
/// Returns the number of tags changed.
pub fn normalize_type_tags(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let mut changed = 0;
            if let Some(Value::String(tag)) = map.get_mut(TYPE_TAG) {
                let name = tag.split('@').next().unwrap_or_default().to_string();
                let current = format!("{}@{}", name, RECORD_TYPE_VERSION);
                if *tag != current {
                    *tag = current;
                    changed += 1;
                }
            }
            for (key, child) in map.iter_mut() {
                if key != TYPE_TAG {
                    changed += normalize_type_tags(child);
                }
            }
            changed
        }
        Value::Array(items) => items.iter_mut().map(normalize_type_tags).sum(),
        _ => 0,
    }
}
