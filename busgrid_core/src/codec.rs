//! The Message Codec - grid-cell payloads to typed vehicle records.
//!
//! A payload is a UTF-8 JSON array of vehicle objects:
//!
//! ```text
//! [{"id":"42","latitude":45.42,"longitude":-75.69,"route_id":"95","speed":12.3}]
//! ```
//!
//! Decoding fails closed: one bad element rejects the whole payload.

use thiserror::Error;

use crate::record::VehicleRecord;

/// Maximum number of payload bytes quoted in diagnostics.
pub const EXCERPT_LEN: usize = 96;

/// Errors raised while decoding a payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, wrong shape, or a required field missing/mistyped
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Field present but outside its valid range
    #[error("Record {index}: {field} out of range ({value})")]
    OutOfRange {
        index: usize,
        field: &'static str,
        value: f64,
    },
}

/// Errors raised while encoding records for publication.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record {index}: {field} out of range ({value})")]
    OutOfRange {
        index: usize,
        field: &'static str,
        value: f64,
    },
}

/// Decodes a raw payload into the ordered list of records it carries.
pub fn decode(payload: &[u8]) -> Result<Vec<VehicleRecord>, DecodeError> {
    let records: Vec<VehicleRecord> = serde_json::from_slice(payload)?;

    for (index, record) in records.iter().enumerate() {
        if let Some((field, value)) = record.range_violation() {
            return Err(DecodeError::OutOfRange { index, field, value });
        }
    }

    Ok(records)
}

/// Encodes records into the payload format accepted by [`decode`].
///
/// Refuses records a subscriber would reject, so a publisher cannot emit a
/// payload that is dropped on arrival.
pub fn encode(records: &[VehicleRecord]) -> Result<Vec<u8>, EncodeError> {
    for (index, record) in records.iter().enumerate() {
        if let Some((field, value)) = record.range_violation() {
            return Err(EncodeError::OutOfRange { index, field, value });
        }
    }

    Ok(serde_json::to_vec(records)?)
}

/// Returns a printable prefix of a payload for log lines.
pub fn payload_excerpt(payload: &[u8]) -> String {
    let end = payload.len().min(EXCERPT_LEN);
    let mut excerpt = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > EXCERPT_LEN {
        excerpt.push('…');
    }
    excerpt
}
