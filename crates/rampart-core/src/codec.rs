//! JSON body encoding and decoding.
//!
//! Used only at the edges: when a descriptor's body is built and when a
//! final response is interpreted. Decode failures are validation errors and
//! are never retried.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use validator::Validate;

/// Content type written for JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encode `value` as JSON
///
/// # Errors
/// Returns a validation error if serialization fails
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| Error::validation(format!("failed to encode request body: {e}")))
}

/// Decode a JSON document into `T`
///
/// # Errors
/// Returns a validation error if the bytes are not a valid `T`
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::validation(format!("failed to decode response body: {e}")))
}

/// Decode a JSON document and run `T`'s field validation
///
/// # Errors
/// Returns a validation error if decoding or validation fails
pub fn decode_validated<T: DeserializeOwned + Validate>(bytes: &[u8]) -> Result<T> {
    let value: T = decode_json(bytes)?;
    value
        .validate()
        .map_err(|e| Error::validation(format!("response failed validation: {e}")))?;
    Ok(value)
}

/// Interpret bytes as UTF-8
///
/// # Errors
/// Returns a validation error for invalid UTF-8
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::validation(format!("response body is not UTF-8: {e}")))
}
