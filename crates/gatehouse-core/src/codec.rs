//! CBOR encoding for packets and their side-channel values.
//!
//! Each packet travels as one CBOR document per binary transport message;
//! structured spec values (client exec args, agent connection params) are
//! CBOR documents nested as byte strings inside the spec map.

use crate::error::GateResult;
use std::io::Cursor;

/// Encode a serializable value into a CBOR document.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> GateResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)?;
    Ok(out)
}

/// Decode a CBOR document into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> GateResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}
