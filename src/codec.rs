//! ALFA Identity Vault - Codec
//!
//! Byte/text encodings and the float-vector <-> bytes reinterpretation used
//! for templates. Floats are always little-endian on the wire, whatever the host.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{IdentityError, IdentityResult};

/// Width of one embedding element in bytes
pub const F32_WIDTH: usize = std::mem::size_of::<f32>();

/// Encode bytes as standard (padded) base64
pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64
pub fn base64_to_bytes(text: &str) -> IdentityResult<Vec<u8>> {
    Ok(STANDARD.decode(text)?)
}

/// Lowercase hex, two digits per byte, no separators
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse hex, accepting an optional `0x` prefix
pub fn hex_to_bytes(text: &str) -> IdentityResult<Vec<u8>> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    Ok(hex::decode(digits)?)
}

/// Reinterpret a float vector as its little-endian byte representation
pub fn vector_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * F32_WIDTH);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Reinterpret little-endian bytes as a float vector
pub fn bytes_to_vector(bytes: &[u8]) -> IdentityResult<Vec<f32>> {
    if bytes.len() % F32_WIDTH != 0 {
        return Err(IdentityError::Length {
            len: bytes.len(),
            width: F32_WIDTH,
        });
    }

    Ok(bytes
        .chunks_exact(F32_WIDTH)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Serde adapter persisting `Vec<u8>` fields as base64 strings
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::bytes_to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::base64_to_bytes(&text).map_err(serde::de::Error::custom)
    }
}
