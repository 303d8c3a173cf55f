//! ALFA Identity Vault - Template Protection
//!
//! Turns a raw face embedding into helper data: the template itself (for
//! distance matching), a fresh salt, a decorrelation nonce and the secret K
//! derived from template + salt. The published identity commitment is
//! SHA-256(K); no other input is ever hashed into a commitment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codec::{self, base64_bytes};
use crate::crypto::{derive_secret, generate_salt, random_bytes, HELPER_RANDOM_LEN, SECRET_LEN};
use crate::error::{IdentityError, IdentityResult};

/// Dimension of face-recognition descriptors
pub const EMBEDDING_DIM: usize = 128;

// ═══════════════════════════════════════════════════════════════════════════
// EMBEDDING
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed-length biometric feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding; values must be finite and non-empty
    pub fn new(values: Vec<f32>) -> IdentityResult<Self> {
        if values.is_empty() {
            return Err(IdentityError::InvalidEmbedding("empty vector".into()));
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(IdentityError::InvalidEmbedding(format!(
                "non-finite value at index {}",
                pos
            )));
        }
        Ok(Self { values })
    }

    /// Rebuild an embedding from its little-endian byte form
    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        Self::new(codec::bytes_to_vector(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        codec::vector_to_bytes(&self.values)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reject embeddings whose dimension differs from `expected`
    pub fn ensure_dim(&self, expected: usize) -> IdentityResult<()> {
        if self.len() != expected {
            return Err(IdentityError::DimensionMismatch {
                left: self.len(),
                right: expected,
            });
        }
        Ok(())
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = IdentityError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IDENTITY COMMITMENT
// ═══════════════════════════════════════════════════════════════════════════

/// SHA-256 commitment, rendered as `0x` + 64 lowercase hex digits
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityCommitment([u8; 32]);

impl IdentityCommitment {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Hash secret bytes into an identity commitment
pub fn compute_identity_commitment(secret_bytes: &[u8]) -> IdentityCommitment {
    IdentityCommitment(Sha256::digest(secret_bytes).into())
}

impl fmt::Display for IdentityCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", codec::bytes_to_hex(&self.0))
    }
}

impl fmt::Debug for IdentityCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityCommitment({})", self)
    }
}

impl FromStr for IdentityCommitment {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !(s.starts_with("0x") || s.starts_with("0X")) {
            return Err(IdentityError::InvalidEncoding(
                "commitment must start with 0x".into(),
            ));
        }
        let bytes = codec::hex_to_bytes(s)?;
        let array: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            IdentityError::InvalidEncoding(format!("commitment has {} bytes, expected 32", b.len()))
        })?;
        Ok(IdentityCommitment(array))
    }
}

impl TryFrom<String> for IdentityCommitment {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IdentityCommitment> for String {
    fn from(c: IdentityCommitment) -> Self {
        c.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER DATA
// ═══════════════════════════════════════════════════════════════════════════

/// Enrollment helper data. Only ever leaves the device encrypted.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Helper {
    /// Embedding bytes (little-endian f32)
    #[serde(with = "base64_bytes")]
    pub template: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    /// Decorrelation / versioning nonce, not used for matching
    #[serde(with = "base64_bytes")]
    pub helper_random: Vec<u8>,
    /// K = HKDF(template, salt)
    #[serde(rename = "K", with = "base64_bytes")]
    pub derived_secret: Vec<u8>,
}

impl Helper {
    /// Decode the stored template back into an embedding
    pub fn embedding(&self) -> IdentityResult<Embedding> {
        Embedding::from_bytes(&self.template)
    }

    /// Commitment over this helper's derived secret
    pub fn commitment(&self) -> IdentityCommitment {
        compute_identity_commitment(&self.derived_secret)
    }

    /// Serialize as the encrypted payload body `{"helper": {...}}`
    pub fn to_payload(&self) -> IdentityResult<Zeroizing<Vec<u8>>> {
        let payload = HelperPayloadRef { helper: self };
        Ok(Zeroizing::new(serde_json::to_vec(&payload)?))
    }

    /// Parse a decrypted payload body
    pub fn from_payload(bytes: &[u8]) -> IdentityResult<Self> {
        let payload: HelperPayload = serde_json::from_slice(bytes)?;
        Ok(payload.helper)
    }
}

impl fmt::Debug for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Helper")
            .field("template_len", &self.template.len())
            .field("salt_len", &self.salt.len())
            .field("commitment", &self.commitment())
            .finish()
    }
}

#[derive(Serialize)]
struct HelperPayloadRef<'a> {
    helper: &'a Helper,
}

#[derive(Deserialize)]
struct HelperPayload {
    helper: Helper,
}

/// Build helper data from an embedding, consuming fresh randomness
pub fn create_helper(embedding: &Embedding) -> IdentityResult<Helper> {
    let template = embedding.to_bytes();
    let salt = generate_salt();
    let derived = derive_secret(&template, &salt, SECRET_LEN * 8)?;
    let helper_random = random_bytes::<HELPER_RANDOM_LEN>();

    Ok(Helper {
        template,
        salt: salt.to_vec(),
        helper_random: helper_random.to_vec(),
        derived_secret: derived.expose().to_vec(),
    })
}
