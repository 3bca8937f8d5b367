//! Cryptographic primitives: hashing, hash chains, and the password-sealed
//! envelope used by the encrypted file store.
//!
//! Everything here is deterministic given its inputs (except salt/nonce
//! generation), so hash chains recompute identically on any platform.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::Hmac;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// PBKDF2-HMAC-SHA256 iteration count for password key derivation.
const PBKDF2_ITERATIONS: u32 = 600_000;
/// Salt length in bytes.
const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// The hash value that anchors a fresh audit chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors from the primitive layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The ciphertext envelope does not split into `salt:nonce:tag:ciphertext`.
    #[error("invalid ciphertext format: {reason}")]
    InvalidFormat {
        /// Which part of the envelope is malformed.
        reason: String,
    },

    /// The GCM tag did not verify: wrong password or tampered data.
    #[error("ciphertext integrity check failed")]
    IntegrityFailure,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivation,

    /// Serializing a value for hashing failed.
    #[error("canonical serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// SHA-256 of raw bytes.
#[must_use]
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// SHA-256 of raw bytes as lowercase hex.
#[must_use]
pub fn hash_hex(bytes: &[u8]) -> String {
    hex::encode(hash(bytes))
}

/// `sha256(prev_hash || data)` as lowercase hex.
///
/// `prev_hash` participates as its ASCII hex representation, so chains stored
/// as text recompute byte-for-byte.
#[must_use]
pub fn chained_hash(data: &[u8], prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A fresh opaque identifier (UUID v4).
#[must_use]
pub fn random_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Serialize to canonical JSON bytes: stable key ordering, no whitespace.
///
/// Hashes are computed over these bytes. Do not "pretty print".
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&sort_json_value(v))?)
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

/// Constant-time byte comparison for token checks.
#[must_use]
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (lhs, rhs) in left.iter().zip(right) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

/// Encrypt `plaintext` under a password-derived key.
///
/// Returns the colon-joined base64 tuple `salt:nonce:tag:ciphertext`. Every
/// call uses a fresh salt and nonce.
pub fn encrypt_with_password(plaintext: &[u8], password: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut nonce);

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivation)?;

    // aes-gcm appends the 16-byte tag to the ciphertext; the envelope stores
    // the tag as its own tuple element.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::IntegrityFailure)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}:{}:{}:{}",
        BASE64.encode(salt),
        BASE64.encode(nonce),
        BASE64.encode(tag),
        BASE64.encode(ciphertext),
    ))
}

/// Decrypt a `salt:nonce:tag:ciphertext` envelope with the given password.
///
/// Fails with [`CryptoError::InvalidFormat`] when the tuple is malformed and
/// [`CryptoError::IntegrityFailure`] when the tag does not verify.
pub fn decrypt_with_password(envelope: &str, password: &str) -> Result<Vec<u8>, CryptoError> {
    let parts: Vec<&str> = envelope.split(':').collect();
    if parts.len() != 4 {
        return Err(CryptoError::InvalidFormat {
            reason: format!("expected 4 segments, got {}", parts.len()),
        });
    }

    let decode = |label: &str, part: &str| {
        BASE64.decode(part).map_err(|_| CryptoError::InvalidFormat {
            reason: format!("{label} is not valid base64"),
        })
    };
    let salt = decode("salt", parts[0])?;
    let nonce = decode("nonce", parts[1])?;
    let tag = decode("tag", parts[2])?;
    let ciphertext = decode("ciphertext", parts[3])?;

    if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFormat {
            reason: "segment length mismatch".to_owned(),
        });
    }

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivation)?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| CryptoError::IntegrityFailure)
}
