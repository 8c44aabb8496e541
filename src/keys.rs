//! Blob key codec.
//!
//! Keys carry only the first half of a sha512 sum so on-disk paths stay
//! short; the truncated form is part of the on-disk contract.

use anyhow::Result;
use sha2::{Digest, Sha512};

use crate::error::StoreError;

/// Algorithm prefix carried by every key.
pub const KEY_PREFIX: &str = "sha512-";
/// Raw sha512 digest size in bytes.
pub const DIGEST_LEN: usize = 64;
/// Hex characters kept from the digest (half of the full 128).
pub const KEY_HEX_LEN: usize = DIGEST_LEN;
/// Length of a full key: prefix plus truncated hex digest.
pub const KEY_LEN: usize = KEY_PREFIX.len() + KEY_HEX_LEN;
/// Shortest accepted partial key, at least `sha512-aa`.
pub const MIN_KEY_LEN: usize = KEY_PREFIX.len() + 2;

/// A syntactically valid key, normalized to at most the full length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum KeyForm {
    Full(String),
    Partial(String),
}

/// Derive the full key for a raw sha512 digest.
///
/// # Errors
///
/// Fails with [`StoreError::InvalidKey`] unless the digest is exactly
/// [`DIGEST_LEN`] bytes.
pub fn digest_to_key(digest: &[u8]) -> Result<String> {
    if digest.len() != DIGEST_LEN {
        return Err(StoreError::InvalidKey(format!(
            "digest must be {DIGEST_LEN} bytes, got {}",
            digest.len()
        ))
        .into());
    }
    let mut key = format!("{KEY_PREFIX}{}", hex::encode(digest));
    key.truncate(KEY_LEN);
    Ok(key)
}

/// Finalize a sha512 hasher into the key its bytes should be stored under.
#[must_use]
pub fn hash_to_key(hasher: Sha512) -> String {
    let digest = hasher.finalize();
    format!("{KEY_PREFIX}{}", hex::encode(&digest[..DIGEST_LEN / 2]))
}

/// Classify a key string as full or partial, truncating over-long input.
///
/// External tools sometimes hand over the whole 128-character hex digest;
/// anything beyond the full key length is dropped before classification.
pub(crate) fn classify(key: &str) -> Result<KeyForm> {
    let Some(hex_part) = key.strip_prefix(KEY_PREFIX) else {
        return Err(StoreError::InvalidKey(format!("wrong key prefix in {key:?}")).into());
    };
    if key.len() < MIN_KEY_LEN {
        return Err(StoreError::InvalidKey(format!("key too short: {key:?}")).into());
    }
    // Validate on bytes before slicing the str: every kept byte being ascii
    // hex also makes the truncation point a char boundary.
    let keep = hex_part.len().min(KEY_HEX_LEN);
    if !hex_part.as_bytes()[..keep]
        .iter()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
    {
        return Err(StoreError::InvalidKey(format!(
            "key suffix is not lowercase hex: {key:?}"
        ))
        .into());
    }
    let normalized = format!("{KEY_PREFIX}{}", &hex_part[..keep]);
    if normalized.len() == KEY_LEN {
        Ok(KeyForm::Full(normalized))
    } else {
        Ok(KeyForm::Partial(normalized))
    }
}
