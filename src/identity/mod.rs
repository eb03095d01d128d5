//! Voter identity: turns a raw personal identifier into a pseudonymous
//! voter key, or accepts a caller-supplied opaque key as-is.
//!
//! Raw identifiers are normalized to nine digits, checked against the
//! positional checksum, then hashed together with the server pepper. The
//! raw value never leaves this module.

use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Width every identifier is left-padded to.
pub const ID_WIDTH: usize = 9;
const MIN_DIGITS: usize = 5;
const MAX_OPAQUE_KEY_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identifier must contain between 5 and 9 digits, found {0}")]
    InvalidFormat(usize),
    #[error("identifier checksum does not match")]
    InvalidChecksum,
    #[error("voter key must be between 1 and 256 characters")]
    InvalidVoterKey,
}

/// A nine-digit identifier that passed normalization.
#[derive(Clone, PartialEq, Eq)]
pub struct NormalizedId(String);

impl NormalizedId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep identifiers out of logs even when a caller debug-prints one.
impl fmt::Debug for NormalizedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NormalizedId(<redacted>)")
    }
}

/// Server-held secret mixed into every derived key.
#[derive(Clone)]
pub struct Pepper(String);

impl Pepper {
    /// Returns `None` for an empty pepper; there is no fallback value.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.is_empty() { None } else { Some(Self(secret)) }
    }
}

impl fmt::Debug for Pepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pepper(<redacted>)")
    }
}

/// Opaque token identifying a voter within a poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VoterKey(String);

impl VoterKey {
    /// Accept a caller-generated token verbatim. Blank or oversized keys are
    /// rejected; nothing is trimmed, so `" abc"` and `"abc"` are distinct voters.
    pub fn opaque(raw: &str) -> Result<Self, IdentityError> {
        if raw.trim().is_empty() || raw.chars().count() > MAX_OPAQUE_KEY_LEN {
            return Err(IdentityError::InvalidVoterKey);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix suitable for debug logging.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

/// How a vote request identifies its voter.
#[derive(Clone, PartialEq, Eq)]
pub enum VoterCredential {
    /// Raw personal identifier; derived into a key server-side.
    IdNumber(String),
    /// Client-supplied opaque key, used verbatim.
    VoterKey(String),
}

impl fmt::Debug for VoterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoterCredential::IdNumber(_) => f.write_str("IdNumber(<redacted>)"),
            VoterCredential::VoterKey(key) => f.debug_tuple("VoterKey").field(key).finish(),
        }
    }
}

impl VoterCredential {
    pub fn resolve(&self, pepper: &Pepper) -> Result<VoterKey, IdentityError> {
        match self {
            VoterCredential::IdNumber(raw) => {
                let id = normalize(raw)?;
                if !validate(&id) {
                    return Err(IdentityError::InvalidChecksum);
                }
                Ok(derive_key(&id, pepper))
            }
            VoterCredential::VoterKey(raw) => VoterKey::opaque(raw),
        }
    }
}

/// Strip everything but ASCII digits and left-pad to nine.
pub fn normalize(raw: &str) -> Result<NormalizedId, IdentityError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if !(MIN_DIGITS..=ID_WIDTH).contains(&digits.len()) {
        return Err(IdentityError::InvalidFormat(digits.len()));
    }
    Ok(NormalizedId(format!("{:0>width$}", digits, width = ID_WIDTH)))
}

/// Positional checksum: weights alternate 1, 2; a product above 9 folds by
/// subtracting 9. A digit times a weight is at most 18, so the fold always
/// lands on a single digit.
pub fn validate(id: &NormalizedId) -> bool {
    let mut sum = 0u32;
    for (i, ch) in id.as_str().chars().enumerate() {
        let Some(digit) = ch.to_digit(10) else {
            return false;
        };
        let mut value = digit * ((i as u32 % 2) + 1);
        if value > 9 {
            value -= 9;
        }
        sum += value;
    }
    sum % 10 == 0
}

/// SHA-256 over the normalized identifier followed by the pepper, hex encoded.
pub fn derive_key(id: &NormalizedId, pepper: &Pepper) -> VoterKey {
    let mut hasher = Sha256::new();
    hasher.update(id.as_str().as_bytes());
    hasher.update(pepper.0.as_bytes());
    VoterKey(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pepper() -> Pepper {
        Pepper::new("test-pepper").unwrap()
    }

    #[test]
    fn normalize_strips_separators_and_pads() {
        assert_eq!(normalize("12-345").unwrap().as_str(), "000012345");
        assert_eq!(normalize(" 123 456 782 ").unwrap().as_str(), "123456782");
        assert_eq!(normalize("0001234").unwrap().as_str(), "000001234");
    }

    #[test]
    fn normalize_rejects_wrong_digit_counts() {
        assert_eq!(normalize("1234").unwrap_err(), IdentityError::InvalidFormat(4));
        assert_eq!(normalize("1234567890").unwrap_err(), IdentityError::InvalidFormat(10));
        assert_eq!(normalize("abc").unwrap_err(), IdentityError::InvalidFormat(0));
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["12345", "1-2-3-4-5-6", "98765432", "123456782", "000000000"] {
            let once = normalize(raw).unwrap();
            let twice = normalize(once.as_str()).unwrap();
            assert_eq!(once, twice, "input {raw}");
        }
    }

    #[test]
    fn checksum_accepts_known_valid_ids() {
        assert!(validate(&normalize("000000000").unwrap()));
        assert!(validate(&normalize("123456782").unwrap()));
        // the 9 sits at a weight-2 position: 18 folds to 9, plus the trailing 1
        assert!(validate(&normalize("000000091").unwrap()));
    }

    #[test]
    fn checksum_rejects_known_invalid_ids() {
        assert!(!validate(&normalize("123456789").unwrap()));
        assert!(!validate(&normalize("000000001").unwrap()));
    }

    #[test]
    fn derived_keys_are_stable_and_peppered() {
        let id = normalize("123456782").unwrap();
        let a = derive_key(&id, &pepper());
        let b = derive_key(&normalize("12345678-2").unwrap(), &pepper());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.as_str().contains("123456782"));

        let other = derive_key(&id, &Pepper::new("rotated").unwrap());
        assert_ne!(a, other);
    }

    #[test]
    fn credential_resolution_reports_checksum_failures() {
        let bad = VoterCredential::IdNumber("123456789".to_string());
        assert_eq!(bad.resolve(&pepper()).unwrap_err(), IdentityError::InvalidChecksum);

        let short = VoterCredential::IdNumber("12".to_string());
        assert_eq!(short.resolve(&pepper()).unwrap_err(), IdentityError::InvalidFormat(2));
    }

    #[test]
    fn opaque_keys_bypass_derivation() {
        let key = VoterCredential::VoterKey("client-token-1".to_string())
            .resolve(&pepper())
            .unwrap();
        assert_eq!(key.as_str(), "client-token-1");
        assert_eq!(key.short(), "client-t");

        // used verbatim: surrounding whitespace is part of the key
        let padded = VoterKey::opaque(" client-token-1").unwrap();
        assert_eq!(padded.as_str(), " client-token-1");
        assert_ne!(padded, key);
        assert!(VoterKey::opaque(&"x".repeat(256)).is_ok());

        assert!(VoterKey::opaque("   ").is_err());
        assert!(VoterKey::opaque(&"x".repeat(257)).is_err());
    }

    #[test]
    fn empty_pepper_is_rejected() {
        assert!(Pepper::new("").is_none());
        assert_eq!(format!("{:?}", pepper()), "Pepper(<redacted>)");
    }
}
