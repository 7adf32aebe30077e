//! Package integrity checks
//!
//! Packages may carry a checksum of their code unit (`blake3:<hex>` or
//! `sha256:<hex>`) and an Ed25519 signature over it by their developer
//! (`ed25519:<hex>`), verified against the key recorded for that developer.

use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Integrity check failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("signature does not verify")]
    BadSignature,
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blake3" => Some(Self::Blake3),
            "sha256" | "sha-256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
        }
    }
}

/// Hex digest of `data`
pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
    }
}

/// Prefixed checksum of `data`, e.g. `blake3:af13...`
pub fn checksum(algorithm: HashAlgorithm, data: &[u8]) -> String {
    format!("{}:{}", algorithm.prefix(), digest_hex(algorithm, data))
}

/// Parse a checksum string in format "blake3:hex" or "sha256:hex"
fn parse_checksum(value: &str) -> Result<(HashAlgorithm, String), IntegrityError> {
    let (prefix, hex) = value.split_once(':').ok_or_else(|| {
        IntegrityError::InvalidFormat(
            "expected 'blake3:hex' or 'sha256:hex'".to_string(),
        )
    })?;
    let algorithm = HashAlgorithm::parse(prefix).ok_or_else(|| {
        IntegrityError::InvalidFormat(format!("unsupported hash algorithm '{}'", prefix))
    })?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IntegrityError::InvalidFormat("checksum is not hex".to_string()));
    }
    Ok((algorithm, hex.to_ascii_lowercase()))
}

/// Verify `data` against a prefixed checksum
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<(), IntegrityError> {
    let (algorithm, expected_hex) = parse_checksum(expected)?;
    let computed = digest_hex(algorithm, data);
    if computed != expected_hex {
        return Err(IntegrityError::ChecksumMismatch {
            expected: expected_hex,
            computed,
        });
    }
    Ok(())
}

fn decode_prefixed(value: &str, expected_len: usize, what: &str) -> Result<Vec<u8>, IntegrityError> {
    let hex = value.strip_prefix("ed25519:").unwrap_or(value);
    let bytes = hex::decode(hex)
        .map_err(|e| IntegrityError::InvalidFormat(format!("{} is not hex: {}", what, e)))?;
    if bytes.len() != expected_len {
        return Err(IntegrityError::InvalidFormat(format!(
            "{} must be {} bytes, got {}",
            what,
            expected_len,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Parse a public key in format "ed25519:hex"
pub fn parse_public_key(value: &str) -> Result<VerifyingKey, IntegrityError> {
    let bytes = decode_prefixed(value, PUBLIC_KEY_LENGTH, "public key")?;
    let array: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| IntegrityError::InvalidFormat("public key length".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| IntegrityError::InvalidFormat(format!("public key: {}", e)))
}

/// Parse a signature in format "ed25519:hex"
pub fn parse_signature(value: &str) -> Result<Signature, IntegrityError> {
    let bytes = decode_prefixed(value, SIGNATURE_LENGTH, "signature")?;
    let array: [u8; SIGNATURE_LENGTH] = bytes
        .try_into()
        .map_err(|_| IntegrityError::InvalidFormat("signature length".to_string()))?;
    Ok(Signature::from_bytes(&array))
}

/// Verify a developer signature over `data`
pub fn verify_signature(public_key: &str, data: &[u8], signature: &str) -> Result<(), IntegrityError> {
    let key = parse_public_key(public_key)?;
    let signature = parse_signature(signature)?;
    key.verify(data, &signature).map_err(|e| {
        tracing::debug!("Signature verification failed: {}", e);
        IntegrityError::BadSignature
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_checksum_roundtrip_both_algorithms() {
        let code = b"x = 1";
        for algorithm in [HashAlgorithm::Blake3, HashAlgorithm::Sha256] {
            let sum = checksum(algorithm, code);
            assert!(verify_checksum(code, &sum).is_ok());
            assert!(matches!(
                verify_checksum(b"x = 2", &sum),
                Err(IntegrityError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_known_sha256() {
        assert_eq!(
            digest_hex(HashAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_bad_checksum_format() {
        assert!(matches!(verify_checksum(b"x", "md5:abcd"), Err(IntegrityError::InvalidFormat(_))));
        assert!(matches!(verify_checksum(b"x", "abcd"), Err(IntegrityError::InvalidFormat(_))));
        assert!(matches!(verify_checksum(b"x", "blake3:zz"), Err(IntegrityError::InvalidFormat(_))));
    }

    #[test]
    fn test_signature_verification() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public = format!("ed25519:{}", hex::encode(signing.verifying_key().to_bytes()));
        let signature = format!("ed25519:{}", hex::encode(signing.sign(b"code").to_bytes()));

        assert!(verify_signature(&public, b"code", &signature).is_ok());
        assert_eq!(
            verify_signature(&public, b"other", &signature),
            Err(IntegrityError::BadSignature)
        );
        assert!(matches!(
            verify_signature(&public, b"code", "ed25519:00"),
            Err(IntegrityError::InvalidFormat(_))
        ));
    }
}
