//! Cipher primitives for config secrets.
//!
//! Secrets are sealed with AES-256-GCM under a key derived from an
//! operator-supplied passphrase. Each sealed secret is stored as two base64
//! strings: the ciphertext (with the GCM tag appended) and the 96-bit IV.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit IV via `OsRng`.
//! - The passphrase is turned into a 256-bit key with HKDF-SHA256 by default.
//!   [`KeyDerivation::PaddedLegacy`] keeps the weak pad-and-truncate scheme
//!   available on request. Its key space shrinks with short passphrases.
//! - Candidate passphrases are checked against a persisted SHA-256 digest,
//!   compared in constant time.
//! - [`SecretKey`] derives `Zeroize` + `ZeroizeOnDrop`.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// IV length for AES-256-GCM (96 bits).
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Key length for AES-256.
const KEY_LEN: usize = 32;

/// HKDF `info` for the config secret key.
const HKDF_INFO: &[u8] = b"watchtower-config-secret-v1";

/// Fill pattern used by [`KeyDerivation::PaddedLegacy`].
const LEGACY_PAD: [u8; 2] = [0x08, 0x98];

/// How a passphrase becomes an AES-256 key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyDerivation {
    /// HKDF-SHA256 over the passphrase bytes.
    #[default]
    Hkdf,
    /// Passphrase bytes over a repeating `08 98` fill, truncated to 32 bytes.
    ///
    /// Deterministic fill, so short passphrases give weak keys. Only use it
    /// where the padded scheme is required; prefer [`KeyDerivation::Hkdf`].
    PaddedLegacy,
}

impl FromStr for KeyDerivation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hkdf" => Ok(Self::Hkdf),
            "padded" | "padded-legacy" | "legacy" => Ok(Self::PaddedLegacy),
            other => Err(format!(
                "unknown key derivation '{other}', expected 'hkdf' or 'padded-legacy'"
            )),
        }
    }
}

/// A 256-bit secret key that is zeroized on drop.
///
/// The inner bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A sealed secret as it is stored in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEnvelope {
    /// Base64 of `ciphertext || tag`.
    pub ciphertext: String,
    /// Base64 of the 12-byte IV.
    pub iv: String,
}

/// Derive the AES-256 key for `passphrase`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(passphrase: &str, scheme: KeyDerivation) -> Result<SecretKey, CryptoError> {
    let mut bytes = [0u8; KEY_LEN];
    match scheme {
        KeyDerivation::Hkdf => {
            let hk = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
            hk.expand(HKDF_INFO, &mut bytes)
                .map_err(|e| CryptoError::KeyDerivation {
                    reason: e.to_string(),
                })?;
        }
        KeyDerivation::PaddedLegacy => {
            for (slot, pad) in bytes.iter_mut().zip(LEGACY_PAD.iter().cycle()) {
                *slot = *pad;
            }
            for (slot, byte) in bytes.iter_mut().zip(passphrase.bytes()) {
                *slot = byte;
            }
        }
    }
    Ok(SecretKey::from_bytes(bytes))
}

/// Base64 of the SHA-256 digest of `passphrase`.
///
/// This is what gets persisted to recognise the passphrase on later runs.
#[must_use]
pub fn key_digest(passphrase: &str) -> String {
    BASE64.encode(Sha256::digest(passphrase.as_bytes()))
}

/// Compare two digests in constant time.
#[must_use]
pub fn digests_match(stored: &str, candidate: &str) -> bool {
    stored.as_bytes().ct_eq(candidate.as_bytes()).into()
}

/// Generate a fresh random IV using the OS CSPRNG.
#[must_use]
pub fn generate_iv() -> [u8; IV_LEN] {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&nonce);
    iv
}

/// Seal `plaintext` under `key` with a fresh IV.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt_secret(key: &SecretKey, plaintext: &str) -> Result<SecretEnvelope, CryptoError> {
    let iv = generate_iv();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    Ok(SecretEnvelope {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(iv),
    })
}

/// Open a secret sealed by [`encrypt_secret`].
///
/// # Errors
///
/// Returns [`CryptoError::EnvelopeDecode`] if either field is not base64 or
/// the IV is not 12 bytes, [`CryptoError::CiphertextTooShort`] if the
/// ciphertext cannot hold a tag, and [`CryptoError::Decryption`] if
/// authentication fails or the plaintext is not UTF-8.
pub fn decrypt_secret(
    key: &SecretKey,
    ciphertext_b64: &str,
    iv_b64: &str,
) -> Result<String, CryptoError> {
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| CryptoError::EnvelopeDecode {
            reason: format!("IV: {e}"),
        })?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::EnvelopeDecode {
            reason: format!("IV must be {IV_LEN} bytes, got {}", iv.len()),
        });
    }
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| CryptoError::EnvelopeDecode {
            reason: format!("ciphertext: {e}"),
        })?;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: TAG_LEN,
            actual: ciphertext.len(),
        });
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption {
        reason: "plaintext is not valid UTF-8".to_owned(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(passphrase: &str) -> SecretKey {
        derive_key(passphrase, KeyDerivation::Hkdf).unwrap()
    }

    #[test]
    fn seal_and_open() {
        let key = key("correct horse");
        let envelope = encrypt_secret(&key, "db-password").unwrap();
        let plaintext = decrypt_secret(&key, &envelope.ciphertext, &envelope.iv).unwrap();
        assert_eq!(plaintext, "db-password");
    }

    #[test]
    fn empty_secret_is_allowed() {
        let key = key("k");
        let envelope = encrypt_secret(&key, "").unwrap();
        assert_eq!(decrypt_secret(&key, &envelope.ciphertext, &envelope.iv).unwrap(), "");
    }

    #[test]
    fn each_seal_uses_a_fresh_iv() {
        let key = key("k");
        let first = encrypt_secret(&key, "same").unwrap();
        let second = encrypt_secret(&key, "same").unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_eq!(BASE64.decode(&first.iv).unwrap().len(), IV_LEN);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let envelope = encrypt_secret(&key("alpha"), "secret").unwrap();
        let result = decrypt_secret(&key("beta"), &envelope.ciphertext, &envelope.iv);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key("k");
        let envelope = encrypt_secret(&key, "secret").unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        if let Some(byte) = raw.first_mut() {
            *byte ^= 0xFF;
        }
        let result = decrypt_secret(&key, &BASE64.encode(raw), &envelope.iv);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn bad_iv_is_a_decode_error() {
        let key = key("k");
        let envelope = encrypt_secret(&key, "secret").unwrap();

        let garbage = decrypt_secret(&key, &envelope.ciphertext, "!!not base64!!");
        assert!(matches!(garbage, Err(CryptoError::EnvelopeDecode { .. })));

        let short = decrypt_secret(&key, &envelope.ciphertext, &BASE64.encode([0u8; 4]));
        assert!(matches!(short, Err(CryptoError::EnvelopeDecode { .. })));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = key("k");
        let iv = BASE64.encode(generate_iv());
        let result = decrypt_secret(&key, &BASE64.encode([1u8; 5]), &iv);
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 16,
                actual: 5
            })
        ));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_key("passphrase", KeyDerivation::Hkdf).unwrap();
        let b = derive_key("passphrase", KeyDerivation::Hkdf).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let legacy = derive_key("passphrase", KeyDerivation::PaddedLegacy).unwrap();
        assert_ne!(a.as_bytes(), legacy.as_bytes());
    }

    #[test]
    fn legacy_padding_fills_with_pattern() {
        let key = derive_key("abc", KeyDerivation::PaddedLegacy).unwrap();
        let bytes = key.as_bytes();
        assert_eq!(&bytes[..3], b"abc");
        assert_eq!(bytes[3], 0x98);
        assert_eq!(bytes[4], 0x08);
        assert_eq!(bytes[31], 0x98);
    }

    #[test]
    fn legacy_padding_truncates_long_passphrases() {
        let long = "x".repeat(40);
        let key = derive_key(&long, KeyDerivation::PaddedLegacy).unwrap();
        assert!(key.as_bytes().iter().all(|b| *b == b'x'));
    }

    #[test]
    fn digest_matching() {
        let stored = key_digest("alpha");
        assert!(digests_match(&stored, &key_digest("alpha")));
        assert!(!digests_match(&stored, &key_digest("beta")));
        assert!(!digests_match(&stored, ""));
    }

    #[test]
    fn debug_redacts_key_bytes() {
        let rendered = format!("{:?}", key("k"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn derivation_parses_from_str() {
        assert_eq!("hkdf".parse::<KeyDerivation>().unwrap(), KeyDerivation::Hkdf);
        assert_eq!(
            "Padded-Legacy".parse::<KeyDerivation>().unwrap(),
            KeyDerivation::PaddedLegacy
        );
        assert!("rot13".parse::<KeyDerivation>().is_err());
    }
}
