//! Caller-supplied secret and the per-file key material derived from it.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CodecError, CodecResult};
use crate::params::{CipherParams, KEY_SIZE, MAC_SALT_MASK, SALT_SIZE};

/// The 32-byte symmetric secret obtained out of band. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// # Errors
    /// Returns [`CodecError::InvalidKeyLength`] unless `bytes` is exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CodecError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded key (64 hex digits, optional `0x` prefix).
    ///
    /// # Errors
    /// Returns an error for non-hex input or a decoded length other than 32 bytes.
    pub fn from_hex(text: &str) -> CodecResult<Self> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let mut decoded =
            hex::decode(digits).map_err(|err| CodecError::InvalidKeyFormat(err.to_string()))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").field("bytes", &"[REDACTED]").finish()
    }
}

/// Encryption and MAC keys for one file. Never persisted; zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    enc_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl DerivedKeys {
    /// PBKDF2-HMAC-SHA512 over the secret for the encryption key, then a short second pass over
    /// the encryption key, salted with `salt ^ 0x3A`, for the MAC key.
    #[must_use]
    pub fn derive(secret: &SecretKey, salt: &[u8; SALT_SIZE], params: &CipherParams) -> Self {
        let mut enc_key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha512>(secret.as_bytes(), salt, params.kdf_iterations, &mut enc_key);

        let mut mac_salt = *salt;
        for byte in &mut mac_salt {
            *byte ^= MAC_SALT_MASK;
        }
        let mut mac_key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha512>(&enc_key, &mac_salt, params.mac_kdf_iterations, &mut mac_key);

        Self { enc_key, mac_key }
    }

    #[must_use]
    pub fn enc_key(&self) -> &[u8; KEY_SIZE] {
        &self.enc_key
    }

    #[must_use]
    pub fn mac_key(&self) -> &[u8; KEY_SIZE] {
        &self.mac_key
    }
}
