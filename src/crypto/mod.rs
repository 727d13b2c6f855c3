//! Cookie cryptography.
//!
//! The real deployment uses Python's `cryptography.fernet.Fernet`. Rust has
//! no drop-in equivalent, so per the design notes this implements the same
//! encrypt-then-MAC shape directly: AES-256-CBC for confidentiality,
//! HMAC-SHA256 for integrity, a random 16-byte IV, and a versioned
//! URL-safe-base64 wire format `v1.<iv>.<ciphertext>.<mac>`. The MAC covers
//! the version tag, IV, and ciphertext, and is compared in constant time.

use aes::Aes256;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

type Enc = cbc::Encryptor<Aes256>;
type Dec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const VERSION_TAG: &[u8] = b"v1";

/// A derived encrypt/MAC key pair, built once at startup from the 32-byte
/// session secret and held for the process lifetime.
#[derive(Clone)]
pub struct CookieCipher {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl CookieCipher {
    /// Derive a cipher from the raw 32-byte master secret read from
    /// `session_secret_file`. The secret is domain-separated into an
    /// encryption key and a MAC key via SHA-256, the way a single Fernet
    /// key is split into signing and encryption halves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `secret` is not 32 bytes.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() != 32 {
            return Err(Error::Config(format!(
                "session secret must be 32 bytes, got {}",
                secret.len()
            )));
        }
        let mut enc_hasher = Sha256::new();
        enc_hasher.update(b"gafaelfawr-rs:enc:");
        enc_hasher.update(secret);
        let enc_key: [u8; 32] = enc_hasher.finalize().into();

        let mut mac_hasher = Sha256::new();
        mac_hasher.update(b"gafaelfawr-rs:mac:");
        mac_hasher.update(secret);
        let mac_key: [u8; 32] = mac_hasher.finalize().into();

        Ok(Self { enc_key, mac_key })
    }

    /// Parse a 32-byte key from a URL-safe base64 string, as loaded from
    /// `session_secret_file`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the string is not valid base64 or does
    /// not decode to 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("invalid session secret encoding: {e}")))?;
        Self::new(&bytes)
    }

    /// Encrypt and MAC `plaintext`, producing the `v1.<iv>.<ct>.<mac>` wire format.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; 16];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Enc::new(&self.enc_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mac = self.compute_mac(&iv, &ciphertext);

        format!(
            "v1.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(&ciphertext),
            URL_SAFE_NO_PAD.encode(mac),
        )
    }

    /// Verify the MAC and decrypt a `v1.<iv>.<ct>.<mac>` cookie value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the format is malformed, the MAC
    /// does not verify, or padding is invalid.
    pub fn decrypt(&self, value: &str) -> Result<Vec<u8>> {
        let parts: Vec<&str> = value.splitn(4, '.').collect();
        let [version, iv_b64, ct_b64, mac_b64] = parts[..] else {
            return Err(Error::InvalidToken("malformed cookie".to_string()));
        };
        if version.as_bytes() != VERSION_TAG {
            return Err(Error::InvalidToken(format!(
                "unsupported cookie version: {version}"
            )));
        }

        let iv = URL_SAFE_NO_PAD
            .decode(iv_b64)
            .map_err(|_| Error::InvalidToken("malformed cookie iv".to_string()))?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|_| Error::InvalidToken("malformed cookie ciphertext".to_string()))?;
        let mac = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| Error::InvalidToken("malformed cookie mac".to_string()))?;

        let expected_mac = self.compute_mac(&iv, &ciphertext);
        if expected_mac.ct_eq(&mac).unwrap_u8() != 1 {
            return Err(Error::InvalidToken("cookie mac mismatch".to_string()));
        }

        let iv: [u8; 16] = iv
            .try_into()
            .map_err(|_| Error::InvalidToken("malformed cookie iv length".to_string()))?;

        Dec::new(&self.enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| Error::InvalidToken("cookie padding invalid".to_string()))
    }

    fn compute_mac(&self, iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(VERSION_TAG);
        mac.update(iv);
        mac.update(ciphertext);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CookieCipher {
        CookieCipher::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn roundtrip_recovers_plaintext() {
        let c = cipher();
        let wire = c.encrypt(b"hello state cookie");
        assert!(wire.starts_with("v1."));
        let decoded = c.decrypt(&wire).unwrap();
        assert_eq!(decoded, b"hello state cookie");
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let c = cipher();
        let wire = c.encrypt(b"payload");
        let mut parts: Vec<String> = wire.split('.').map(String::from).collect();
        parts[2].push('A');
        let tampered = parts.join(".");
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn wrong_key_fails_mac() {
        let c1 = CookieCipher::new(&[1u8; 32]).unwrap();
        let c2 = CookieCipher::new(&[2u8; 32]).unwrap();
        let wire = c1.encrypt(b"payload");
        assert!(c2.decrypt(&wire).is_err());
    }

    #[test]
    fn rejects_bad_version_tag() {
        let c = cipher();
        assert!(c.decrypt("v2.a.b.c").is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        let c = cipher();
        assert!(c.decrypt("not-a-cookie").is_err());
    }

    #[test]
    fn rejects_non_32_byte_secret() {
        assert!(CookieCipher::new(&[0u8; 16]).is_err());
    }

    #[test]
    fn from_base64_roundtrip() {
        let encoded = URL_SAFE_NO_PAD.encode([9u8; 32]);
        let c = CookieCipher::from_base64(&encoded).unwrap();
        let wire = c.encrypt(b"x");
        assert_eq!(c.decrypt(&wire).unwrap(), b"x");
    }
}
