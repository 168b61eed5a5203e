//! At-rest encryption for user profile fields.
//!
//! Keys come from `DATA_ENCRYPTION_KEY`: comma-separated urlsafe-base64
//! AES-256 keys, newest first. Encryption always uses the first key; decryption
//! walks the ring so rotated-out keys keep decrypting old rows.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct KeyRing {
    ciphers: Vec<Aes256Gcm>,
}

impl KeyRing {
    /// Builds a ring from the comma-separated key spec.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut ciphers = Vec::new();
        for (idx, part) in spec.split(',').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let key = URL_SAFE
                .decode(part)
                .with_context(|| format!("key #{idx} is not valid urlsafe base64"))?;
            let cipher = Aes256Gcm::new_from_slice(&key)
                .map_err(|_| anyhow!("key #{idx} must be 32 bytes, got {}", key.len()))?;
            ciphers.push(cipher);
        }
        if ciphers.is_empty() {
            bail!("DATA_ENCRYPTION_KEY contains no keys");
        }
        Ok(Self { ciphers })
    }

    /// Encrypts with the active (first) key under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self.ciphers[0]
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&sealed);
        Ok(URL_SAFE.encode(wire))
    }

    /// Decrypts by trying every key in the ring.
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let raw = URL_SAFE.decode(token).context("token is not base64")?;
        if raw.len() <= NONCE_LEN {
            bail!("token too short");
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);
        for cipher in &self.ciphers {
            if let Ok(plain) = cipher.decrypt(nonce, sealed) {
                return Ok(String::from_utf8(plain).context("decrypted payload is not UTF-8")?);
            }
        }
        bail!("no key in the ring decrypts this token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_spec(seed: u8) -> String {
        URL_SAFE.encode([seed; 32])
    }

    #[test]
    fn round_trips_under_active_key() {
        let ring = KeyRing::from_spec(&key_spec(1)).unwrap();
        let token = ring.encrypt("{\"categories\":[\"phones\"]}").unwrap();
        assert_eq!(ring.decrypt(&token).unwrap(), "{\"categories\":[\"phones\"]}");
    }

    #[test]
    fn rotated_ring_still_decrypts_old_tokens() {
        let old = KeyRing::from_spec(&key_spec(1)).unwrap();
        let token = old.encrypt("secret").unwrap();

        let rotated = KeyRing::from_spec(&format!("{},{}", key_spec(2), key_spec(1))).unwrap();
        assert_eq!(rotated.decrypt(&token).unwrap(), "secret");
        // New tokens use the new key and are opaque to the old ring.
        let fresh = rotated.encrypt("secret").unwrap();
        assert!(old.decrypt(&fresh).is_err());
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let ring = KeyRing::from_spec(&key_spec(3)).unwrap();
        let a = ring.encrypt("same").unwrap();
        let b = ring.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(ring.decrypt(&a).unwrap(), ring.decrypt(&b).unwrap());
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(KeyRing::from_spec("").is_err());
        assert!(KeyRing::from_spec("not-base64!!").is_err());
        assert!(KeyRing::from_spec(&URL_SAFE.encode([0u8; 16])).is_err());
    }
}
