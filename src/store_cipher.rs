//! At-rest encryption for stored rows.
//!
//! The key is decoded once at startup and handed to the store; components
//! only ever get encrypt/decrypt capability through [`StoreCipher`].

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;

use crate::errors::{PipelineError, PipelineResult};

const NONCE_LEN: usize = 12;

pub fn decode_base64_key(encoded_key: &str) -> PipelineResult<[u8; 32]> {
    let decoded = general_purpose::STANDARD
        .decode(encoded_key.trim())
        .map_err(|_| PipelineError::config("encryption key is not valid base64"))?;
    if decoded.len() != 32 {
        return Err(PipelineError::config(format!(
            "encryption key must be 32 bytes, got {}",
            decoded.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded);
    Ok(key)
}

/// Optional AES-256-GCM sealing of row values. Without a key rows are stored
/// as plain JSON.
#[derive(Clone)]
pub struct StoreCipher {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for StoreCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCipher")
            .field("encrypted", &self.is_enabled())
            .finish()
    }
}

impl StoreCipher {
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    pub fn from_key(key: &[u8; 32]) -> PipelineResult<Self> {
        if key.iter().all(|&b| b == 0) {
            return Err(PipelineError::config("encryption key cannot be all zeros"));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| PipelineError::config("invalid encryption key length"))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// Build from the configured base64 key, if any.
    pub fn from_config(encoded_key: Option<&str>) -> PipelineResult<Self> {
        match encoded_key {
            Some(encoded) => Self::from_key(&decode_base64_key(encoded)?),
            None => Ok(Self::plaintext()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Output layout: 12-byte random nonce followed by the ciphertext.
    pub fn seal(&self, data: &[u8]) -> PipelineResult<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let encrypted = cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| PipelineError::encryption("seal row"))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&encrypted);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> PipelineResult<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(sealed.to_vec());
        };

        if sealed.len() < NONCE_LEN {
            return Err(PipelineError::encryption("open row: value shorter than nonce"));
        }
        let (nonce, data) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), data)
            .map_err(|_| PipelineError::encryption("open row"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        key
    }

    #[test]
    fn sealed_rows_open_with_the_same_key() {
        let cipher = StoreCipher::from_key(&test_key()).unwrap();
        let sealed = cipher.seal(b"{\"resourceId\":\"bucket-42\"}").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"{\"resourceId\":\"bucket-42\"}");
        assert_eq!(cipher.open(&sealed).unwrap(), b"{\"resourceId\":\"bucket-42\"}");
    }

    #[test]
    fn each_seal_uses_a_fresh_nonce() {
        let cipher = StoreCipher::from_key(&test_key()).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn all_zero_key_is_rejected() {
        assert!(StoreCipher::from_key(&[0u8; 32]).is_err());
    }

    #[test]
    fn short_keys_fail_to_decode() {
        let encoded = general_purpose::STANDARD.encode([7u8; 16]);
        assert!(decode_base64_key(&encoded).is_err());
    }

    #[test]
    fn plaintext_cipher_passes_bytes_through() {
        let cipher = StoreCipher::plaintext();
        assert_eq!(cipher.seal(b"row").unwrap(), b"row");
        assert_eq!(cipher.open(b"row").unwrap(), b"row");
    }
}
