//! Compress-then-encrypt pipeline for file content.
//!
//! Only regular file bytes pass through here: symlink targets and deletion
//! tombstones are stored plain so the archive stays easy to inspect. The
//! wire format is `nonce || aead(deflate(plaintext))`.

use std::io::{Read, Write};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use rand_core::{OsRng, RngCore};
use thiserror::Error;

pub const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

// Fixed KDF salt: the passphrase is the only secret, the salt just
// domain-separates cloudsnap keys from other argon2id users.
const KDF_SALT: &[u8] = b"cloudsnap/kdf/v1";
const KDF_MEMORY_KIB: u32 = 64 * 1024;
const KDF_ITERATIONS: u32 = 1;
const KDF_PARALLELISM: u32 = 4;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("content too short to decrypt: got {got} bytes, nonce alone is {want}")]
    ContentTooShort { got: usize, want: usize },
    #[error("authentication failed: content tampered with or wrong password")]
    AuthenticationFailed,
    #[error("decompression failed: {0}")]
    DecompressFailed(#[source] std::io::Error),
    #[error("compression failed: {0}")]
    CompressFailed(#[source] std::io::Error),
    #[error("encryption failed")]
    EncryptFailed,
}

pub struct CryptoPipeline {
    aead: XChaCha20Poly1305,
}

impl CryptoPipeline {
    /// Derives the AEAD key from the passphrase once at startup. An empty
    /// passphrase is allowed and still yields a fixed, valid key.
    pub fn new(passphrase: &str) -> Result<Self, CryptoError> {
        let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_PARALLELISM, Some(KEY_LEN))
            .map_err(|err| CryptoError::Kdf(err.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = [0u8; KEY_LEN];
        argon
            .hash_password_into(passphrase.as_bytes(), KDF_SALT, &mut key)
            .map_err(|err| CryptoError::Kdf(err.to_string()))?;
        Ok(Self {
            aead: XChaCha20Poly1305::new((&key).into()),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(plaintext)
            .map_err(CryptoError::CompressFailed)?;
        let compressed = encoder.finish().map_err(CryptoError::CompressFailed)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), compressed.as_slice())
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::ContentTooShort {
                got: blob.len(),
                want: NONCE_LEN,
            });
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let compressed = self
            .aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        let mut plaintext = Vec::new();
        DeflateDecoder::new(compressed.as_slice())
            .read_to_end(&mut plaintext)
            .map_err(CryptoError::DecompressFailed)?;
        Ok(plaintext)
    }
}
