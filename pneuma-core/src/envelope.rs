//! AEAD envelope for payloads crossing the mesh and backbone.
//!
//! AES-GCM with a 128, 192 or 256-bit key. Blob layout:
//! `nonce (12) || tag (16) || ciphertext`. Every `encrypt` draws a fresh random
//! nonce from the OS RNG; no counter state is kept, so restarts cannot reuse one.

use std::fmt;

use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Shortest blob that can possibly decrypt (empty plaintext).
pub const MIN_BLOB_LEN: usize = NONCE_LEN + TAG_LEN;

const SESSION_KEY_INFO: &[u8] = b"pneuma-session-v1";

type Aes192Gcm = AesGcm<Aes192, U12>;

#[derive(Clone)]
enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// Authenticated encryption with associated data. The key is fixed at construction.
#[derive(Clone)]
pub struct Envelope {
    cipher: Cipher,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("key must be 16, 24, or 32 bytes (got {0})")]
    InvalidKey(usize),
    #[error("encryption failed")]
    Encrypt,
}

impl Envelope {
    pub fn new(key: &[u8]) -> Result<Self, EnvelopeError> {
        let invalid = |_| EnvelopeError::InvalidKey(key.len());
        let cipher = match key.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            32 => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            n => return Err(EnvelopeError::InvalidKey(n)),
        };
        Ok(Self { cipher })
    }

    /// Key size in bits.
    pub fn key_bits(&self) -> usize {
        match self.cipher {
            Cipher::Aes128(_) => 128,
            Cipher::Aes192(_) => 192,
            Cipher::Aes256(_) => 256,
        }
    }

    /// Encrypt `plaintext`, authenticating `associated_data` (may be empty).
    pub fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        match &self.cipher {
            Cipher::Aes128(c) => seal(c, plaintext, associated_data),
            Cipher::Aes192(c) => seal(c, plaintext, associated_data),
            Cipher::Aes256(c) => seal(c, plaintext, associated_data),
        }
    }

    /// Decrypt and verify. Short blobs, bad tags and wrong associated data all give `None`.
    pub fn decrypt(&self, blob: &[u8], associated_data: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < MIN_BLOB_LEN {
            return None;
        }
        match &self.cipher {
            Cipher::Aes128(c) => open(c, blob, associated_data),
            Cipher::Aes192(c) => open(c, blob, associated_data),
            Cipher::Aes256(c) => open(c, blob, associated_data),
        }
    }

    pub fn encrypt_json(&self, text: &str, associated_data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        self.encrypt(text.as_bytes(), associated_data)
    }

    /// Like `decrypt`, but also `None` when the plaintext is not UTF-8.
    pub fn decrypt_json(&self, blob: &[u8], associated_data: &[u8]) -> Option<String> {
        self.decrypt(blob, associated_data)
            .and_then(|plain| String::from_utf8(plain).ok())
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("key_bits", &self.key_bits())
            .finish_non_exhaustive()
    }
}

fn seal<C>(cipher: &C, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, EnvelopeError>
where
    C: AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16>,
{
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), associated_data, &mut buffer)
        .map_err(|_| EnvelopeError::Encrypt)?;
    let mut out = Vec::with_capacity(MIN_BLOB_LEN + buffer.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&buffer);
    Ok(out)
}

fn open<C>(cipher: &C, blob: &[u8], associated_data: &[u8]) -> Option<Vec<u8>>
where
    C: AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16>,
{
    let (nonce, rest) = blob.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            associated_data,
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .ok()?;
    Some(buffer)
}

/// Derive a 32-byte AES-256 session key from a key-agreement shared secret (HKDF-SHA256).
pub fn derive_session_key(shared_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(SESSION_KEY_INFO, &mut okm)
        .expect("32-byte output is valid for HKDF-SHA256");
    okm
}
