use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};
use crate::error::{AppError, Result};

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecureKey([u8; KEY_SIZE]);

/// Seals small secrets (second factor seeds) under the process master key.
///
/// Sealed format: `ciphertext || nonce`, nonce being the trailing 12 bytes.
#[derive(Clone)]
pub struct SecretBox {
    key: SecureKey,
}

impl SecretBox {
    /// Creates a new `SecretBox` from the 32-byte master key.
    pub fn new(master_key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = master_key
            .try_into()
            .map_err(|_| AppError::Encryption("Invalid master key size".to_string()))?;
        Ok(Self { key: SecureKey(key) })
    }

    /// Encrypts `plaintext` with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new((&self.key.0).into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;
        sealed.extend_from_slice(&nonce_bytes);

        Ok(sealed)
    }

    /// Decrypts a value produced by [`SecretBox::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() <= NONCE_SIZE {
            return Err(AppError::Encryption("Sealed value too short".to_string()));
        }

        let (ciphertext, nonce_bytes) = sealed.split_at(sealed.len() - NONCE_SIZE);
        let cipher = Aes256Gcm::new((&self.key.0).into());

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| AppError::Encryption(format!("Decryption failed: {}", e)))
    }
}
