//! AES-256-CBC symmetric encryption with PKCS#7 padding.
//!
//! The envelope format fixes the symmetric layer to AES-256-CBC, so
//! this module wraps the RustCrypto `aes` + `cbc` pair rather than an
//! AEAD. Integrity comes from the envelope MAC, not the cipher.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use secmsg_types::{Result, SmsgError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES key length in bytes.
pub const AES_KEY_LEN: usize = 32;

/// AES-CBC initialisation vector length in bytes.
pub const AES_IV_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Crypter
// ---------------------------------------------------------------------------

/// Whole-buffer AES-256-CBC encryptor/decryptor.
///
/// Holds one `(key, iv)` pair; each envelope uses a fresh IV and a
/// per-message derived key, so instances are short-lived and never
/// reused across messages. No streaming — buffers are whole messages.
pub struct Crypter {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl Crypter {
    /// Creates a crypter for the given key and IV.
    pub fn new(key: [u8; AES_KEY_LEN], iv: [u8; AES_IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Encrypts `plain`, returning ciphertext padded to the block size.
    ///
    /// Output length is `plain.len() + 16 - (plain.len() % 16)` —
    /// always at least one byte longer than the input.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv).map_err(|e| {
            SmsgError::CryptoFailed {
                reason: format!("AES-256-CBC init failed: {e}"),
            }
        })?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain))
    }

    /// Decrypts `cipher`, stripping the PKCS#7 padding.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        let decipher = Aes256CbcDec::new_from_slices(&self.key, &self.iv).map_err(|e| {
            SmsgError::CryptoFailed {
                reason: format!("AES-256-CBC init failed: {e}"),
            }
        })?;
        decipher
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|_| SmsgError::CryptoFailed {
                reason: "AES-256-CBC finalize failed: bad padding".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
