//! Salt, key derivation and authenticated block encryption.
//!
//! Encoded payload format when a key is configured:
//! ```text
//! [12 bytes: random nonce][AES-256-GCM(plaintext ‖ PKCS#7 padding)][16 bytes: tag]
//! ```
//! Padding brings the sealed body to a multiple of the AES block size, so the
//! ciphertext length (minus nonce) is always a multiple of 16. Without a key the
//! payload is stored as-is.

use crate::error::{Error, Result};
use crate::hash::ContentHasher;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use zeroize::Zeroize;

/// Salt length in bytes.
pub const SALT_LENGTH: usize = 128;

/// Name of the salt file at the store root.
pub const SALT_FILE_NAME: &str = "salt";

/// Derived key length in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES block size in bytes.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// GCM authentication tag length in bytes.
const TAG_SIZE: usize = 16;

/// Per-store random salt, created once and never rotated.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Create a salt from raw bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Salt(bytes)
    }

    /// Generate a fresh salt from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Salt(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({}..)", hex::encode(&self.0[..4]))
    }
}

/// Read the salt file under `store_dir`.
pub fn load_salt(store_dir: &Path) -> Result<Salt> {
    let salt_path = store_dir.join(SALT_FILE_NAME);
    let mut file = fs::File::open(&salt_path)?;
    let mut bytes = [0u8; SALT_LENGTH];
    // A short salt file surfaces as UnexpectedEof
    file.read_exact(&mut bytes)?;
    Ok(Salt(bytes))
}

/// Read the salt file under `store_dir`, creating it if it does not exist.
///
/// Creation uses exclusive-create semantics: if another process created the
/// file between our read attempt and our write, the collision is an error.
pub fn load_or_create_salt(store_dir: &Path) -> Result<Salt> {
    match load_salt(store_dir) {
        Ok(salt) => Ok(salt),
        Err(Error::Io { source }) if source.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(store_dir)?;
            let salt = Salt::generate();
            let salt_path = store_dir.join(SALT_FILE_NAME);
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&salt_path)?;
            file.write_all(salt.as_bytes())?;
            file.sync_all()?;
            tracing::info!(path = %salt_path.display(), "salt created");
            Ok(salt)
        }
        Err(e) => Err(e),
    }
}

/// Argon2id parameters for key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone)]
pub struct Key {
    bytes: [u8; KEY_SIZE],
}

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key").field("bytes", &"[REDACTED]").finish()
    }
}

/// Derive a key from a password and the store salt using Argon2id.
///
/// Deterministic for a given (password, salt, params) triple.
pub fn derive_key(password: &SecretString, salt: &Salt, params: &KdfParams) -> Result<Key> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt.as_bytes(), &mut key)
        .map_err(|e| Error::config(format!("Argon2id key derivation failed: {e}")))?;

    Ok(Key::from_bytes(key))
}

/// Derived key material for one store or restore run.
///
/// Without a key the context is pass-through: `encode`/`decode` return their
/// input unchanged, while hashing is still salted.
pub struct SecurityContext {
    salt: Salt,
    cipher: Option<Aes256Gcm>,
}

impl SecurityContext {
    /// Build a context from an explicit salt and optional key.
    pub fn new(salt: Salt, key: Option<&Key>) -> Self {
        let cipher = key.map(|k| Aes256Gcm::new(k.as_bytes().into()));
        Self {
            salt,
            cipher,
        }
    }

    /// Open the context for a store, creating its salt on first use.
    pub fn create_or_open(
        store_dir: &Path,
        password: Option<&SecretString>,
        params: &KdfParams,
    ) -> Result<Self> {
        let salt = load_or_create_salt(store_dir)?;
        Self::with_password(salt, password, params)
    }

    /// Open the context for an existing store; the salt file must exist.
    pub fn open(
        store_dir: &Path,
        password: Option<&SecretString>,
        params: &KdfParams,
    ) -> Result<Self> {
        let salt = load_salt(store_dir).map_err(|e| match e {
            Error::Io { source } if source.kind() == ErrorKind::NotFound => Error::config(format!(
                "no salt file found in {}; is this a kopi store?",
                store_dir.display()
            )),
            other => other,
        })?;
        Self::with_password(salt, password, params)
    }

    fn with_password(
        salt: Salt,
        password: Option<&SecretString>,
        params: &KdfParams,
    ) -> Result<Self> {
        match password {
            Some(password) => {
                let key = derive_key(password, &salt, params)?;
                tracing::info!("encryption enabled");
                Ok(Self::new(salt, Some(&key)))
            }
            None => {
                tracing::info!("encryption disabled");
                Ok(Self::new(salt, None))
            }
        }
    }

    /// The store salt.
    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    /// Whether payloads are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// A hash accumulator pre-seeded with the store salt.
    pub fn new_hasher(&self) -> ContentHasher {
        ContentHasher::new(self.salt.as_bytes())
    }

    /// Encrypt a payload. Each call draws a fresh nonce, which is prepended
    /// to the output so `decode` needs nothing else.
    pub fn encode<'a>(&self, plaintext: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        let Some(cipher) = &self.cipher else {
            return Ok(Cow::Borrowed(plaintext));
        };

        let padding = CIPHER_BLOCK_SIZE - plaintext.len() % CIPHER_BLOCK_SIZE;
        let mut padded = Vec::with_capacity(plaintext.len() + padding);
        padded.extend_from_slice(plaintext);
        padded.resize(plaintext.len() + padding, padding as u8);

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), padded.as_slice())
            .map_err(|e| Error::encryption(e.to_string()))?;
        padded.zeroize();

        tracing::trace!(
            clear_text = plaintext.len(),
            padding,
            sealed = sealed.len(),
            "encrypted payload"
        );

        let mut output = Vec::with_capacity(NONCE_SIZE + sealed.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&sealed);
        Ok(Cow::Owned(output))
    }

    /// Decrypt a payload produced by `encode`.
    pub fn decode(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(input);
        };

        if input.len() < NONCE_SIZE {
            return Err(Error::decryption(format!(
                "payload of {} bytes is shorter than the {}-byte nonce",
                input.len(),
                NONCE_SIZE
            )));
        }

        let (nonce, sealed) = input.split_at(NONCE_SIZE);
        if sealed.len() % CIPHER_BLOCK_SIZE != 0 || sealed.len() < TAG_SIZE + CIPHER_BLOCK_SIZE {
            return Err(Error::decryption(format!(
                "cipher text size {} is not a positive multiple of the block size {}",
                sealed.len(),
                CIPHER_BLOCK_SIZE
            )));
        }

        let mut padded = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::decryption("authentication failed: wrong key or corrupted data"))?;

        let padding = padded.last().copied().unwrap_or(0) as usize;
        let valid_padding = (1..=CIPHER_BLOCK_SIZE).contains(&padding)
            && padding <= padded.len()
            && padded[padded.len() - padding..]
                .iter()
                .all(|&b| b as usize == padding);
        if !valid_padding {
            return Err(Error::decryption("invalid padding"));
        }

        padded.truncate(padded.len() - padding);
        Ok(padded)
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("salt", &self.salt)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}
