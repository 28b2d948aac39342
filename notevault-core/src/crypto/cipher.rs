/*
    cipher.rs - At-rest encryption of item content

    Encrypts item content before it reaches a provider using AES-256-GCM.
    Keys are derived from per-provider passwords with Argon2id.

    Envelope (stored base64-encoded in the item's content field):
    [Magic: 4 bytes "NVE1"][Salt: 16 bytes][Nonce: 12 bytes][Ciphertext + AEAD tag]

    Security properties:
    - Authenticated encryption (AEAD); a wrong key fails closed
    - Unique nonce per encryption
    - One random salt per provider per session, so the KDF runs once per session
*/

use crate::crypto::credentials::CredentialStore;
use crate::error::{StorageError, StorageResult};
use crate::model::{ProviderId, StorageItem};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Magic header for encrypted content envelopes
const MAGIC_HEADER: &[u8; 4] = b"NVE1";

/// Salt length for Argon2 KDF (16 bytes = 128 bits)
const SALT_LEN: usize = 16;

/// Nonce length for AES-GCM (12 bytes = 96 bits)
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/// Header size: magic(4) + salt(16) + nonce(12) = 32 bytes
const HEADER_SIZE: usize = 4 + SALT_LEN + NONCE_LEN;

const KEY_LEN: usize = 32;

type Key = Zeroizing<[u8; KEY_LEN]>;

fn handle_poison<T>(_err: PoisonError<T>) -> StorageError {
    StorageError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            memory_kib: 19 * 1024, // 19 MiB
            iterations: 2,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and throwaway stores
    pub fn insecure_fast() -> Self {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
        }
    }
}

/// Derive a 256-bit key from a password and salt
pub fn derive_key(password: &[u8], salt: &[u8], params: &KdfParams) -> StorageResult<Zeroizing<[u8; 32]>> {
    let params = Params::new(params.memory_kib, params.iterations, 1, Some(KEY_LEN))
        .map_err(|e| StorageError::EncryptionFailed(format!("Invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, salt, &mut key[..])
        .map_err(|e| StorageError::EncryptionFailed(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn seal_with_key(plaintext: &[u8], key: &[u8; KEY_LEN], salt: &[u8; SALT_LEN]) -> StorageResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StorageError::EncryptionFailed(format!("Invalid key: {}", e)))?;

    let nonce_bytes: [u8; NONCE_LEN] = random_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| StorageError::EncryptionFailed(e.to_string()))?;

    let mut envelope = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    envelope.extend_from_slice(MAGIC_HEADER);
    envelope.extend_from_slice(salt);
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(envelope))
}

/// Parsed envelope: (salt, nonce, ciphertext)
fn parse_envelope(envelope: &str) -> StorageResult<([u8; SALT_LEN], [u8; NONCE_LEN], Vec<u8>)> {
    let raw = STANDARD
        .decode(envelope.trim())
        .map_err(|e| StorageError::DecryptionFailed(format!("Envelope is not base64: {}", e)))?;

    if raw.len() < HEADER_SIZE + TAG_LEN {
        return Err(StorageError::DecryptionFailed("Truncated envelope".to_string()));
    }
    if &raw[..4] != MAGIC_HEADER {
        return Err(StorageError::DecryptionFailed("Invalid magic header".to_string()));
    }

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&raw[4..4 + SALT_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&raw[4 + SALT_LEN..HEADER_SIZE]);

    Ok((salt, nonce, raw[HEADER_SIZE..].to_vec()))
}

fn open_with_key(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| StorageError::DecryptionFailed(format!("Invalid key: {}", e)))?;

    // AEAD tag mismatch = wrong password or corrupted data
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StorageError::DecryptionFailed("Authentication failed".to_string()))
}

/// Encrypt `plaintext` under `password` with a fresh salt
pub fn encrypt(plaintext: &[u8], password: &SecretString, params: &KdfParams) -> StorageResult<String> {
    let salt: [u8; SALT_LEN] = random_bytes();
    let key = derive_key(password.expose_secret().as_bytes(), &salt, params)?;
    seal_with_key(plaintext, &key, &salt)
}

/// Decrypt an envelope produced by [`encrypt`] or [`EncryptionService`]
pub fn decrypt(envelope: &str, password: &SecretString, params: &KdfParams) -> StorageResult<Vec<u8>> {
    let (salt, nonce, ciphertext) = parse_envelope(envelope)?;
    let key = derive_key(password.expose_secret().as_bytes(), &salt, params)?;
    open_with_key(&key, &nonce, &ciphertext)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyCacheKey {
    salt: [u8; SALT_LEN],
    password_fingerprint: [u8; 32],
}

impl KeyCacheKey {
    fn new(salt: [u8; SALT_LEN], password: &SecretString) -> Self {
        KeyCacheKey {
            salt,
            password_fingerprint: blake3::derive_key(
                "notevault 2024 key cache fingerprint",
                password.expose_secret().as_bytes(),
            ),
        }
    }
}

/// Item-level encryption bound to a credential store
///
/// Derived keys are cached by (salt, password fingerprint): a changed password
/// never reuses a key derived from the old one.
pub struct EncryptionService {
    credentials: Arc<dyn CredentialStore>,
    kdf: KdfParams,
    session_salts: Mutex<HashMap<ProviderId, [u8; SALT_LEN]>>,
    keys: Mutex<HashMap<KeyCacheKey, Key>>,
}

impl EncryptionService {
    pub fn new(credentials: Arc<dyn CredentialStore>, kdf: KdfParams) -> Self {
        EncryptionService {
            credentials,
            kdf,
            session_salts: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Store (or replace) the password used for a provider
    pub fn store_password(&self, provider: &ProviderId, password: SecretString) -> StorageResult<()> {
        self.credentials.set(provider, password)?;
        // Items written from now on get a new salt
        self.session_salts.lock().map_err(handle_poison)?.remove(provider);
        Ok(())
    }

    pub fn get_password(&self, provider: &ProviderId) -> StorageResult<Option<SecretString>> {
        Ok(self.credentials.get(provider)?)
    }

    /// Fetch the provider's password, generating and storing one on first use
    fn password_for_write(&self, provider: &ProviderId) -> StorageResult<SecretString> {
        if let Some(password) = self.get_password(provider)? {
            return Ok(password);
        }

        info!(provider = %provider, "Provisioning encryption password");
        let generated = SecretString::new(STANDARD.encode(random_bytes::<32>()));
        self.credentials.set(provider, generated.clone())?;
        Ok(generated)
    }

    fn session_salt(&self, provider: &ProviderId) -> StorageResult<[u8; SALT_LEN]> {
        let mut salts = self.session_salts.lock().map_err(handle_poison)?;
        Ok(*salts.entry(provider.clone()).or_insert_with(random_bytes::<SALT_LEN>))
    }

    fn key_for(&self, salt: [u8; SALT_LEN], password: &SecretString) -> StorageResult<Key> {
        let cache_key = KeyCacheKey::new(salt, password);
        if let Some(key) = self.keys.lock().map_err(handle_poison)?.get(&cache_key) {
            return Ok(key.clone());
        }

        debug!("Deriving content key");
        let key = derive_key(password.expose_secret().as_bytes(), &salt, &self.kdf)?;
        self.keys
            .lock()
            .map_err(handle_poison)?
            .insert(cache_key, key.clone());
        Ok(key)
    }

    /// Return a copy of `item` whose content is sealed for `provider`
    ///
    /// Already-encrypted items are returned unchanged.
    pub fn encrypt_item(&self, item: &StorageItem, provider: &ProviderId) -> StorageResult<StorageItem> {
        if item.is_encrypted {
            return Ok(item.clone());
        }

        let password = self
            .password_for_write(provider)
            .map_err(|e| StorageError::EncryptionFailed(e.to_string()))?;
        let salt = self.session_salt(provider)?;
        let key = self.key_for(salt, &password)?;

        let mut sealed = item.clone();
        sealed.content = seal_with_key(item.content.as_bytes(), &key, &salt)?;
        sealed.is_encrypted = true;
        Ok(sealed)
    }

    /// Return a plaintext copy of an item read from `provider`
    ///
    /// Fails closed: a missing password or a key mismatch is an error, never
    /// a best-effort plaintext.
    pub fn decrypt_item(&self, item: &StorageItem, provider: &ProviderId) -> StorageResult<StorageItem> {
        if !item.is_encrypted {
            return Ok(item.clone());
        }

        let password = self.get_password(provider)?.ok_or_else(|| {
            StorageError::DecryptionFailed(format!("No password stored for provider {}", provider))
        })?;
        let (salt, nonce, ciphertext) = parse_envelope(&item.content)?;
        let key = self.key_for(salt, &password)?;
        let plaintext = open_with_key(&key, &nonce, &ciphertext)?;

        let mut opened = item.clone();
        opened.content = String::from_utf8(plaintext)
            .map_err(|e| StorageError::DecryptionFailed(format!("Content is not UTF-8: {}", e)))?;
        opened.is_encrypted = false;
        Ok(opened)
    }
}
