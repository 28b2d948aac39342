/*
    Encryption subsystem - AEAD for item content plus per-provider credentials
*/

pub mod cipher;
pub mod credentials;

pub use cipher::{decrypt, derive_key, encrypt, EncryptionService, KdfParams};
pub use credentials::{CredentialError, CredentialStore, MemoryCredentialStore};
