//! Decryption of per-tenant vendor access tokens.
//!
//! Stored ciphertext is `base64(salt || nonce || ciphertext+tag)`. The cipher
//! key is derived per secret with HKDF-SHA256 from the process-wide
//! `CREDENTIALS_KEY`, so the master key never touches AES directly.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CredentialError;
use crate::types::Tenant;

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const HKDF_INFO: &[u8] = b"wa-agent-credential-v1";

pub trait CredentialStore: Send + Sync {
    fn access_token(&self, tenant: &Tenant) -> Result<String, CredentialError>;
}

#[derive(Clone)]
pub struct SealedCredentials {
    master_key: Vec<u8>,
}

impl std::fmt::Debug for SealedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedCredentials").finish_non_exhaustive()
    }
}

fn derive_key(master_key: &[u8], salt: &[u8]) -> Result<[u8; KEY_SIZE], CredentialError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master_key);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CredentialError::BadKey)?;
    Ok(okm)
}

impl SealedCredentials {
    pub fn from_base64_key(encoded: &str) -> Result<Self, CredentialError> {
        let master_key = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CredentialError::BadKey)?;
        if master_key.len() != KEY_SIZE {
            return Err(CredentialError::BadKey);
        }
        Ok(SealedCredentials { master_key })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = derive_key(&self.master_key, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::Encrypt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut sealed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CredentialError> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|_| CredentialError::Malformed)?;
        if raw.len() <= SALT_SIZE + NONCE_SIZE {
            return Err(CredentialError::Malformed);
        }
        let (salt, rest) = raw.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let key = derive_key(&self.master_key, salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::Decrypt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::Malformed)
    }
}

impl CredentialStore for SealedCredentials {
    fn access_token(&self, tenant: &Tenant) -> Result<String, CredentialError> {
        self.open(&tenant.credentials)
    }
}

/// Credentials stored as plaintext; used by tests and local tooling.
#[derive(Debug, Clone, Default)]
pub struct PlainCredentials;

impl CredentialStore for PlainCredentials {
    fn access_token(&self, tenant: &Tenant) -> Result<String, CredentialError> {
        if tenant.credentials.trim().is_empty() {
            return Err(CredentialError::Malformed);
        }
        Ok(tenant.credentials.trim().to_string())
    }
}
