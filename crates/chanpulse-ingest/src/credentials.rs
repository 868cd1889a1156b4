//! Tenant credential storage and sealing.
//!
//! Credentials are stored only as sealed blobs:
//! `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext`, keyed per tenant with
//! HKDF-SHA256 over the master key and bound to the tenant id as associated
//! data. [`CredentialCipher::open`] yields a [`Credential`] whose plaintext is
//! zeroized on drop; the session manager holds it only while connecting.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chanpulse_core::TenantId;
use hkdf::Hkdf;
use parking_lot::RwLock;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HKDF_SALT: &[u8] = b"chanpulse/credential/v1";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential registered for tenant {0}")]
    NotFound(TenantId),

    #[error("master key must be {KEY_LEN} bytes of base64: {0}")]
    InvalidKey(String),

    #[error("credential blob is not valid base64: {0}")]
    Encoding(String),

    #[error("credential blob is malformed")]
    Malformed,

    #[error("failed to seal credential")]
    Seal,

    #[error("failed to open credential for tenant {0}")]
    Open(TenantId),

    #[error("credential store error: {0}")]
    Store(String),
}

impl From<CredentialError> for chanpulse_core::Error {
    fn from(err: CredentialError) -> Self {
        Self::Credential(err.to_string())
    }
}

/// Decrypted credential. Plaintext is wiped when dropped.
pub struct Credential {
    secret: Zeroizing<String>,
}

impl Credential {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        self.secret.as_str()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

pub struct CredentialCipher {
    master: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher(<redacted>)")
    }
}

impl CredentialCipher {
    #[must_use]
    pub fn new(master: [u8; KEY_LEN]) -> Self {
        Self {
            master: Zeroizing::new(master),
        }
    }

    /// Parse a base64 master key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidKey`] unless the input decodes to
    /// exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CredentialError::InvalidKey(e.to_string()))?,
        );
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CredentialError::InvalidKey(format!("got {} bytes", bytes.len())))?;
        Ok(Self::new(key))
    }

    fn tenant_cipher(&self, tenant: &TenantId) -> Result<ChaCha20Poly1305, CredentialError> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), self.master.as_slice());
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(tenant.as_str().as_bytes(), okm.as_mut_slice())
            .map_err(|_| CredentialError::Seal)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(okm.as_slice())))
    }

    /// Seal `secret` for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Seal`] if encryption fails.
    pub fn seal(&self, tenant: &TenantId, secret: &str) -> Result<Vec<u8>, CredentialError> {
        let cipher = self.tenant_cipher(tenant)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: secret.as_bytes(),
                    aad: tenant.as_str().as_bytes(),
                },
            )
            .map_err(|_| CredentialError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a blob sealed for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] for truncated blobs and
    /// [`CredentialError::Open`] if authentication fails (wrong key, wrong
    /// tenant, or tampering).
    pub fn open(&self, tenant: &TenantId, blob: &[u8]) -> Result<Credential, CredentialError> {
        if blob.len() <= NONCE_LEN {
            return Err(CredentialError::Malformed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = self.tenant_cipher(tenant)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: tenant.as_str().as_bytes(),
                    },
                )
                .map_err(|_| CredentialError::Open(tenant.clone()))?,
        );
        let secret = std::str::from_utf8(&plaintext).map_err(|_| CredentialError::Malformed)?;
        Ok(Credential::new(secret))
    }
}

#[must_use]
pub fn encode_blob(blob: &[u8]) -> String {
    STANDARD.encode(blob)
}

/// # Errors
///
/// Returns [`CredentialError::Encoding`] if `encoded` is not base64.
pub fn decode_blob(encoded: &str) -> Result<Vec<u8>, CredentialError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| CredentialError::Encoding(e.to_string()))
}

/// External store of sealed credential blobs, owned by account management.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn read(&self, tenant: &TenantId) -> Result<Vec<u8>, CredentialError>;

    /// Replace the tenant's blob (registration or rotation).
    async fn write(&self, tenant: &TenantId, blob: Vec<u8>) -> Result<(), CredentialError>;

    async fn remove(&self, tenant: &TenantId) -> Result<(), CredentialError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    blobs: RwLock<HashMap<TenantId, Vec<u8>>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn read(&self, tenant: &TenantId) -> Result<Vec<u8>, CredentialError> {
        self.blobs
            .read()
            .get(tenant)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(tenant.clone()))
    }

    async fn write(&self, tenant: &TenantId, blob: Vec<u8>) -> Result<(), CredentialError> {
        self.blobs.write().insert(tenant.clone(), blob);
        Ok(())
    }

    async fn remove(&self, tenant: &TenantId) -> Result<(), CredentialError> {
        self.blobs.write().remove(tenant);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new([7u8; KEY_LEN])
    }

    #[test]
    fn seal_then_open_recovers_secret() {
        let tenant = TenantId::new("acct-1");
        let blob = cipher().seal(&tenant, "session-string").unwrap();
        assert!(!blob.windows(7).any(|w| w == b"session"));
        let credential = cipher().open(&tenant, &blob).unwrap();
        assert_eq!(credential.expose(), "session-string");
        assert_eq!(format!("{credential:?}"), "Credential(<redacted>)");
    }

    #[test]
    fn blob_is_bound_to_tenant() {
        let blob = cipher().seal(&TenantId::new("a"), "secret").unwrap();
        let err = cipher().open(&TenantId::new("b"), &blob).unwrap_err();
        assert!(matches!(err, CredentialError::Open(_)));
    }

    #[test]
    fn wrong_master_key_fails() {
        let tenant = TenantId::new("a");
        let blob = cipher().seal(&tenant, "secret").unwrap();
        let other = CredentialCipher::new([9u8; KEY_LEN]);
        assert!(other.open(&tenant, &blob).is_err());
        assert!(matches!(
            cipher().open(&tenant, &blob[..4]),
            Err(CredentialError::Malformed)
        ));
    }

    #[test]
    fn master_key_parses_from_base64() {
        let encoded = STANDARD.encode([1u8; KEY_LEN]);
        assert!(CredentialCipher::from_base64(&encoded).is_ok());
        assert!(matches!(
            CredentialCipher::from_base64(&STANDARD.encode([1u8; 8])),
            Err(CredentialError::InvalidKey(_))
        ));
    }

    #[test]
    fn blob_base64_round_trips() {
        let blob = vec![0u8, 1, 2, 250];
        assert_eq!(decode_blob(&encode_blob(&blob)).unwrap(), blob);
        assert!(decode_blob("%%%").is_err());
    }

    #[tokio::test]
    async fn memory_store_reads_what_was_written() {
        let store = MemoryCredentialStore::new();
        let tenant = TenantId::new("a");
        assert!(matches!(
            store.read(&tenant).await,
            Err(CredentialError::NotFound(_))
        ));
        store.write(&tenant, vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.read(&tenant).await.unwrap(), vec![1, 2, 3]);
        store.remove(&tenant).await.unwrap();
        assert!(store.read(&tenant).await.is_err());
    }
}
