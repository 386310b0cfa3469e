//! Secret sealing and retrieval.
//!
//! Secrets are AES-256-GCM ciphertexts under a process-wide master key taken
//! from configuration; the key never touches the store. Retrieval decrypts,
//! writes an access record, and hands the plaintext to the executor, which
//! registers it with the log masker before injection.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;

use crucible_core::secret::{SecretAccess, SecretRecord, SecretScope};
use crucible_core::store::SecretStore;
use crucible_core::{Error, ResourceId, Result};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// AES-256-GCM under the configured master key.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_SIZE],
}

impl SecretCipher {
    pub fn from_b64(key_b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key_b64)
            .map_err(|e| Error::InvalidInput(format!("master key is not base64: {e}")))?;
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidInput("master key must decode to 32 bytes".into()))?;
        Ok(Self { key })
    }

    /// Seal a plaintext into a fresh record for the given scope.
    pub fn seal(
        &self,
        org_id: ResourceId,
        scope: SecretScope,
        name: &str,
        plaintext: &str,
    ) -> Result<SecretRecord> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Internal(format!("seal {name}: {e:?}")))?;
        Ok(SecretRecord {
            id: ResourceId::new(),
            org_id,
            scope,
            name: name.to_string(),
            ciphertext_b64: BASE64.encode(ciphertext),
            iv_b64: BASE64.encode(nonce_bytes),
            created_at: Utc::now(),
        })
    }

    /// Decrypt a stored record back to its plaintext.
    pub fn open(&self, record: &SecretRecord) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("cipher init: {e}")))?;
        let nonce_bytes = BASE64
            .decode(&record.iv_b64)
            .map_err(|e| Error::SecretMissing(format!("{}: bad iv: {e}", record.name)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(Error::SecretMissing(format!("{}: bad iv length", record.name)));
        }
        let ciphertext = BASE64
            .decode(&record.ciphertext_b64)
            .map_err(|e| Error::SecretMissing(format!("{}: bad ciphertext: {e}", record.name)))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| Error::SecretMissing(format!("{}: decryption failed", record.name)))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::SecretMissing(format!("{}: not utf-8", record.name)))
    }
}

/// Store-backed secret retrieval with access logging.
pub struct SecretVault {
    cipher: SecretCipher,
    store: Arc<dyn SecretStore>,
}

impl SecretVault {
    pub fn new(cipher: SecretCipher, store: Arc<dyn SecretStore>) -> Self {
        Self { cipher, store }
    }

    /// Decrypt every secret visible to a job. Job-scoped values shadow
    /// global ones of the same name.
    pub async fn load_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        build_id: Option<ResourceId>,
    ) -> Result<Vec<(String, String)>> {
        let mut records = self.store.list_for_job(org_id, job_id).await?;
        // Globals first so job-scoped entries overwrite them below.
        records.sort_by_key(|r| matches!(r.scope, SecretScope::Job(_)));
        let mut out: Vec<(String, String)> = Vec::new();
        for record in records {
            let plaintext = self.cipher.open(&record)?;
            self.store
                .log_access(&SecretAccess {
                    secret_id: record.id,
                    org_id,
                    build_id,
                    accessed_at: Utc::now(),
                })
                .await?;
            out.retain(|(name, _)| name != &record.name);
            out.push((record.name, plaintext));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_db::memory::MemorySecretStore;

    fn cipher() -> SecretCipher {
        SecretCipher::from_b64(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = cipher();
        let record = cipher
            .seal(ResourceId::new(), SecretScope::Global, "API_KEY", "tok_123")
            .unwrap();
        assert_ne!(record.ciphertext_b64, "tok_123");
        assert_eq!(cipher.open(&record).unwrap(), "tok_123");
    }

    #[test]
    fn sealing_twice_produces_distinct_ciphertexts() {
        let cipher = cipher();
        let org = ResourceId::new();
        let a = cipher.seal(org, SecretScope::Global, "K", "value").unwrap();
        let b = cipher.seal(org, SecretScope::Global, "K", "value").unwrap();
        assert_ne!(a.ciphertext_b64, b.ciphertext_b64);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let record = cipher()
            .seal(ResourceId::new(), SecretScope::Global, "K", "value")
            .unwrap();
        let other = SecretCipher::from_b64(&BASE64.encode([9u8; 32])).unwrap();
        let err = other.open(&record).unwrap_err();
        assert_eq!(err.kind(), "secret-missing");
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(SecretCipher::from_b64(&BASE64.encode([1u8; 16])).is_err());
        assert!(SecretCipher::from_b64("not base64!!").is_err());
    }

    #[tokio::test]
    async fn job_scope_shadows_global() {
        let cipher = cipher();
        let store = Arc::new(MemorySecretStore::default());
        let org = ResourceId::new();
        let job = ResourceId::new();

        let global = cipher.seal(org, SecretScope::Global, "TOKEN", "global-value").unwrap();
        let scoped = cipher.seal(org, SecretScope::Job(job), "TOKEN", "job-value").unwrap();
        store.put(&global).await.unwrap();
        store.put(&scoped).await.unwrap();

        let vault = SecretVault::new(cipher, store);
        let secrets = vault.load_for_job(org, job, None).await.unwrap();
        assert_eq!(secrets, vec![("TOKEN".to_string(), "job-value".to_string())]);
    }
}
