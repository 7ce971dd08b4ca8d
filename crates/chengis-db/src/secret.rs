//! Local secret backend.
//!
//! Values are AES-256-GCM encrypted at rest under the configured master key
//! (hex, 32 bytes) with a random nonce prefixed to each ciphertext. Resolve
//! merges global-scope secrets with job-scope secrets, job scope winning.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use chengis_core::secret::{SecretBackend, SecretScope};
use chengis_core::{Error, ResourceId, Result};

use crate::repo::secrets::SecretRepo;

const NONCE_LEN: usize = 12;

/// Secret backend over the `secrets` table.
pub struct LocalSecretBackend {
    repo: Arc<dyn SecretRepo>,
    cipher: Aes256Gcm,
}

impl LocalSecretBackend {
    /// `master_key_hex` must decode to exactly 32 bytes.
    pub fn new(repo: Arc<dyn SecretRepo>, master_key_hex: &str) -> Result<Self> {
        let key_bytes = hex::decode(master_key_hex)
            .map_err(|e| Error::Validation(format!("secrets.master_key is not hex: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(Error::Validation(format!(
                "secrets.master_key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            repo,
            cipher: Aes256Gcm::new(key),
        })
    }

    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut out = nonce.to_vec();
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Internal("secret encryption failed".to_string()))?;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<String> {
        if data.len() < NONCE_LEN {
            return Err(Error::Internal("secret ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Internal("secret decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Internal("secret is not valid utf-8".to_string()))
    }

    fn scope_job(scope: SecretScope) -> Option<ResourceId> {
        match scope {
            SecretScope::Global => None,
            SecretScope::Job(id) => Some(id),
        }
    }
}

#[async_trait]
impl SecretBackend for LocalSecretBackend {
    async fn resolve(
        &self,
        org_id: Option<ResourceId>,
        job_id: ResourceId,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        let global = self
            .repo
            .get_scope(org_id, None)
            .await
            .map_err(Error::from)?;
        for row in global {
            resolved.insert(row.key.clone(), self.decrypt(&row.ciphertext)?);
        }
        // Job scope wins on key collision.
        let scoped = self
            .repo
            .get_scope(org_id, Some(job_id))
            .await
            .map_err(Error::from)?;
        for row in scoped {
            resolved.insert(row.key.clone(), self.decrypt(&row.ciphertext)?);
        }
        Ok(resolved)
    }

    async fn put(
        &self,
        org_id: Option<ResourceId>,
        scope: SecretScope,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let ciphertext = self.encrypt(value)?;
        self.repo
            .put(org_id, Self::scope_job(scope), key, ciphertext)
            .await
            .map_err(Error::from)
    }

    async fn delete(
        &self,
        org_id: Option<ResourceId>,
        scope: SecretScope,
        key: &str,
    ) -> Result<()> {
        self.repo
            .delete(org_id, Self::scope_job(scope), key)
            .await
            .map_err(Error::from)
    }

    async fn list(&self, org_id: Option<ResourceId>, scope: SecretScope) -> Result<Vec<String>> {
        let rows = self
            .repo
            .get_scope(org_id, Self::scope_job(scope))
            .await
            .map_err(Error::from)?;
        let mut keys: Vec<String> = rows.into_iter().map(|r| r.key).collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn backend() -> LocalSecretBackend {
        LocalSecretBackend::new(Arc::new(MemoryStore::new()), KEY).unwrap()
    }

    #[test]
    fn rejects_bad_master_keys() {
        let repo = Arc::new(MemoryStore::new());
        assert!(LocalSecretBackend::new(repo.clone(), "not-hex").is_err());
        assert!(LocalSecretBackend::new(repo, "deadbeef").is_err());
    }

    #[tokio::test]
    async fn round_trips_encrypted_values() {
        let backend = backend();
        let job = ResourceId::new();
        backend
            .put(None, SecretScope::Global, "API_TOKEN", "hunter2")
            .await
            .unwrap();

        let resolved = backend.resolve(None, job).await.unwrap();
        assert_eq!(resolved.get("API_TOKEN").map(String::as_str), Some("hunter2"));
    }

    #[tokio::test]
    async fn job_scope_wins_over_global() {
        let backend = backend();
        let job = ResourceId::new();
        backend
            .put(None, SecretScope::Global, "DB_URL", "global-db")
            .await
            .unwrap();
        backend
            .put(None, SecretScope::Job(job), "DB_URL", "job-db")
            .await
            .unwrap();

        let resolved = backend.resolve(None, job).await.unwrap();
        assert_eq!(resolved.get("DB_URL").map(String::as_str), Some("job-db"));

        // Another job only sees the global value.
        let other = backend.resolve(None, ResourceId::new()).await.unwrap();
        assert_eq!(other.get("DB_URL").map(String::as_str), Some("global-db"));
    }

    #[tokio::test]
    async fn list_names_keys_only() {
        let backend = backend();
        backend
            .put(None, SecretScope::Global, "B_KEY", "v2")
            .await
            .unwrap();
        backend
            .put(None, SecretScope::Global, "A_KEY", "v1")
            .await
            .unwrap();
        let keys = backend.list(None, SecretScope::Global).await.unwrap();
        assert_eq!(keys, vec!["A_KEY".to_string(), "B_KEY".to_string()]);
    }
}
