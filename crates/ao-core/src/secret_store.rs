//! Encrypted-at-rest storage for AI backend keys and forge (GitHub/GitLab)
//! tokens, plus the validation probes run when a secret is saved.
//!
//! Each secret is written to disk as two sibling files under
//! [`Config::secrets_dir`]: a ciphertext blob (ChaCha20-Poly1305, via
//! [`crate::crypto`]) and a cleartext metadata sidecar (label/avatar/
//! connection method — nothing sensitive). The encryption key itself is
//! generated once and persisted to `<secrets_dir>/.key`, mode-restricted
//! on Unix; losing that file invalidates every stored secret.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{decrypt, encrypt, CryptoError, EncryptionKey};
use crate::types::{ForgeConnectionMethod, SecretKind, SecretMetadata, SecretProvider, SecretStatus};

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no secret stored for {kind:?}/{provider:?}")]
    NotFound {
        kind: SecretKind,
        provider: SecretProvider,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Outcome of a validation probe run against a freshly-saved secret.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub detail: Option<String>,
}

/// A validation probe: given a secret kind/provider and its plaintext, makes
/// a minimal live call (model list, who-am-I) to confirm the credential
/// actually works. Swappable for tests via [`SecretStore::with_validator`].
#[async_trait::async_trait]
pub trait SecretValidator: Send + Sync {
    async fn validate(
        &self,
        kind: SecretKind,
        provider: SecretProvider,
        plaintext: &str,
    ) -> ValidationOutcome;
}

/// Validator that makes real HTTP calls against each provider's cheapest
/// read-only endpoint.
pub struct HttpSecretValidator {
    client: reqwest::Client,
}

impl Default for HttpSecretValidator {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SecretValidator for HttpSecretValidator {
    async fn validate(
        &self,
        _kind: SecretKind,
        provider: SecretProvider,
        plaintext: &str,
    ) -> ValidationOutcome {
        let result = match provider {
            SecretProvider::Anthropic => self
                .client
                .get("https://api.anthropic.com/v1/models")
                .header("x-api-key", plaintext)
                .header("anthropic-version", "2023-06-01")
                .send()
                .await,
            SecretProvider::OpenAi => self
                .client
                .get("https://api.openai.com/v1/models")
                .bearer_auth(plaintext)
                .send()
                .await,
            SecretProvider::OpenRouter => self
                .client
                .get("https://openrouter.ai/api/v1/models")
                .bearer_auth(plaintext)
                .send()
                .await,
            SecretProvider::Github => self
                .client
                .get("https://api.github.com/user")
                .bearer_auth(plaintext)
                .header("user-agent", "orchestrator")
                .send()
                .await,
            SecretProvider::Gitlab => self
                .client
                .get("https://gitlab.com/api/v4/user")
                .header("PRIVATE-TOKEN", plaintext)
                .send()
                .await,
        };

        match result {
            Ok(resp) if resp.status().is_success() => ValidationOutcome {
                valid: true,
                detail: None,
            },
            Ok(resp) => ValidationOutcome {
                valid: false,
                detail: Some(format!("provider responded with {}", resp.status())),
            },
            Err(e) => ValidationOutcome {
                valid: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredMetadata {
    metadata: SecretMetadata,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// Encrypted-at-rest secret storage, keyed by `(SecretKind, SecretProvider)`.
pub struct SecretStore {
    dir: PathBuf,
    key: EncryptionKey,
    validator: Box<dyn SecretValidator>,
}

impl SecretStore {
    /// Open (or initialize) the secret store rooted at `dir`, generating and
    /// persisting an encryption key on first use.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SecretStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let key = Self::load_or_create_key(&dir)?;
        Ok(Self {
            dir,
            key,
            validator: Box::new(HttpSecretValidator::default()),
        })
    }

    /// Override the validator (used in tests to avoid real network calls).
    pub fn with_validator(mut self, validator: Box<dyn SecretValidator>) -> Self {
        self.validator = validator;
        self
    }

    fn load_or_create_key(dir: &Path) -> Result<EncryptionKey, SecretStoreError> {
        let key_path = dir.join(".key");
        if key_path.exists() {
            let bytes = fs::read(&key_path)?;
            return Ok(EncryptionKey::from_bytes(&bytes)?);
        }
        let key = EncryptionKey::generate()?;
        fs::write(&key_path, key.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(key)
    }

    fn slug(kind: SecretKind, provider: SecretProvider) -> String {
        format!("{kind:?}-{provider:?}").to_lowercase()
    }

    fn blob_path(&self, kind: SecretKind, provider: SecretProvider) -> PathBuf {
        self.dir.join(format!("{}.enc", Self::slug(kind, provider)))
    }

    fn meta_path(&self, kind: SecretKind, provider: SecretProvider) -> PathBuf {
        self.dir.join(format!("{}.meta.json", Self::slug(kind, provider)))
    }

    /// Encrypt and persist `plaintext`, running the provider's validation
    /// probe first. On validation failure the secret is still saved (the
    /// caller may be testing intentionally-wrong credentials) but the error
    /// is reported as the `Err` variant when `reject_invalid` is set.
    pub async fn save(
        &self,
        kind: SecretKind,
        provider: SecretProvider,
        mut plaintext: String,
        metadata: SecretMetadata,
        reject_invalid: bool,
    ) -> Result<ValidationOutcome, SecretStoreError> {
        let outcome = self.validator.validate(kind, provider, &plaintext).await;

        if reject_invalid && !outcome.valid {
            plaintext.zeroize();
            return Err(SecretStoreError::ValidationFailed(
                outcome.detail.clone().unwrap_or_else(|| "credential rejected".into()),
            ));
        }

        let ciphertext = encrypt(&self.key, plaintext.as_bytes())?;
        plaintext.zeroize();
        fs::write(self.blob_path(kind, provider), ciphertext)?;

        let stored_meta = StoredMetadata {
            metadata,
            updated_at: chrono::Utc::now(),
        };
        fs::write(
            self.meta_path(kind, provider),
            serde_json::to_vec_pretty(&stored_meta)?,
        )?;

        Ok(outcome)
    }

    /// Decrypt and return the plaintext secret, if present.
    pub fn get_plaintext(
        &self,
        kind: SecretKind,
        provider: SecretProvider,
    ) -> Result<String, SecretStoreError> {
        let path = self.blob_path(kind, provider);
        if !path.exists() {
            return Err(SecretStoreError::NotFound { kind, provider });
        }
        let ciphertext = fs::read(path)?;
        let plaintext = decrypt(&self.key, &ciphertext)?;
        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }

    /// Remove a stored secret and its metadata sidecar. Succeeds (no-op) if
    /// nothing was stored.
    pub fn delete(&self, kind: SecretKind, provider: SecretProvider) -> Result<(), SecretStoreError> {
        let blob = self.blob_path(kind, provider);
        let meta = self.meta_path(kind, provider);
        if blob.exists() {
            fs::remove_file(blob)?;
        }
        if meta.exists() {
            fs::remove_file(meta)?;
        }
        Ok(())
    }

    /// Presence/metadata summary, never exposing the plaintext.
    pub fn status(&self, kind: SecretKind, provider: SecretProvider) -> SecretStatus {
        let present = self.blob_path(kind, provider).exists();
        let (metadata, updated_at) = match fs::read(self.meta_path(kind, provider)) {
            Ok(bytes) => match serde_json::from_slice::<StoredMetadata>(&bytes) {
                Ok(m) => (m.metadata, Some(m.updated_at)),
                Err(_) => (SecretMetadata::default(), None),
            },
            Err(_) => (SecretMetadata::default(), None),
        };
        SecretStatus {
            kind,
            provider,
            present,
            metadata,
            updated_at,
        }
    }

    /// Status for every provider of interest, used to render the settings
    /// surface in one call.
    pub fn all_statuses(&self) -> Vec<SecretStatus> {
        use SecretKind::*;
        use SecretProvider::*;
        [
            (AiKey, Anthropic),
            (AiKey, OpenAi),
            (AiKey, OpenRouter),
            (ForgeToken, Github),
            (ForgeToken, Gitlab),
        ]
        .into_iter()
        .map(|(kind, provider)| self.status(kind, provider))
        .collect()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("dir", &self.dir)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

pub fn forge_connection_method_from_str(s: &str) -> Option<ForgeConnectionMethod> {
    match s {
        "oauth" => Some(ForgeConnectionMethod::OAuth),
        "pat" | "personal_access_token" => Some(ForgeConnectionMethod::PersonalAccessToken),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedValidator(bool);

    #[async_trait::async_trait]
    impl SecretValidator for FixedValidator {
        async fn validate(
            &self,
            _kind: SecretKind,
            _provider: SecretProvider,
            _plaintext: &str,
        ) -> ValidationOutcome {
            ValidationOutcome {
                valid: self.0,
                detail: if self.0 { None } else { Some("rejected".into()) },
            }
        }
    }

    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn save_and_get_plaintext_roundtrip() {
        let dir = tmp_dir();
        let store = SecretStore::open(dir.path())
            .unwrap()
            .with_validator(Box::new(FixedValidator(true)));

        store
            .save(
                SecretKind::AiKey,
                SecretProvider::Anthropic,
                "sk-ant-test".to_string(),
                SecretMetadata::default(),
                false,
            )
            .await
            .unwrap();

        let plaintext = store
            .get_plaintext(SecretKind::AiKey, SecretProvider::Anthropic)
            .unwrap();
        assert_eq!(plaintext, "sk-ant-test");
    }

    #[tokio::test]
    async fn reject_invalid_refuses_to_save() {
        let dir = tmp_dir();
        let store = SecretStore::open(dir.path())
            .unwrap()
            .with_validator(Box::new(FixedValidator(false)));

        let result = store
            .save(
                SecretKind::ForgeToken,
                SecretProvider::Github,
                "bad-token".to_string(),
                SecretMetadata::default(),
                true,
            )
            .await;
        assert!(result.is_err());
        assert!(store
            .get_plaintext(SecretKind::ForgeToken, SecretProvider::Github)
            .is_err());
    }

    #[tokio::test]
    async fn delete_removes_secret() {
        let dir = tmp_dir();
        let store = SecretStore::open(dir.path())
            .unwrap()
            .with_validator(Box::new(FixedValidator(true)));

        store
            .save(
                SecretKind::AiKey,
                SecretProvider::OpenAi,
                "sk-test".to_string(),
                SecretMetadata::default(),
                false,
            )
            .await
            .unwrap();
        store.delete(SecretKind::AiKey, SecretProvider::OpenAi).unwrap();
        assert!(store
            .get_plaintext(SecretKind::AiKey, SecretProvider::OpenAi)
            .is_err());
    }

    #[test]
    fn status_reports_absent_by_default() {
        let dir = tmp_dir();
        let store = SecretStore::open(dir.path()).unwrap();
        let status = store.status(SecretKind::AiKey, SecretProvider::Anthropic);
        assert!(!status.present);
        assert!(status.updated_at.is_none());
    }

    #[tokio::test]
    async fn all_statuses_covers_every_known_provider() {
        let dir = tmp_dir();
        let store = SecretStore::open(dir.path())
            .unwrap()
            .with_validator(Box::new(FixedValidator(true)));
        store
            .save(
                SecretKind::AiKey,
                SecretProvider::Anthropic,
                "k".to_string(),
                SecretMetadata::default(),
                false,
            )
            .await
            .unwrap();
        let statuses = store.all_statuses();
        assert_eq!(statuses.len(), 5);
        assert!(statuses
            .iter()
            .find(|s| s.kind == SecretKind::AiKey && s.provider == SecretProvider::Anthropic)
            .unwrap()
            .present);
    }

    #[tokio::test]
    async fn key_persists_across_store_instances() {
        let dir = tmp_dir();
        {
            let store = SecretStore::open(dir.path())
                .unwrap()
                .with_validator(Box::new(FixedValidator(true)));
            store
                .save(
                    SecretKind::AiKey,
                    SecretProvider::OpenRouter,
                    "persisted".to_string(),
                    SecretMetadata::default(),
                    false,
                )
                .await
                .unwrap();
        }
        let store2 = SecretStore::open(dir.path()).unwrap();
        assert_eq!(
            store2
                .get_plaintext(SecretKind::AiKey, SecretProvider::OpenRouter)
                .unwrap(),
            "persisted"
        );
    }
}
