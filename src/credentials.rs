//! Per-user credential store.
//!
//! Maps `(user, model_name)` to an endpoint, a provider tag, and a sealed
//! API key. Sealing goes through an injected `KeyProtector`; plaintext keys
//! exist only in the return value of `resolve` and are never logged.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use uuid::Uuid;

use crate::state::{ConfiguredModel, Provider, SharedSessionStore, StoreError};

/// Sealing or unsealing failed. The message never carries key material.
#[derive(Debug, thiserror::Error)]
#[error("credential protection failed: {0}")]
pub struct CryptoError(pub String);

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result type for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Seals API keys before they touch disk and unseals them on resolve.
///
/// The concrete primitive is deployment-specific and injected at startup;
/// implementations must be deterministic inverses of each other.
pub trait KeyProtector: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String, CryptoError>;
    fn unseal(&self, sealed: &str) -> Result<String, CryptoError>;
}

/// Reversible-encoding protector used as the default wiring and in tests.
/// Deployments supply a real sealing primitive through the same trait.
pub struct EncodingProtector;

impl KeyProtector for EncodingProtector {
    fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(BASE64.encode(plaintext.as_bytes()))
    }

    fn unseal(&self, sealed: &str) -> Result<String, CryptoError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|_| CryptoError("stored key is not decodable".to_string()))?;
        String::from_utf8(bytes).map_err(|_| CryptoError("stored key is not UTF-8".to_string()))
    }
}

/// Fields accepted when registering or updating a model.
#[derive(Clone)]
pub struct ModelRegistration {
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    /// Plaintext key; sealed before persisting. `None` leaves the stored
    /// key untouched on update and absent on add.
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ModelRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistration")
            .field("model_name", &self.model_name)
            .field("display_name", &self.display_name)
            .field("endpoint", &self.endpoint)
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A resolved credential handed to the provider layer. `api_key = None`
/// means no key is stored; callers surface that as a configuration error.
#[derive(Clone)]
pub struct ResolvedCredential {
    pub endpoint: String,
    pub provider: Provider,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("ResolvedCredential")
            .field("endpoint", &self.endpoint)
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Shared reference to CredentialStore.
pub type SharedCredentialStore = Arc<CredentialStore>;

/// Credential store over the relational store plus an injected protector.
pub struct CredentialStore {
    store: SharedSessionStore,
    protector: Arc<dyn KeyProtector>,
}

impl CredentialStore {
    pub fn new(store: SharedSessionStore, protector: Arc<dyn KeyProtector>) -> Self {
        Self { store, protector }
    }

    /// Create a shared reference to this store.
    pub fn shared(self) -> SharedCredentialStore {
        Arc::new(self)
    }

    /// All models registered by one user.
    pub fn list(&self, user: &str) -> CredentialResult<Vec<ConfiguredModel>> {
        Ok(self.store.list_models(user)?)
    }

    /// Look up a registration by `(user, model_name)`.
    pub fn get(&self, user: &str, model_name: &str) -> CredentialResult<Option<ConfiguredModel>> {
        Ok(self.store.get_model(user, model_name)?)
    }

    /// Register a model for a user. Fails with a conflict if the user
    /// already has a model of that name.
    pub fn add(&self, user: &str, registration: ModelRegistration) -> CredentialResult<ConfiguredModel> {
        let encrypted_key = registration
            .api_key
            .as_deref()
            .map(|key| self.protector.seal(key))
            .transpose()?;

        let model = ConfiguredModel {
            id: Uuid::new_v4(),
            user_email: user.to_string(),
            model_name: registration.model_name,
            display_name: registration.display_name,
            endpoint: registration.endpoint,
            provider: registration.provider,
            encrypted_key,
            created_at: Utc::now(),
        };
        self.store.insert_model(&model)?;
        tracing::info!(user, model = %model.model_name, provider = %model.provider, "Model registered");
        Ok(model)
    }

    /// Update a registration. Renaming onto an existing `(user, model_name)`
    /// is a conflict; a `None` key keeps the stored key.
    pub fn update(
        &self,
        user: &str,
        id: Uuid,
        registration: ModelRegistration,
    ) -> CredentialResult<ConfiguredModel> {
        let existing = self
            .store
            .get_model_by_id(user, id)?
            .ok_or_else(|| StoreError::NotFound(format!("model {}", id)))?;

        let encrypted_key = match registration.api_key.as_deref() {
            Some(key) => Some(self.protector.seal(key)?),
            None => existing.encrypted_key,
        };

        let model = ConfiguredModel {
            id,
            user_email: user.to_string(),
            model_name: registration.model_name,
            display_name: registration.display_name,
            endpoint: registration.endpoint,
            provider: registration.provider,
            encrypted_key,
            created_at: existing.created_at,
        };
        self.store.update_model(&model)?;
        Ok(model)
    }

    /// Remove a registration by id.
    pub fn delete(&self, user: &str, id: Uuid) -> CredentialResult<()> {
        Ok(self.store.delete_model(user, id)?)
    }

    /// Resolve `(user, model_name)` to endpoint, provider, and plaintext
    /// key. Returns `Ok(None)` when the model is not registered at all.
    pub fn resolve(
        &self,
        user: &str,
        model_name: &str,
    ) -> CredentialResult<Option<ResolvedCredential>> {
        let Some(model) = self.store.get_model(user, model_name)? else {
            return Ok(None);
        };
        let api_key = model
            .encrypted_key
            .as_deref()
            .map(|sealed| self.protector.unseal(sealed))
            .transpose()?;
        Ok(Some(ResolvedCredential {
            endpoint: model.endpoint,
            provider: model.provider,
            api_key,
        }))
    }

    /// Of the given model names, those with no stored key for this user.
    pub fn missing_keys(&self, user: &str, models: &[String]) -> CredentialResult<Vec<String>> {
        let mut missing = Vec::new();
        for name in models {
            let has_key = self
                .store
                .get_model(user, name)?
                .map(|m| m.encrypted_key.is_some())
                .unwrap_or(false);
            if !has_key {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionStore;

    struct FailingProtector;

    impl KeyProtector for FailingProtector {
        fn seal(&self, _plaintext: &str) -> Result<String, CryptoError> {
            Err(CryptoError("seal unavailable".to_string()))
        }

        fn unseal(&self, _sealed: &str) -> Result<String, CryptoError> {
            Err(CryptoError("unseal unavailable".to_string()))
        }
    }

    fn credential_store() -> CredentialStore {
        let store = SessionStore::open_in_memory().unwrap().shared();
        CredentialStore::new(store, Arc::new(EncodingProtector))
    }

    fn registration(name: &str, key: Option<&str>) -> ModelRegistration {
        ModelRegistration {
            model_name: name.to_string(),
            display_name: None,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            provider: Provider::OpenAi,
            api_key: key.map(String::from),
        }
    }

    #[test]
    fn test_add_seals_key() {
        let creds = credential_store();
        let model = creds
            .add("a@x.io", registration("gpt-4o", Some("sk-secret")))
            .unwrap();
        // Stored form is sealed, not plaintext.
        assert_ne!(model.encrypted_key.as_deref(), Some("sk-secret"));

        let resolved = creds.resolve("a@x.io", "gpt-4o").unwrap().unwrap();
        assert_eq!(resolved.api_key.as_deref(), Some("sk-secret"));
    }

    #[test]
    fn test_duplicate_add_conflicts() {
        let creds = credential_store();
        creds.add("a@x.io", registration("gpt-4o", None)).unwrap();
        let err = creds
            .add("a@x.io", registration("gpt-4o", None))
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Store(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_per_user_isolation() {
        let creds = credential_store();
        creds
            .add("a@x.io", registration("gpt-4o", Some("key-a")))
            .unwrap();
        creds
            .add("b@x.io", registration("gpt-4o", Some("key-b")))
            .unwrap();

        let a = creds.resolve("a@x.io", "gpt-4o").unwrap().unwrap();
        let b = creds.resolve("b@x.io", "gpt-4o").unwrap().unwrap();
        assert_eq!(a.api_key.as_deref(), Some("key-a"));
        assert_eq!(b.api_key.as_deref(), Some("key-b"));

        // Deleting one user's entry leaves the other intact.
        let a_model = creds.get("a@x.io", "gpt-4o").unwrap().unwrap();
        creds.delete("a@x.io", a_model.id).unwrap();
        assert!(creds.resolve("a@x.io", "gpt-4o").unwrap().is_none());
        assert!(creds.resolve("b@x.io", "gpt-4o").unwrap().is_some());
    }

    #[test]
    fn test_update_keeps_key_when_absent() {
        let creds = credential_store();
        let model = creds
            .add("a@x.io", registration("gpt-4o", Some("sk-secret")))
            .unwrap();

        let mut update = registration("gpt-4o", None);
        update.display_name = Some("GPT-4o".to_string());
        creds.update("a@x.io", model.id, update).unwrap();

        let resolved = creds.resolve("a@x.io", "gpt-4o").unwrap().unwrap();
        assert_eq!(resolved.api_key.as_deref(), Some("sk-secret"));
    }

    #[test]
    fn test_resolve_without_key() {
        let creds = credential_store();
        creds.add("a@x.io", registration("gpt-4o", None)).unwrap();
        let resolved = creds.resolve("a@x.io", "gpt-4o").unwrap().unwrap();
        assert!(resolved.api_key.is_none());
        assert!(creds.resolve("a@x.io", "unknown").unwrap().is_none());
    }

    #[test]
    fn test_missing_keys() {
        let creds = credential_store();
        creds
            .add("a@x.io", registration("gpt-4o", Some("k")))
            .unwrap();
        creds.add("a@x.io", registration("grok-3", None)).unwrap();

        let missing = creds
            .missing_keys(
                "a@x.io",
                &[
                    "gpt-4o".to_string(),
                    "grok-3".to_string(),
                    "claude-4".to_string(),
                ],
            )
            .unwrap();
        assert_eq!(missing, vec!["grok-3", "claude-4"]);
    }

    #[test]
    fn test_crypto_error_propagates() {
        let store = SessionStore::open_in_memory().unwrap().shared();
        let creds = CredentialStore::new(store, Arc::new(FailingProtector));
        let err = creds
            .add("a@x.io", registration("gpt-4o", Some("sk")))
            .unwrap_err();
        assert!(matches!(err, CredentialError::Crypto(_)));
    }

    #[test]
    fn test_debug_redacts_key() {
        let resolved = ResolvedCredential {
            endpoint: "https://x".to_string(),
            provider: Provider::OpenAi,
            api_key: Some("sk-secret".to_string()),
        };
        let rendered = format!("{:?}", resolved);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("redacted"));
    }
}
