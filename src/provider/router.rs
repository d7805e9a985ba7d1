//! Provider router — resolves `(user, model)` to a configured endpoint and
//! dispatches to the adapter for its provider tag.

use std::sync::Arc;

use crate::credentials::SharedCredentialStore;
use crate::resilience::RetryPolicy;
use crate::state::Provider;

use super::{ChunkStream, CompletionBackend, CompletionRequest, EndpointConfig, ProviderError};

/// Shared reference to ProviderRouter.
pub type SharedProviderRouter = Arc<ProviderRouter>;

/// Routes completion requests through the caller's credential roster to the
/// right wire dialect, retrying transient failures.
pub struct ProviderRouter {
    credentials: SharedCredentialStore,
    backend: Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
}

impl ProviderRouter {
    pub fn new(
        credentials: SharedCredentialStore,
        backend: Arc<dyn CompletionBackend>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            credentials,
            backend,
            retry,
        }
    }

    /// Create a shared reference to this router.
    pub fn shared(self) -> SharedProviderRouter {
        Arc::new(self)
    }

    /// Resolve the caller's configuration for `request.model` and open a
    /// completion stream. Fails fast with `NotConfigured` when the model is
    /// unknown or has no key, and `NotImplemented` for dialects without an
    /// adapter.
    pub async fn stream_chat(
        &self,
        user: &str,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let resolved = self
            .credentials
            .resolve(user, &request.model)
            .map_err(|e| ProviderError::Credential(e.to_string()))?
            .ok_or_else(|| ProviderError::NotConfigured(request.model.clone()))?;

        let api_key = resolved
            .api_key
            .ok_or_else(|| ProviderError::NotConfigured(request.model.clone()))?;

        match resolved.provider {
            Provider::OpenAi | Provider::Azure | Provider::XAi => {}
            other @ (Provider::Google | Provider::Anthropic) => {
                return Err(ProviderError::NotImplemented(other));
            }
        }

        let endpoint = EndpointConfig {
            endpoint: resolved.endpoint,
            provider: resolved.provider,
            api_key,
        };

        self.retry
            .run(&request.model, || {
                self.backend.stream_completion(&endpoint, request)
            })
            .await
    }
}
