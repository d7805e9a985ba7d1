//! Atelier — Creator-Reviewer deliberation loop orchestrator.
//!
//! A session pairs one Creator persona with one or more reviewer personas,
//! each backed by an independently configured LLM endpoint. Every iteration
//! the Creator streams a draft, the reviewers critique it, and the critiques
//! feed the next draft until a convergence condition fires: an explicit
//! stop marker in the draft, unanimous reviewer sign-off (plus one closing
//! iteration), the iteration budget, or a user stop. Tokens stream to
//! subscribed clients in real time over WebSockets.
//!
//! Module map:
//! - [`state`]: domain types and the SQLite-backed store
//! - [`credentials`]: per-user model roster with sealed API keys
//! - [`provider`]: streaming adapters for the supported wire dialects
//! - [`resilience`]: retry policy for transient provider failures
//! - [`events`]: session event types and the pub/sub hub
//! - [`orchestrator`]: the iteration state machine
//! - [`server`]: HTTP request surface and WebSocket event transport

pub mod config;
pub mod credentials;
pub mod events;
pub mod orchestrator;
pub mod provider;
pub mod resilience;
pub mod server;
pub mod state;

// Re-export key state types
pub use state::{
    ConfiguredModel, FeedbackRound, Message, MessageRole, PersonaConfig, Provider,
    ReviewerConfig, ReviewerSummary, RunMode, Session, SessionStatus, SessionStore,
    SharedSessionStore, StopReason, StoreError, CREATOR_AUTHOR,
};

// Re-export credential types
pub use credentials::{
    CredentialError, CredentialStore, CryptoError, EncodingProtector, KeyProtector,
    ModelRegistration, ResolvedCredential, SharedCredentialStore,
};

// Re-export provider types
pub use provider::router::{ProviderRouter, SharedProviderRouter};
pub use provider::{
    ChatMessage, ChatRole, ChunkEvent, ChunkStream, CompletionBackend, CompletionRequest,
    EndpointConfig, ProviderError, TokenUsage,
};

// Re-export event types
pub use events::{EventHub, SessionEvent, SharedEventHub};

// Re-export orchestrator types
pub use orchestrator::{
    Orchestrator, OrchestratorError, ReiterateRequest, SharedOrchestrator,
};

// Re-export configuration
pub use config::{AppConfig, ConfigError, ModelPreset, OrchestrationConfig};

// Re-export resilience types
pub use resilience::RetryPolicy;
