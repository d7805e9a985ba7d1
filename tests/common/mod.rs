//! Shared fixtures for orchestration integration tests: a deterministic
//! scripted backend (no network) and session plumbing.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::broadcast;

use atelier::config::OrchestrationConfig;
use atelier::credentials::{CredentialStore, EncodingProtector, ModelRegistration};
use atelier::events::{EventHub, SessionEvent, SharedEventHub};
use atelier::orchestrator::Orchestrator;
use atelier::provider::router::ProviderRouter;
use atelier::provider::{
    ChunkEvent, ChunkStream, CompletionBackend, CompletionRequest, EndpointConfig, ProviderError,
};
use atelier::resilience::RetryPolicy;
use atelier::state::{
    PersonaConfig, Provider, ReviewerConfig, RunMode, Session, SessionStore,
    SharedSessionStore,
};
use atelier::{SharedCredentialStore, SharedOrchestrator};

pub const USER: &str = "user@example.com";

/// One scripted persona turn, keyed by model name in the backend.
pub enum Turn {
    /// Stream the text as two deltas, then finish normally.
    Text(String),
    /// Stream one delta, then never produce another chunk.
    Hang(String),
    /// Fail the call with a non-transient API error.
    Fail(u16),
}

pub fn text(content: &str) -> Turn {
    Turn::Text(content.to_string())
}

/// Deterministic backend: each model name has a queue of scripted turns.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Turn>>>,
    /// Every request the orchestrator issued, in call order.
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<(&str, Vec<Turn>)>) -> Self {
        let scripts = scripts
            .into_iter()
            .map(|(model, turns)| (model.to_string(), turns.into_iter().collect()))
            .collect();
        Self {
            scripts: Mutex::new(scripts),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests issued for one model, in order.
    pub fn requests_for(&self, model: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream_completion(
        &self,
        _endpoint: &EndpointConfig,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());

        let turn = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.model)
            .and_then(|queue| queue.pop_front());

        match turn {
            Some(Turn::Text(content)) => {
                let mut split = content.len() / 2;
                while !content.is_char_boundary(split) {
                    split -= 1;
                }
                let (head, tail) = content.split_at(split);
                let events: Vec<Result<ChunkEvent, ProviderError>> = vec![
                    Ok(ChunkEvent::TokenDelta(head.to_string())),
                    Ok(ChunkEvent::TokenDelta(tail.to_string())),
                    Ok(ChunkEvent::FinishReason("stop".to_string())),
                ];
                Ok(Box::pin(stream::iter(events)))
            }
            Some(Turn::Hang(prefix)) => {
                let head =
                    stream::iter(vec![Ok::<_, ProviderError>(ChunkEvent::TokenDelta(prefix))]);
                Ok(Box::pin(head.chain(stream::pending())))
            }
            Some(Turn::Fail(status)) => Err(ProviderError::Api {
                status,
                body: "scripted failure".to_string(),
            }),
            None => Err(ProviderError::Api {
                status: 401,
                body: format!("script exhausted for {}", request.model),
            }),
        }
    }
}

pub struct Fixture {
    pub store: SharedSessionStore,
    pub credentials: SharedCredentialStore,
    pub hub: SharedEventHub,
    pub orchestrator: SharedOrchestrator,
    pub backend: Arc<ScriptedBackend>,
}

/// Build the full stack over an in-memory store and the scripted backend.
/// Every scripted model gets a stored API key.
pub fn fixture(scripts: Vec<(&str, Vec<Turn>)>) -> Fixture {
    let models: Vec<String> = scripts.iter().map(|(m, _)| m.to_string()).collect();
    let store = SessionStore::open_in_memory().unwrap().shared();
    let credentials =
        CredentialStore::new(store.clone(), Arc::new(EncodingProtector)).shared();
    for model in &models {
        register_model(&credentials, model, Some("test-key"));
    }

    let backend = Arc::new(ScriptedBackend::new(scripts));
    let router = ProviderRouter::new(
        credentials.clone(),
        backend.clone(),
        RetryPolicy::new(0, Duration::from_millis(1)),
    )
    .shared();
    let hub = EventHub::default().shared();
    let orchestrator = Orchestrator::new(
        store.clone(),
        credentials.clone(),
        router,
        hub.clone(),
        OrchestrationConfig::default(),
    )
    .shared();

    Fixture {
        store,
        credentials,
        hub,
        orchestrator,
        backend,
    }
}

pub fn register_model(credentials: &CredentialStore, model: &str, key: Option<&str>) {
    credentials
        .add(
            USER,
            ModelRegistration {
                model_name: model.to_string(),
                display_name: None,
                endpoint: "https://stub.invalid/v1/chat/completions".to_string(),
                provider: Provider::OpenAi,
                api_key: key.map(String::from),
            },
        )
        .unwrap();
}

pub fn persona(model: &str) -> PersonaConfig {
    PersonaConfig {
        root_prompt: format!("You are the {} persona.", model),
        model_name: model.to_string(),
        ..Default::default()
    }
}

pub fn reviewer(id: &str, name: &str, model: &str) -> ReviewerConfig {
    ReviewerConfig {
        id: id.to_string(),
        display_name: name.to_string(),
        persona: persona(model),
    }
}

/// Create and persist a session with the given roster.
pub fn make_session(
    fixture: &Fixture,
    topic: &str,
    max_iterations: u32,
    stop_on_reviewer_approved: bool,
    reviewers: Vec<ReviewerConfig>,
) -> Session {
    let session = Session::new(
        "test session".to_string(),
        topic.to_string(),
        max_iterations,
        "FINAL:".to_string(),
        stop_on_reviewer_approved,
        RunMode::Auto,
        persona("creator-model"),
        reviewers,
    );
    session.validate().unwrap();
    fixture.store.create_session(&session).unwrap();
    session
}

/// Collect events until a terminal session event arrives (5s budget each).
pub async fn collect_until_terminal(
    rx: &mut broadcast::Receiver<SessionEvent>,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a terminal session event")
            .expect("event channel closed");
        let terminal = matches!(
            event,
            SessionEvent::SessionCompleted { .. }
                | SessionEvent::SessionStopped { .. }
                | SessionEvent::SessionError { .. }
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Wait for one specific event kind, discarding others.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}
