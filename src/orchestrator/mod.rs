//! Orchestrator — drives the Creator→Reviewers deliberation loop.
//!
//! One spawned task per running session. Each iteration streams a Creator
//! draft, fans the draft out to every reviewer in configuration order,
//! persists messages and the feedback round, and publishes events. Stop
//! conditions are evaluated in priority order: user stop, final marker,
//! reviewer consensus (with the one-more-iteration rule), iteration budget.

pub mod approval;
pub mod prompts;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestrationConfig;
use crate::credentials::{CredentialError, SharedCredentialStore};
use crate::events::{SessionEvent, SharedEventHub};
use crate::provider::router::SharedProviderRouter;
use crate::provider::{ChunkEvent, CompletionRequest};
use crate::state::{
    FeedbackRound, Message, MessageRole, ReviewerSummary, RunMode, Session, SessionStatus,
    SharedSessionStore, StopReason, StoreError, CREATOR_AUTHOR, USER_AUTHOR,
};

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Missing API key(s) for models: {0}")]
    MissingKeys(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Shared reference to Orchestrator.
pub type SharedOrchestrator = Arc<Orchestrator>;

/// Post-completion re-iteration request.
#[derive(Debug, Clone, Deserialize)]
pub struct ReiterateRequest {
    pub comments: String,
    pub tone: Option<String>,
    pub length: Option<String>,
    pub audience: Option<String>,
    pub max_additional_iterations: u32,
}

/// Outcome of one iteration, as seen by the session loop.
enum StepResult {
    /// Keep iterating.
    Continue,
    /// Step mode paused after the iteration.
    Paused,
    /// A stop condition completed the session.
    Completed,
    /// Cancellation was observed; the session is Stopped.
    Cancelled,
    /// A provider failure ended the session in Error.
    Failed,
}

/// Result of streaming one persona's message.
enum PersonaStream {
    Complete(Message),
    /// Cancelled mid-stream; the partial message (if any chunk arrived) is
    /// already persisted.
    Cancelled,
    Failed(String),
}

/// The deliberation loop coordinator.
pub struct Orchestrator {
    store: SharedSessionStore,
    credentials: SharedCredentialStore,
    router: SharedProviderRouter,
    hub: SharedEventHub,
    config: OrchestrationConfig,
    /// Cancellation tokens for running sessions; entries are removed on
    /// terminal transitions.
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        store: SharedSessionStore,
        credentials: SharedCredentialStore,
        router: SharedProviderRouter,
        hub: SharedEventHub,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            router,
            hub,
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Create a shared reference to this orchestrator.
    pub fn shared(self) -> SharedOrchestrator {
        Arc::new(self)
    }

    /// Whether a session currently has a live loop task.
    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.cancellations
            .lock()
            .expect("cancellation map lock poisoned")
            .contains_key(&session_id)
    }

    fn install_token(&self, session_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .expect("cancellation map lock poisoned")
            .insert(session_id, token.clone());
        token
    }

    fn remove_token(&self, session_id: Uuid) {
        self.cancellations
            .lock()
            .expect("cancellation map lock poisoned")
            .remove(&session_id);
    }

    fn running_token(&self, session_id: Uuid) -> Option<CancellationToken> {
        self.cancellations
            .lock()
            .expect("cancellation map lock poisoned")
            .get(&session_id)
            .cloned()
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Start the loop for a session. Fails fast when any referenced model
    /// lacks a stored API key for the calling user; no state changes then.
    pub async fn start(
        self: &Arc<Self>,
        user: &str,
        session_id: Uuid,
        mode: RunMode,
    ) -> OrchestratorResult<()> {
        let mut session = self.store.get_session(session_id)?;

        if session.status == SessionStatus::Running || self.is_running(session_id) {
            return Err(OrchestratorError::InvalidState(format!(
                "session {} is already running",
                session_id
            )));
        }
        if !session.status.can_start() {
            return Err(OrchestratorError::InvalidState(format!(
                "session {} is {}; it cannot be started",
                session_id, session.status
            )));
        }

        let missing = self
            .credentials
            .missing_keys(user, &session.referenced_models())?;
        if !missing.is_empty() {
            return Err(OrchestratorError::MissingKeys(missing.join(", ")));
        }

        session.run_mode = mode;
        session.status = SessionStatus::Running;
        session.stop_reason = StopReason::None;
        self.store.update_session(&mut session)?;

        let token = self.install_token(session_id);
        self.hub.publish(SessionEvent::SessionStarted {
            session_id,
            timestamp: Utc::now(),
        });

        info!(%session_id, mode = %session.run_mode, "Session loop starting");
        let orchestrator = self.clone();
        let user = user.to_string();
        tokio::spawn(async move {
            orchestrator.run_loop(&user, session_id, token).await;
        });
        Ok(())
    }

    /// Signal a user stop. Idempotent: stopping a terminal session is a
    /// no-op, a running loop drains its in-flight stream, and a paused or
    /// never-started session transitions directly.
    pub fn stop(&self, session_id: Uuid) -> OrchestratorResult<()> {
        if let Some(token) = self.running_token(session_id) {
            token.cancel();
            return Ok(());
        }

        let mut session = self.store.get_session(session_id)?;
        if session.status.is_terminal() {
            return Ok(());
        }
        self.finish_stopped(&mut session)?;
        Ok(())
    }

    /// Cancel (if running) and delete a session; messages and feedback
    /// rounds cascade.
    pub fn delete(&self, session_id: Uuid) -> OrchestratorResult<()> {
        if let Some(token) = self.running_token(session_id) {
            token.cancel();
        }
        self.remove_token(session_id);
        self.store.delete_session(session_id)?;
        self.hub.remove_session(session_id);
        Ok(())
    }

    /// Remove all messages a persona authored in a session. Counters and
    /// status are untouched.
    pub fn reset_memory(&self, session_id: Uuid, persona_id: &str) -> OrchestratorResult<()> {
        let session = self.store.get_session(session_id)?;
        let known = persona_id == CREATOR_AUTHOR
            || persona_id == USER_AUTHOR
            || session.reviewer(persona_id).is_some();
        if !known {
            return Err(OrchestratorError::Validation(format!(
                "unknown persona: {}",
                persona_id
            )));
        }

        let removed = self.store.delete_messages_by_author(session_id, persona_id)?;
        info!(%session_id, persona_id, removed, "Persona memory reset");
        self.hub.publish(SessionEvent::PersonaMemoryReset {
            session_id,
            persona_id: persona_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Re-open a completed session with user feedback: extends the
    /// iteration budget, bumps the feedback version, queues the synthesized
    /// instruction for the next Creator prompt, and resumes the loop.
    pub async fn iterate_with_feedback(
        self: &Arc<Self>,
        user: &str,
        session_id: Uuid,
        request: ReiterateRequest,
    ) -> OrchestratorResult<Session> {
        if request.comments.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "comments must not be empty".to_string(),
            ));
        }
        if !(1..=3).contains(&request.max_additional_iterations) {
            return Err(OrchestratorError::Validation(
                "max_additional_iterations must be between 1 and 3".to_string(),
            ));
        }

        let mut session = self.store.get_session(session_id)?;
        if session.status != SessionStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "session {} is {}; only completed sessions can re-iterate",
                session_id, session.status
            )));
        }

        let missing = self
            .credentials
            .missing_keys(user, &session.referenced_models())?;
        if !missing.is_empty() {
            return Err(OrchestratorError::MissingKeys(missing.join(", ")));
        }

        session.pending_user_instruction = Some(prompts::reiterate_instruction(
            &request.comments,
            request.tone.as_deref(),
            request.length.as_deref(),
            request.audience.as_deref(),
        ));
        session.max_iterations += request.max_additional_iterations;
        session.feedback_version += 1;
        session.status = SessionStatus::Running;
        session.stop_reason = StopReason::None;
        session.needs_final_iteration = false;
        self.store.update_session(&mut session)?;

        let token = self.install_token(session_id);
        self.hub.publish(SessionEvent::SessionStarted {
            session_id,
            timestamp: Utc::now(),
        });

        info!(
            %session_id,
            feedback_version = session.feedback_version,
            max_iterations = session.max_iterations,
            "Session re-opened with user feedback"
        );
        let orchestrator = self.clone();
        let user = user.to_string();
        tokio::spawn(async move {
            orchestrator.run_loop(&user, session_id, token).await;
        });
        Ok(session)
    }

    // =========================================================================
    // The loop
    // =========================================================================

    async fn run_loop(self: &Arc<Self>, user: &str, session_id: Uuid, token: CancellationToken) {
        if let Err(e) = self.drive(user, session_id, &token).await {
            match &e {
                OrchestratorError::Store(StoreError::NotFound(_)) => {
                    // Session deleted out from under the loop.
                    debug!(%session_id, "Session disappeared mid-loop");
                    self.remove_token(session_id);
                }
                _ => {
                    error!(%session_id, error = %e, "Session loop failed");
                    match self.store.get_session(session_id) {
                        Ok(mut session) => {
                            let _ = self.finish_error(&mut session, &e.to_string());
                        }
                        Err(_) => self.remove_token(session_id),
                    }
                }
            }
        }
    }

    async fn drive(
        &self,
        user: &str,
        session_id: Uuid,
        token: &CancellationToken,
    ) -> OrchestratorResult<()> {
        loop {
            let mut session = self.store.get_session(session_id)?;

            if token.is_cancelled() {
                self.finish_stopped(&mut session)?;
                return Ok(());
            }
            if session.status != SessionStatus::Running {
                // Stopped or mutated externally; nothing left to drive.
                self.remove_token(session_id);
                return Ok(());
            }

            // Stop condition 4: iteration budget, unless the consensus rule
            // owes the Creator one more pass.
            if !session.needs_final_iteration
                && session.current_iteration >= session.max_iterations
            {
                self.complete(&mut session, StopReason::MaxIterationsReached)?;
                return Ok(());
            }

            match self.run_iteration(user, &mut session, token).await? {
                StepResult::Continue => continue,
                StepResult::Paused
                | StepResult::Completed
                | StepResult::Cancelled
                | StepResult::Failed => return Ok(()),
            }
        }
    }

    async fn run_iteration(
        &self,
        user: &str,
        session: &mut Session,
        token: &CancellationToken,
    ) -> OrchestratorResult<StepResult> {
        // Whether this pass is the extra iteration owed after consensus.
        let is_final_pass = session.needs_final_iteration;

        let iteration = session.current_iteration + 1;
        session.current_iteration = iteration;
        self.store.update_session(session)?;
        self.hub.publish(SessionEvent::IterationStarted {
            session_id: session.id,
            iteration,
            timestamp: Utc::now(),
        });
        debug!(session_id = %session.id, iteration, is_final_pass, "Iteration started");

        // Creator turn.
        let history = self.store.list_messages(session.id)?;
        let creator_messages =
            prompts::build_creator_messages(session, &history, iteration, &self.config);
        if let Some(instruction) = session.pending_user_instruction.take() {
            // Keep the consumed instruction in the transcript so later
            // context windows still see it.
            self.store.insert_message(&Message {
                message_id: Uuid::new_v4(),
                session_id: session.id,
                role: MessageRole::User,
                author: USER_AUTHOR.to_string(),
                iteration,
                content: instruction,
                model_used: String::new(),
                reviewer_display_name: None,
                created_at: Utc::now(),
            })?;
            self.store.update_session(session)?;
        }

        let request = CompletionRequest::from_persona(&session.creator, creator_messages);
        let creator_message = match self
            .stream_persona(user, session, CREATOR_AUTHOR, None, request, iteration, token)
            .await?
        {
            PersonaStream::Complete(message) => message,
            PersonaStream::Cancelled => {
                self.finish_stopped(session)?;
                return Ok(StepResult::Cancelled);
            }
            PersonaStream::Failed(error) => {
                self.finish_error(session, &error)?;
                return Ok(StepResult::Failed);
            }
        };

        // Stop condition 2: final marker short-circuits the reviewers.
        if !session.stop_marker.is_empty() {
            if let Some(idx) = creator_message.content.find(&session.stop_marker) {
                let after = &creator_message.content[idx + session.stop_marker.len()..];
                session.final_content = Some(after.trim().to_string());
                self.complete(session, StopReason::FinalMarkerDetected)?;
                return Ok(StepResult::Completed);
            }
        }

        // Stop condition 3, second half: the extra iteration only needs the
        // Creator to fold in the final feedback.
        if is_final_pass {
            session.final_content = Some(creator_message.content.clone());
            session.needs_final_iteration = false;
            self.hub.publish(SessionEvent::IterationCompleted {
                session_id: session.id,
                iteration,
                timestamp: Utc::now(),
            });
            self.complete(session, StopReason::ReviewerApproved)?;
            return Ok(StepResult::Completed);
        }

        // Reviewer turns, in configuration order.
        let mut summaries = Vec::with_capacity(session.reviewers.len());
        for reviewer in session.reviewers.clone() {
            let own_history = self
                .store
                .list_messages_by_author(session.id, &reviewer.id)?;
            let reviewer_messages = prompts::build_reviewer_messages(
                session,
                &reviewer,
                &own_history,
                &creator_message.content,
                &self.config,
            );
            let request =
                CompletionRequest::from_persona(&reviewer.persona, reviewer_messages);
            match self
                .stream_persona(
                    user,
                    session,
                    &reviewer.id,
                    Some(&reviewer.display_name),
                    request,
                    iteration,
                    token,
                )
                .await?
            {
                PersonaStream::Complete(message) => summaries.push(ReviewerSummary {
                    reviewer_id: reviewer.id.clone(),
                    reviewer_name: reviewer.display_name.clone(),
                    approved: approval::is_approved(&message.content),
                    feedback: message.content,
                }),
                PersonaStream::Cancelled => {
                    self.finish_stopped(session)?;
                    return Ok(StepResult::Cancelled);
                }
                PersonaStream::Failed(error) => {
                    self.finish_error(session, &error)?;
                    return Ok(StepResult::Failed);
                }
            }
        }

        let round = FeedbackRound::new(
            session.id,
            iteration,
            creator_message.content.clone(),
            summaries,
        );
        let all_approved = round.all_reviewers_approved;
        self.store.insert_feedback_round(&round)?;

        // Stop condition 3, first half: consensus arms the one-more rule.
        if session.stop_on_reviewer_approved && all_approved {
            session.needs_final_iteration = true;
            self.store.update_session(session)?;
            info!(session_id = %session.id, iteration, "All reviewers approved; running one final iteration");
        }

        self.hub.publish(SessionEvent::IterationCompleted {
            session_id: session.id,
            iteration,
            timestamp: Utc::now(),
        });

        if session.run_mode == RunMode::Step {
            session.status = SessionStatus::Paused;
            self.store.update_session(session)?;
            self.remove_token(session.id);
            self.hub.publish(SessionEvent::SessionPaused {
                session_id: session.id,
                timestamp: Utc::now(),
            });
            return Ok(StepResult::Paused);
        }

        Ok(StepResult::Continue)
    }

    /// Stream one persona's completion: publish chunk events as they
    /// arrive, accumulate the content, and persist the finished message.
    /// On cancellation or provider failure the partial content (if any
    /// chunk arrived) is persisted before returning.
    async fn stream_persona(
        &self,
        user: &str,
        session: &Session,
        persona_id: &str,
        display_name: Option<&str>,
        request: CompletionRequest,
        iteration: u32,
        token: &CancellationToken,
    ) -> OrchestratorResult<PersonaStream> {
        let session_id = session.id;
        let message_id = Uuid::new_v4();
        let model_used = request.model.clone();

        let open = self.router.stream_chat(user, &request);
        tokio::pin!(open);
        let mut stream = tokio::select! {
            _ = token.cancelled() => return Ok(PersonaStream::Cancelled),
            opened = &mut open => match opened {
                Ok(stream) => stream,
                Err(e) => return Ok(PersonaStream::Failed(e.to_string())),
            },
        };

        self.hub.publish(SessionEvent::MessageStarted {
            session_id,
            message_id,
            persona_id: persona_id.to_string(),
            iteration,
            timestamp: Utc::now(),
        });

        let mut content = String::new();
        let persist = |content: String| -> OrchestratorResult<Message> {
            let message = Message {
                message_id,
                session_id,
                role: MessageRole::Assistant,
                author: persona_id.to_string(),
                iteration,
                content,
                model_used: model_used.clone(),
                reviewer_display_name: display_name.map(String::from),
                created_at: Utc::now(),
            };
            self.store.insert_message(&message)?;
            self.hub.publish(SessionEvent::MessageCompleted {
                session_id,
                message_id,
                content: message.content.clone(),
                timestamp: Utc::now(),
            });
            Ok(message)
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if !content.is_empty() {
                        persist(content)?;
                    }
                    return Ok(PersonaStream::Cancelled);
                }
                item = stream.next() => match item {
                    Some(Ok(ChunkEvent::TokenDelta(delta))) => {
                        content.push_str(&delta);
                        self.hub.publish(SessionEvent::MessageChunk {
                            session_id,
                            message_id,
                            delta,
                            timestamp: Utc::now(),
                        });
                    }
                    Some(Ok(ChunkEvent::FinishReason(reason))) => {
                        debug!(%session_id, persona_id, reason, "Stream finished");
                    }
                    Some(Ok(ChunkEvent::Usage(usage))) => {
                        debug!(
                            %session_id,
                            persona_id,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Stream usage"
                        );
                    }
                    Some(Err(e)) => {
                        warn!(%session_id, persona_id, error = %e, "Stream failed mid-flight");
                        if !content.is_empty() {
                            persist(content)?;
                        }
                        return Ok(PersonaStream::Failed(e.to_string()));
                    }
                    None => break,
                },
            }
        }

        Ok(PersonaStream::Complete(persist(content)?))
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    fn complete(&self, session: &mut Session, reason: StopReason) -> OrchestratorResult<()> {
        if session.final_content.is_none() {
            session.final_content = self
                .store
                .latest_creator_message(session.id)?
                .map(|m| m.content);
        }
        session.status = SessionStatus::Completed;
        session.stop_reason = reason;
        session.needs_final_iteration = false;
        self.store.update_session(session)?;
        self.remove_token(session.id);
        info!(session_id = %session.id, reason = %reason, "Session completed");
        self.hub.publish(SessionEvent::SessionCompleted {
            session_id: session.id,
            final_content: session.final_content.clone().unwrap_or_default(),
            stop_reason: reason,
            timestamp: Utc::now(),
        });
        // Terminal state: subscribers drain the completion event, then see
        // the channel close. No replay is offered, so nothing is lost.
        self.hub.remove_session(session.id);
        Ok(())
    }

    fn finish_stopped(&self, session: &mut Session) -> OrchestratorResult<()> {
        session.final_content = self
            .store
            .latest_creator_message(session.id)?
            .map(|m| m.content);
        session.status = SessionStatus::Stopped;
        session.stop_reason = StopReason::UserStopped;
        self.store.update_session(session)?;
        self.remove_token(session.id);
        info!(session_id = %session.id, "Session stopped by user");
        self.hub.publish(SessionEvent::SessionStopped {
            session_id: session.id,
            reason: StopReason::UserStopped,
            timestamp: Utc::now(),
        });
        self.hub.remove_session(session.id);
        Ok(())
    }

    fn finish_error(&self, session: &mut Session, message: &str) -> OrchestratorResult<()> {
        session.status = SessionStatus::Error;
        session.stop_reason = StopReason::Error;
        self.store.update_session(session)?;
        self.remove_token(session.id);
        error!(session_id = %session.id, error = message, "Session failed");
        self.hub.publish(SessionEvent::SessionError {
            session_id: session.id,
            error: message.to_string(),
            timestamp: Utc::now(),
        });
        self.hub.remove_session(session.id);
        Ok(())
    }
}
