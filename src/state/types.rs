//! Domain types — sessions, personas, messages, feedback rounds, and the
//! per-user model roster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author label for the drafting persona. Reviewers are addressed by their
/// configured reviewer id.
pub const CREATOR_AUTHOR: &str = "Creator";

/// Author label for user-injected instructions (post-completion feedback).
pub const USER_AUTHOR: &str = "User";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created but not started.
    Created,
    /// The deliberation loop is executing.
    Running,
    /// Paused between iterations (step mode).
    Paused,
    /// A stop condition fired — the draft converged.
    Completed,
    /// The user stopped the session.
    Stopped,
    /// Unrecoverable failure.
    Error,
}

impl SessionStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }

    /// Whether the loop may be (re)started from this status.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// Why a session left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No stop condition has fired yet.
    None,
    /// The Creator draft contained the session's stop marker.
    FinalMarkerDetected,
    /// The user requested a stop.
    UserStopped,
    /// The iteration budget ran out.
    MaxIterationsReached,
    /// Every reviewer signed off and the extra iteration completed.
    ReviewerApproved,
    /// An unrecoverable failure ended the session.
    Error,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::FinalMarkerDetected => write!(f, "final_marker_detected"),
            Self::UserStopped => write!(f, "user_stopped"),
            Self::MaxIterationsReached => write!(f, "max_iterations_reached"),
            Self::ReviewerApproved => write!(f, "reviewer_approved"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "final_marker_detected" => Ok(Self::FinalMarkerDetected),
            "user_stopped" => Ok(Self::UserStopped),
            "max_iterations_reached" => Ok(Self::MaxIterationsReached),
            "reviewer_approved" => Ok(Self::ReviewerApproved),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown stop reason: {}", other)),
        }
    }
}

/// Whether the loop runs to completion or pauses after each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Iterate until a stop condition fires.
    Auto,
    /// Pause after each completed iteration.
    Step,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Step => write!(f, "step"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "step" => Ok(Self::Step),
            other => Err(format!("unknown run mode: {}", other)),
        }
    }
}

/// Sampling configuration for a persona. Snapshotted into the session at
/// creation; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// System prompt establishing the persona.
    pub root_prompt: String,
    /// Model name to resolve against the caller's roster.
    pub model_name: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            root_prompt: String::new(),
            model_name: String::new(),
            temperature: 0.7,
            max_output_tokens: 1024,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

impl PersonaConfig {
    /// Validate sampling parameter ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("model_name must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature must be in [0, 2], got {}",
                self.temperature
            ));
        }
        if self.max_output_tokens == 0 {
            return Err("max_output_tokens must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("top_p must be in [0, 1], got {}", self.top_p));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(format!(
                "presence_penalty must be in [-2, 2], got {}",
                self.presence_penalty
            ));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(format!(
                "frequency_penalty must be in [-2, 2], got {}",
                self.frequency_penalty
            ));
        }
        Ok(())
    }
}

/// A reviewer persona: sampling config plus a stable identity within the
/// session. The configured order defines reviewer order across iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    /// Unique within the session; used as the message author label.
    pub id: String,
    pub display_name: String,
    pub persona: PersonaConfig,
}

/// A persisted deliberation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub stop_reason: StopReason,
    pub max_iterations: u32,
    pub current_iteration: u32,
    /// Starts at 1; incremented on each post-completion re-iteration.
    pub feedback_version: u32,
    /// Literal substring whose first occurrence in a Creator draft completes
    /// the session.
    pub stop_marker: String,
    pub stop_on_reviewer_approved: bool,
    pub run_mode: RunMode,
    /// Free text; may be empty.
    pub topic: String,
    pub final_content: Option<String>,
    /// Set when all reviewers approve; the loop then runs one more iteration
    /// even past `max_iterations`.
    pub needs_final_iteration: bool,
    /// Synthesized user instruction consumed by the next Creator prompt.
    pub pending_user_instruction: Option<String>,
    pub creator: PersonaConfig,
    pub reviewers: Vec<ReviewerConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh session in the `Created` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        topic: String,
        max_iterations: u32,
        stop_marker: String,
        stop_on_reviewer_approved: bool,
        run_mode: RunMode,
        creator: PersonaConfig,
        reviewers: Vec<ReviewerConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            status: SessionStatus::Created,
            stop_reason: StopReason::None,
            max_iterations,
            current_iteration: 0,
            feedback_version: 1,
            stop_marker,
            stop_on_reviewer_approved,
            run_mode,
            topic,
            final_content: None,
            needs_final_iteration: false,
            pending_user_instruction: None,
            creator,
            reviewers,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate configuration invariants before persisting.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be > 0".to_string());
        }
        if self.reviewers.is_empty() {
            return Err("at least one reviewer is required".to_string());
        }
        self.creator
            .validate()
            .map_err(|e| format!("creator config: {}", e))?;
        let mut seen = std::collections::HashSet::new();
        for reviewer in &self.reviewers {
            if reviewer.id.trim().is_empty() {
                return Err("reviewer id must not be empty".to_string());
            }
            if reviewer.id == CREATOR_AUTHOR {
                return Err(format!("reviewer id must not be '{}'", CREATOR_AUTHOR));
            }
            if !seen.insert(reviewer.id.as_str()) {
                return Err(format!("duplicate reviewer id: {}", reviewer.id));
            }
            reviewer
                .persona
                .validate()
                .map_err(|e| format!("reviewer {}: {}", reviewer.id, e))?;
        }
        Ok(())
    }

    /// All distinct model names the session's personas reference.
    pub fn referenced_models(&self) -> Vec<String> {
        let mut models = vec![self.creator.model_name.clone()];
        for reviewer in &self.reviewers {
            if !models.contains(&reviewer.persona.model_name) {
                models.push(reviewer.persona.model_name.clone());
            }
        }
        models
    }

    /// Look up a reviewer by its id.
    pub fn reviewer(&self, id: &str) -> Option<&ReviewerConfig> {
        self.reviewers.iter().find(|r| r.id == id)
    }
}

/// Role of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

/// An append-only transcript entry owned by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    /// `Creator`, a reviewer id, or `User` for injected feedback.
    pub author: String,
    pub iteration: u32,
    pub content: String,
    pub model_used: String,
    pub reviewer_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One reviewer's verdict within a feedback round, in configuration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerSummary {
    pub reviewer_id: String,
    pub reviewer_name: String,
    pub feedback: String,
    pub approved: bool,
}

/// Record of one completed iteration: the draft plus every reviewer verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRound {
    pub feedback_round_id: Uuid,
    pub session_id: Uuid,
    pub iteration: u32,
    pub draft_content: String,
    pub user_feedback: Option<String>,
    pub user_feedback_at: Option<DateTime<Utc>>,
    pub all_reviewers_approved: bool,
    pub reviewer_summaries: Vec<ReviewerSummary>,
    pub created_at: DateTime<Utc>,
}

impl FeedbackRound {
    /// Build a round from the draft and per-reviewer verdicts.
    /// `all_reviewers_approved` holds iff the list is non-empty and every
    /// reviewer approved.
    pub fn new(
        session_id: Uuid,
        iteration: u32,
        draft_content: String,
        reviewer_summaries: Vec<ReviewerSummary>,
    ) -> Self {
        let all_reviewers_approved =
            !reviewer_summaries.is_empty() && reviewer_summaries.iter().all(|s| s.approved);
        Self {
            feedback_round_id: Uuid::new_v4(),
            session_id,
            iteration,
            draft_content,
            user_feedback: None,
            user_feedback_at: None,
            all_reviewers_approved,
            reviewer_summaries,
            created_at: Utc::now(),
        }
    }
}

/// Wire dialect of a configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Azure,
    Google,
    XAi,
    Anthropic,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Azure => write!(f, "azure"),
            Self::Google => write!(f, "google"),
            Self::XAi => write!(f, "xai"),
            Self::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "google" => Ok(Self::Google),
            "xai" => Ok(Self::XAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// A per-user model registration. The key is stored sealed; plaintext exists
/// only inside `CredentialStore::resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredModel {
    pub id: Uuid,
    pub user_email: String,
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    pub encrypted_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user preferences. Referenced by id only; not part of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub native_agent_model_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(model: &str) -> PersonaConfig {
        PersonaConfig {
            root_prompt: "You draft technical summaries.".to_string(),
            model_name: model.to_string(),
            ..Default::default()
        }
    }

    fn reviewer(id: &str, model: &str) -> ReviewerConfig {
        ReviewerConfig {
            id: id.to_string(),
            display_name: format!("Reviewer {}", id),
            persona: persona(model),
        }
    }

    fn session() -> Session {
        Session::new(
            "test".to_string(),
            "TCP congestion control".to_string(),
            4,
            "FINAL:".to_string(),
            true,
            RunMode::Auto,
            persona("gpt-4o"),
            vec![reviewer("r1", "gpt-4o"), reviewer("r2", "grok-3")],
        )
    }

    #[test]
    fn test_new_session_defaults() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Created);
        assert_eq!(s.stop_reason, StopReason::None);
        assert_eq!(s.current_iteration, 0);
        assert_eq!(s.feedback_version, 1);
        assert!(!s.needs_final_iteration);
        assert!(s.final_content.is_none());
    }

    #[test]
    fn test_session_validate() {
        assert!(session().validate().is_ok());

        let mut s = session();
        s.max_iterations = 0;
        assert!(s.validate().is_err());

        let mut s = session();
        s.reviewers.clear();
        assert!(s.validate().is_err());

        let mut s = session();
        s.reviewers[1].id = "r1".to_string();
        assert!(s.validate().unwrap_err().contains("duplicate"));

        let mut s = session();
        s.reviewers[0].id = CREATOR_AUTHOR.to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_persona_validate_ranges() {
        let mut p = persona("m");
        assert!(p.validate().is_ok());

        p.temperature = 2.5;
        assert!(p.validate().is_err());
        p.temperature = 0.7;

        p.top_p = -0.1;
        assert!(p.validate().is_err());
        p.top_p = 1.0;

        p.presence_penalty = 3.0;
        assert!(p.validate().is_err());
        p.presence_penalty = 0.0;

        p.max_output_tokens = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_referenced_models_dedup() {
        let s = session();
        assert_eq!(s.referenced_models(), vec!["gpt-4o", "grok-3"]);
    }

    #[test]
    fn test_status_terminality() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Created.can_start());
        assert!(SessionStatus::Paused.can_start());
        assert!(!SessionStatus::Running.can_start());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Created,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Stopped,
            SessionStatus::Error,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_provider_serde() {
        let json = serde_json::to_string(&Provider::XAi).unwrap();
        assert_eq!(json, "\"xai\"");
        let parsed: Provider = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Provider::XAi);
        assert_eq!("azure".parse::<Provider>().unwrap(), Provider::Azure);
    }

    #[test]
    fn test_feedback_round_approval_aggregate() {
        let summary = |approved| ReviewerSummary {
            reviewer_id: "r1".to_string(),
            reviewer_name: "R1".to_string(),
            feedback: "fb".to_string(),
            approved,
        };

        let round = FeedbackRound::new(Uuid::new_v4(), 1, "draft".to_string(), vec![]);
        assert!(!round.all_reviewers_approved);

        let round = FeedbackRound::new(
            Uuid::new_v4(),
            1,
            "draft".to_string(),
            vec![summary(true), summary(true)],
        );
        assert!(round.all_reviewers_approved);

        let round = FeedbackRound::new(
            Uuid::new_v4(),
            1,
            "draft".to_string(),
            vec![summary(true), summary(false)],
        );
        assert!(!round.all_reviewers_approved);
    }
}
