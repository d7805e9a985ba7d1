//! Event types published by the orchestrator and pushed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::StopReason;

/// All session lifecycle and streaming events, in the shape they cross the
/// wire. Per-session delivery order matches publish order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    SessionPaused {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    SessionStopped {
        session_id: Uuid,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },

    SessionCompleted {
        session_id: Uuid,
        final_content: String,
        stop_reason: StopReason,
        timestamp: DateTime<Utc>,
    },

    SessionError {
        session_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    IterationStarted {
        session_id: Uuid,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    IterationCompleted {
        session_id: Uuid,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// A persona started streaming a message.
    MessageStarted {
        session_id: Uuid,
        message_id: Uuid,
        /// `"Creator"` or a reviewer id.
        persona_id: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// A streamed text delta for an in-flight message.
    MessageChunk {
        session_id: Uuid,
        message_id: Uuid,
        delta: String,
        timestamp: DateTime<Utc>,
    },

    MessageCompleted {
        session_id: Uuid,
        message_id: Uuid,
        content: String,
        timestamp: DateTime<Utc>,
    },

    PersonaMemoryReset {
        session_id: Uuid,
        persona_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionPaused { .. } => "session_paused",
            Self::SessionStopped { .. } => "session_stopped",
            Self::SessionCompleted { .. } => "session_completed",
            Self::SessionError { .. } => "session_error",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::MessageStarted { .. } => "message_started",
            Self::MessageChunk { .. } => "message_chunk",
            Self::MessageCompleted { .. } => "message_completed",
            Self::PersonaMemoryReset { .. } => "persona_memory_reset",
        }
    }

    /// The session this event belongs to.
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::SessionPaused { session_id, .. }
            | Self::SessionStopped { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionError { session_id, .. }
            | Self::IterationStarted { session_id, .. }
            | Self::IterationCompleted { session_id, .. }
            | Self::MessageStarted { session_id, .. }
            | Self::MessageChunk { session_id, .. }
            | Self::MessageCompleted { session_id, .. }
            | Self::PersonaMemoryReset { session_id, .. } => *session_id,
        }
    }

    /// Get the timestamp of this event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { timestamp, .. }
            | Self::SessionPaused { timestamp, .. }
            | Self::SessionStopped { timestamp, .. }
            | Self::SessionCompleted { timestamp, .. }
            | Self::SessionError { timestamp, .. }
            | Self::IterationStarted { timestamp, .. }
            | Self::IterationCompleted { timestamp, .. }
            | Self::MessageStarted { timestamp, .. }
            | Self::MessageChunk { timestamp, .. }
            | Self::MessageCompleted { timestamp, .. }
            | Self::PersonaMemoryReset { timestamp, .. } => *timestamp,
        }
    }
}
