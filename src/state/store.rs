//! SQLite-backed session store.
//!
//! Single-connection repository guarded by a mutex; all mutation goes
//! through here. WAL mode and foreign keys are enabled so session deletion
//! cascades to messages and feedback rounds.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::schema;
use super::types::*;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether the underlying failure was a uniqueness violation.
    fn is_constraint_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to SessionStore.
pub type SharedSessionStore = Arc<SessionStore>;

/// SQLite-backed persistent store for sessions, messages, feedback rounds,
/// configured models, and user settings.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open or create a store at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests, or persistence disabled).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a shared reference to this store.
    pub fn shared(self) -> SharedSessionStore {
        Arc::new(self)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Insert a new session row.
    pub fn create_session(&self, session: &Session) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sessions (
                id, name, status, stop_reason, max_iterations, current_iteration,
                feedback_version, stop_marker, stop_on_reviewer_approved, run_mode,
                topic, final_content, needs_final_iteration, pending_user_instruction,
                creator_config, reviewers_config, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                session.id.to_string(),
                session.name,
                session.status.to_string(),
                session.stop_reason.to_string(),
                session.max_iterations,
                session.current_iteration,
                session.feedback_version,
                session.stop_marker,
                session.stop_on_reviewer_approved,
                session.run_mode.to_string(),
                session.topic,
                session.final_content,
                session.needs_final_iteration,
                session.pending_user_instruction,
                serde_json::to_string(&session.creator)?,
                serde_json::to_string(&session.reviewers)?,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a session by id.
    pub fn get_session(&self, id: Uuid) -> StoreResult<Session> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            [id.to_string()],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }

    /// List all sessions, newest-updated first.
    pub fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Persist the mutable fields of a session. Bumps `updated_at`.
    pub fn update_session(&self, session: &mut Session) -> StoreResult<()> {
        session.updated_at = Utc::now();
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE sessions SET
                name = ?2, status = ?3, stop_reason = ?4, max_iterations = ?5,
                current_iteration = ?6, feedback_version = ?7, stop_marker = ?8,
                stop_on_reviewer_approved = ?9, run_mode = ?10, topic = ?11,
                final_content = ?12, needs_final_iteration = ?13,
                pending_user_instruction = ?14, updated_at = ?15
            WHERE id = ?1
            "#,
            params![
                session.id.to_string(),
                session.name,
                session.status.to_string(),
                session.stop_reason.to_string(),
                session.max_iterations,
                session.current_iteration,
                session.feedback_version,
                session.stop_marker,
                session.stop_on_reviewer_approved,
                session.run_mode.to_string(),
                session.topic,
                session.final_content,
                session.needs_final_iteration,
                session.pending_user_instruction,
                session.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    /// Delete a session; messages and feedback rounds cascade.
    pub fn delete_session(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.to_string()])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Append a message to a session transcript.
    pub fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO messages (
                message_id, session_id, role, author, iteration, content,
                model_used, reviewer_display_name, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                message.message_id.to_string(),
                message.session_id.to_string(),
                message.role.to_string(),
                message.author,
                message.iteration,
                message.content,
                message.model_used,
                message.reviewer_display_name,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All messages of a session in chronological (insertion) order.
    pub fn list_messages(&self, session_id: Uuid) -> StoreResult<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([session_id.to_string()], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Messages authored by one persona, chronological order.
    pub fn list_messages_by_author(
        &self,
        session_id: Uuid,
        author: &str,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ?1 AND author = ?2 \
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string(), author], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Most recent Creator assistant message, if any.
    pub fn latest_creator_message(&self, session_id: Uuid) -> StoreResult<Option<Message>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM messages WHERE session_id = ?1 AND author = ?2 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![session_id.to_string(), CREATOR_AUTHOR],
            row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Remove every message authored by one persona. Returns the count.
    pub fn delete_messages_by_author(
        &self,
        session_id: Uuid,
        author: &str,
    ) -> StoreResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE session_id = ?1 AND author = ?2",
            params![session_id.to_string(), author],
        )?;
        Ok(deleted)
    }

    // =========================================================================
    // Feedback rounds
    // =========================================================================

    /// Insert a feedback round; at most one per `(session, iteration)`.
    pub fn insert_feedback_round(&self, round: &FeedbackRound) -> StoreResult<()> {
        let conn = self.lock()?;
        let result = conn.execute(
            r#"
            INSERT INTO feedback_rounds (
                feedback_round_id, session_id, iteration, draft_content,
                user_feedback, user_feedback_at, all_reviewers_approved,
                reviewer_summaries, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                round.feedback_round_id.to_string(),
                round.session_id.to_string(),
                round.iteration,
                round.draft_content,
                round.user_feedback,
                round.user_feedback_at.map(|t| t.to_rfc3339()),
                round.all_reviewers_approved,
                serde_json::to_string(&round.reviewer_summaries)?,
                round.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_constraint_violation(&e) => Err(StoreError::Conflict(
                format!(
                    "feedback round already exists for session {} iteration {}",
                    round.session_id, round.iteration
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// All feedback rounds of a session in iteration order.
    pub fn list_feedback_rounds(&self, session_id: Uuid) -> StoreResult<Vec<FeedbackRound>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM feedback_rounds WHERE session_id = ?1 ORDER BY iteration ASC",
        )?;
        let rows = stmt.query_map([session_id.to_string()], row_to_feedback_round)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Attach user feedback text to a specific iteration's round.
    pub fn set_user_feedback(
        &self,
        session_id: Uuid,
        iteration: u32,
        feedback: &str,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE feedback_rounds SET user_feedback = ?3, user_feedback_at = ?4 \
             WHERE session_id = ?1 AND iteration = ?2",
            params![
                session_id.to_string(),
                iteration,
                feedback,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "feedback round for session {} iteration {}",
                session_id, iteration
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Configured models
    // =========================================================================

    /// All models registered by one user, by model name.
    pub fn list_models(&self, user_email: &str) -> StoreResult<Vec<ConfiguredModel>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM configured_models WHERE user_email = ?1 ORDER BY model_name ASC",
        )?;
        let rows = stmt.query_map([user_email], row_to_model)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Look up a model by `(user, model_name)`.
    pub fn get_model(
        &self,
        user_email: &str,
        model_name: &str,
    ) -> StoreResult<Option<ConfiguredModel>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM configured_models WHERE user_email = ?1 AND model_name = ?2",
            params![user_email, model_name],
            row_to_model,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Look up a model by id, scoped to its owner.
    pub fn get_model_by_id(
        &self,
        user_email: &str,
        id: Uuid,
    ) -> StoreResult<Option<ConfiguredModel>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM configured_models WHERE user_email = ?1 AND id = ?2",
            params![user_email, id.to_string()],
            row_to_model,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Insert a model registration; `(user, model_name)` must be unique.
    pub fn insert_model(&self, model: &ConfiguredModel) -> StoreResult<()> {
        let conn = self.lock()?;
        let result = conn.execute(
            r#"
            INSERT INTO configured_models (
                id, user_email, model_name, display_name, endpoint, provider,
                encrypted_key, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                model.id.to_string(),
                model.user_email,
                model.model_name,
                model.display_name,
                model.endpoint,
                model.provider.to_string(),
                model.encrypted_key,
                model.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_constraint_violation(&e) => Err(StoreError::Conflict(
                format!(
                    "model {} already configured for {}",
                    model.model_name, model.user_email
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Update a model registration. A rename that collides with an existing
    /// `(user, model_name)` is a conflict.
    pub fn update_model(&self, model: &ConfiguredModel) -> StoreResult<()> {
        let conn = self.lock()?;
        let result = conn.execute(
            r#"
            UPDATE configured_models SET
                model_name = ?3, display_name = ?4, endpoint = ?5,
                provider = ?6, encrypted_key = ?7
            WHERE user_email = ?1 AND id = ?2
            "#,
            params![
                model.user_email,
                model.id.to_string(),
                model.model_name,
                model.display_name,
                model.endpoint,
                model.provider.to_string(),
                model.encrypted_key,
            ],
        );
        match result {
            Ok(0) => Err(StoreError::NotFound(format!("model {}", model.id))),
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_constraint_violation(&e) => Err(StoreError::Conflict(
                format!(
                    "model {} already configured for {}",
                    model.model_name, model.user_email
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a model registration by id, scoped to its owner.
    pub fn delete_model(&self, user_email: &str, id: Uuid) -> StoreResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM configured_models WHERE user_email = ?1 AND id = ?2",
            params![user_email, id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("model {}", id)));
        }
        Ok(())
    }

    // =========================================================================
    // User settings
    // =========================================================================

    /// Fetch a user's settings, if stored.
    pub fn get_user_settings(&self, user_id: &str) -> StoreResult<Option<UserSettings>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user_id, native_agent_model_id FROM user_settings WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(UserSettings {
                    user_id: row.get(0)?,
                    native_agent_model_id: row
                        .get::<_, Option<String>>(1)?
                        .and_then(|s| Uuid::parse_str(&s).ok()),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Insert or replace a user's settings.
    pub fn put_user_settings(&self, settings: &UserSettings) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO user_settings (user_id, native_agent_model_id) VALUES (?1, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET native_agent_model_id = excluded.native_agent_model_id",
            params![
                settings.user_id,
                settings.native_agent_model_id.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_uuid(s: String) -> Result<Uuid, rusqlite::Error> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(s: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: String) -> Result<T, rusqlite::Error> {
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(s: String) -> Result<T, rusqlite::Error> {
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: parse_uuid(row.get("id")?)?,
        name: row.get("name")?,
        status: parse_enum(row.get("status")?)?,
        stop_reason: parse_enum(row.get("stop_reason")?)?,
        max_iterations: row.get("max_iterations")?,
        current_iteration: row.get("current_iteration")?,
        feedback_version: row.get("feedback_version")?,
        stop_marker: row.get("stop_marker")?,
        stop_on_reviewer_approved: row.get("stop_on_reviewer_approved")?,
        run_mode: parse_enum(row.get("run_mode")?)?,
        topic: row.get("topic")?,
        final_content: row.get("final_content")?,
        needs_final_iteration: row.get("needs_final_iteration")?,
        pending_user_instruction: row.get("pending_user_instruction")?,
        creator: parse_json(row.get("creator_config")?)?,
        reviewers: parse_json(row.get("reviewers_config")?)?,
        created_at: parse_timestamp(row.get("created_at")?)?,
        updated_at: parse_timestamp(row.get("updated_at")?)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        message_id: parse_uuid(row.get("message_id")?)?,
        session_id: parse_uuid(row.get("session_id")?)?,
        role: parse_enum(row.get("role")?)?,
        author: row.get("author")?,
        iteration: row.get("iteration")?,
        content: row.get("content")?,
        model_used: row.get("model_used")?,
        reviewer_display_name: row.get("reviewer_display_name")?,
        created_at: parse_timestamp(row.get("created_at")?)?,
    })
}

fn row_to_feedback_round(row: &Row<'_>) -> rusqlite::Result<FeedbackRound> {
    let user_feedback_at: Option<String> = row.get("user_feedback_at")?;
    Ok(FeedbackRound {
        feedback_round_id: parse_uuid(row.get("feedback_round_id")?)?,
        session_id: parse_uuid(row.get("session_id")?)?,
        iteration: row.get("iteration")?,
        draft_content: row.get("draft_content")?,
        user_feedback: row.get("user_feedback")?,
        user_feedback_at: user_feedback_at.map(parse_timestamp).transpose()?,
        all_reviewers_approved: row.get("all_reviewers_approved")?,
        reviewer_summaries: parse_json(row.get("reviewer_summaries")?)?,
        created_at: parse_timestamp(row.get("created_at")?)?,
    })
}

fn row_to_model(row: &Row<'_>) -> rusqlite::Result<ConfiguredModel> {
    Ok(ConfiguredModel {
        id: parse_uuid(row.get("id")?)?,
        user_email: row.get("user_email")?,
        model_name: row.get("model_name")?,
        display_name: row.get("display_name")?,
        endpoint: row.get("endpoint")?,
        provider: parse_enum(row.get("provider")?)?,
        encrypted_key: row.get("encrypted_key")?,
        created_at: parse_timestamp(row.get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    fn persona(model: &str) -> PersonaConfig {
        PersonaConfig {
            root_prompt: "Draft it.".to_string(),
            model_name: model.to_string(),
            ..Default::default()
        }
    }

    fn test_session() -> Session {
        Session::new(
            "s".to_string(),
            String::new(),
            3,
            "FINAL:".to_string(),
            false,
            RunMode::Auto,
            persona("gpt-4o"),
            vec![ReviewerConfig {
                id: "critic".to_string(),
                display_name: "Critic".to_string(),
                persona: persona("gpt-4o"),
            }],
        )
    }

    fn message(session_id: Uuid, author: &str, iteration: u32, content: &str) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            session_id,
            role: MessageRole::Assistant,
            author: author.to_string(),
            iteration,
            content: content.to_string(),
            model_used: "gpt-4o".to_string(),
            reviewer_display_name: None,
            created_at: Utc::now(),
        }
    }

    fn model(user: &str, name: &str) -> ConfiguredModel {
        ConfiguredModel {
            id: Uuid::new_v4(),
            user_email: user.to_string(),
            model_name: name.to_string(),
            display_name: None,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            provider: Provider::OpenAi,
            encrypted_key: Some("sealed".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let store = store();
        let session = test_session();
        store.create_session(&session).unwrap();

        let loaded = store.get_session(session.id).unwrap();
        assert_eq!(loaded.name, "s");
        assert_eq!(loaded.status, SessionStatus::Created);
        assert_eq!(loaded.reviewers.len(), 1);
        assert_eq!(loaded.reviewers[0].id, "critic");
        assert_eq!(loaded.creator.model_name, "gpt-4o");
    }

    #[test]
    fn test_get_missing_session() {
        let store = store();
        let err = store.get_session(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_update_session_fields() {
        let store = store();
        let mut session = test_session();
        store.create_session(&session).unwrap();

        session.status = SessionStatus::Running;
        session.current_iteration = 2;
        session.needs_final_iteration = true;
        store.update_session(&mut session).unwrap();

        let loaded = store.get_session(session.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.current_iteration, 2);
        assert!(loaded.needs_final_iteration);
    }

    #[test]
    fn test_cascade_delete() {
        let store = store();
        let session = test_session();
        store.create_session(&session).unwrap();
        store
            .insert_message(&message(session.id, CREATOR_AUTHOR, 1, "draft"))
            .unwrap();
        store
            .insert_feedback_round(&FeedbackRound::new(
                session.id,
                1,
                "draft".to_string(),
                vec![],
            ))
            .unwrap();

        store.delete_session(session.id).unwrap();
        assert!(store.list_messages(session.id).unwrap().is_empty());
        assert!(store.list_feedback_rounds(session.id).unwrap().is_empty());
    }

    #[test]
    fn test_messages_by_author_and_reset() {
        let store = store();
        let session = test_session();
        store.create_session(&session).unwrap();
        store
            .insert_message(&message(session.id, CREATOR_AUTHOR, 1, "d1"))
            .unwrap();
        store
            .insert_message(&message(session.id, "critic", 1, "r1"))
            .unwrap();
        store
            .insert_message(&message(session.id, CREATOR_AUTHOR, 2, "d2"))
            .unwrap();

        let creator = store
            .list_messages_by_author(session.id, CREATOR_AUTHOR)
            .unwrap();
        assert_eq!(creator.len(), 2);
        assert_eq!(creator[0].content, "d1");
        assert_eq!(creator[1].content, "d2");

        let latest = store.latest_creator_message(session.id).unwrap().unwrap();
        assert_eq!(latest.content, "d2");

        let deleted = store
            .delete_messages_by_author(session.id, "critic")
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list_messages(session.id).unwrap().len(), 2);
    }

    #[test]
    fn test_feedback_round_unique_per_iteration() {
        let store = store();
        let session = test_session();
        store.create_session(&session).unwrap();

        let round = FeedbackRound::new(session.id, 1, "draft".to_string(), vec![]);
        store.insert_feedback_round(&round).unwrap();

        let duplicate = FeedbackRound::new(session.id, 1, "other".to_string(), vec![]);
        let err = store.insert_feedback_round(&duplicate).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_user_feedback_attachment() {
        let store = store();
        let session = test_session();
        store.create_session(&session).unwrap();
        store
            .insert_feedback_round(&FeedbackRound::new(
                session.id,
                1,
                "draft".to_string(),
                vec![],
            ))
            .unwrap();

        store
            .set_user_feedback(session.id, 1, "tighten the intro")
            .unwrap();
        let rounds = store.list_feedback_rounds(session.id).unwrap();
        assert_eq!(rounds[0].user_feedback.as_deref(), Some("tighten the intro"));
        assert!(rounds[0].user_feedback_at.is_some());

        let err = store.set_user_feedback(session.id, 9, "x").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_model_uniqueness_per_user() {
        let store = store();
        store.insert_model(&model("a@x.io", "gpt-4o")).unwrap();

        // Same name, same user: conflict
        let err = store.insert_model(&model("a@x.io", "gpt-4o")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same name, different user: fine
        store.insert_model(&model("b@x.io", "gpt-4o")).unwrap();
        assert_eq!(store.list_models("a@x.io").unwrap().len(), 1);
        assert_eq!(store.list_models("b@x.io").unwrap().len(), 1);
    }

    #[test]
    fn test_model_rename_collision() {
        let store = store();
        let first = model("a@x.io", "gpt-4o");
        let second = model("a@x.io", "grok-3");
        store.insert_model(&first).unwrap();
        store.insert_model(&second).unwrap();

        let mut renamed = second.clone();
        renamed.model_name = "gpt-4o".to_string();
        let err = store.update_model(&renamed).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_model_delete_scoped_to_owner() {
        let store = store();
        let m = model("a@x.io", "gpt-4o");
        store.insert_model(&m).unwrap();

        let err = store.delete_model("b@x.io", m.id).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        store.delete_model("a@x.io", m.id).unwrap();
        assert!(store.list_models("a@x.io").unwrap().is_empty());
    }

    #[test]
    fn test_user_settings_upsert() {
        let store = store();
        let id = Uuid::new_v4();
        store
            .put_user_settings(&UserSettings {
                user_id: "a@x.io".to_string(),
                native_agent_model_id: None,
            })
            .unwrap();
        store
            .put_user_settings(&UserSettings {
                user_id: "a@x.io".to_string(),
                native_agent_model_id: Some(id),
            })
            .unwrap();

        let settings = store.get_user_settings("a@x.io").unwrap().unwrap();
        assert_eq!(settings.native_agent_model_id, Some(id));
    }

    #[test]
    fn test_sessions_listed_newest_first() {
        let store = store();
        let mut first = test_session();
        let second = test_session();
        store.create_session(&first).unwrap();
        store.create_session(&second).unwrap();

        // Touch the first session so it becomes the most recently updated.
        std::thread::sleep(std::time::Duration::from_millis(5));
        first.current_iteration = 1;
        store.update_session(&mut first).unwrap();

        let listed = store.list_sessions().unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }
}
