//! Database schema and migrations.
//!
//! SQLite with embedded migrations driven by `PRAGMA user_version`.

use rusqlite::Connection;

use super::store::StoreResult;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number.
const MIGRATIONS: &[&str] = &[
    // Version 1: sessions, messages, feedback rounds, configured models,
    // user settings.
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id                        TEXT PRIMARY KEY,
        name                      TEXT NOT NULL,
        status                    TEXT NOT NULL,
        stop_reason               TEXT NOT NULL,
        max_iterations            INTEGER NOT NULL,
        current_iteration         INTEGER NOT NULL,
        feedback_version          INTEGER NOT NULL,
        stop_marker               TEXT NOT NULL,
        stop_on_reviewer_approved INTEGER NOT NULL,
        run_mode                  TEXT NOT NULL,
        topic                     TEXT NOT NULL,
        final_content             TEXT,
        needs_final_iteration     INTEGER NOT NULL DEFAULT 0,
        pending_user_instruction  TEXT,

        -- Persona snapshots, frozen at creation
        creator_config            JSON NOT NULL,
        reviewers_config          JSON NOT NULL,

        created_at                TEXT NOT NULL,
        updated_at                TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

    CREATE TABLE IF NOT EXISTS messages (
        message_id            TEXT PRIMARY KEY,
        session_id            TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        role                  TEXT NOT NULL,
        author                TEXT NOT NULL,
        iteration             INTEGER NOT NULL,
        content               TEXT NOT NULL,
        model_used            TEXT NOT NULL,
        reviewer_display_name TEXT,
        created_at            TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session_iteration
        ON messages(session_id, iteration);
    CREATE INDEX IF NOT EXISTS idx_messages_session_author
        ON messages(session_id, author);

    CREATE TABLE IF NOT EXISTS feedback_rounds (
        feedback_round_id      TEXT PRIMARY KEY,
        session_id             TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        iteration              INTEGER NOT NULL,
        draft_content          TEXT NOT NULL,
        user_feedback          TEXT,
        user_feedback_at       TEXT,
        all_reviewers_approved INTEGER NOT NULL,
        reviewer_summaries     JSON NOT NULL,
        created_at             TEXT NOT NULL,

        UNIQUE(session_id, iteration)
    );

    CREATE TABLE IF NOT EXISTS configured_models (
        id            TEXT PRIMARY KEY,
        user_email    TEXT NOT NULL,
        model_name    TEXT NOT NULL,
        display_name  TEXT,
        endpoint      TEXT NOT NULL,
        provider      TEXT NOT NULL,
        encrypted_key TEXT,
        created_at    TEXT NOT NULL,

        UNIQUE(user_email, model_name)
    );

    CREATE TABLE IF NOT EXISTS user_settings (
        user_id               TEXT PRIMARY KEY,
        native_agent_model_id TEXT
    );
    "#,
];

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running database migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database.
pub fn schema_version(conn: &Connection) -> StoreResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in [
            "sessions",
            "messages",
            "feedback_rounds",
            "configured_models",
            "user_settings",
        ] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "table {} should exist", table);
        }
    }
}
