// Embedded DDL. Schema migration tooling lives outside the gateway; at
// startup we only ensure the tables exist.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Open a pool for a `DB_URL`-style value. `file::memory:` (and
/// `:memory:`) run in process memory; in-memory pools are pinned to a
/// single connection so every handle sees the same database.
pub async fn connect(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let memory = matches!(db_url, "file::memory:" | ":memory:" | "sqlite::memory:");
    let url = if memory {
        "sqlite::memory:".to_string()
    } else if db_url.starts_with("sqlite:") {
        db_url.to_string()
    } else {
        format!("sqlite://{}?mode=rwc", db_url)
    };

    let mut options = SqlitePoolOptions::new().max_connections(if memory { 1 } else { 8 });
    if memory {
        options = options.idle_timeout(None).max_lifetime(None);
    }
    options.connect(&url).await
}

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id            TEXT PRIMARY KEY,
        email         TEXT NOT NULL,
        password_hash TEXT NOT NULL DEFAULT '',
        created_at    INTEGER NOT NULL,
        deleted_at    INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id   TEXT PRIMARY KEY,
        user_id      TEXT NOT NULL,
        last_seen_at INTEGER,
        created_at   INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id          TEXT PRIMARY KEY,
        user_id     TEXT,
        session_id  TEXT,
        title       TEXT,
        model       TEXT,
        provider_id TEXT,
        metadata    TEXT,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL,
        deleted_at  INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id              TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        seq             INTEGER NOT NULL,
        role            TEXT NOT NULL,
        content         TEXT NOT NULL DEFAULT '',
        content_json    TEXT,
        status          TEXT NOT NULL DEFAULT 'final',
        finish_reason   TEXT,
        tool_call_id    TEXT,
        tokens_in       INTEGER,
        tokens_out      INTEGER,
        tokens_total    INTEGER,
        response_id     TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        deleted_at      INTEGER,
        UNIQUE (conversation_id, seq)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
        ON messages (conversation_id, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tool_calls (
        id          TEXT NOT NULL,
        message_id  TEXT NOT NULL,
        call_index  INTEGER NOT NULL,
        tool_name   TEXT NOT NULL,
        arguments   TEXT NOT NULL DEFAULT '{}',
        text_offset INTEGER,
        PRIMARY KEY (message_id, call_index),
        UNIQUE (message_id, id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tool_calls_message ON tool_calls (message_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tool_outputs (
        id           TEXT PRIMARY KEY,
        tool_call_id TEXT NOT NULL,
        message_id   TEXT NOT NULL,
        output       TEXT NOT NULL DEFAULT '',
        status       TEXT NOT NULL DEFAULT 'success'
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tool_outputs_message ON tool_outputs (message_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_prompts (
        id         TEXT PRIMARY KEY,
        user_id    TEXT,
        name       TEXT NOT NULL,
        content    TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS journal (
        id         TEXT PRIMARY KEY,
        user_id    TEXT,
        entry      TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_settings (
        user_id TEXT NOT NULL,
        key     TEXT NOT NULL,
        value   TEXT NOT NULL,
        PRIMARY KEY (user_id, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS providers (
        id            TEXT PRIMARY KEY,
        kind          TEXT NOT NULL,
        base_url      TEXT,
        model_default TEXT,
        created_at    INTEGER NOT NULL,
        deleted_at    INTEGER
    )
    "#,
];

pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_creates_and_is_idempotent() {
        let pool = connect("file::memory:").await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('users','sessions','conversations','messages','tool_calls','tool_outputs',\
              'system_prompts','journal','user_settings','providers')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count.0, 10);
    }

    #[tokio::test]
    async fn test_file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let path = path.to_str().unwrap();

        {
            let pool = connect(path).await.unwrap();
            ensure_schema(&pool).await.unwrap();
            sqlx::query("INSERT INTO users (id, email, created_at) VALUES ('u1', 'a@b.c', 0)")
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;
        }

        let pool = connect(path).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}
