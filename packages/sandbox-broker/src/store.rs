//! Durable per-session key/value store. Every state transition writes a full
//! `SessionState` snapshot under the `session` key; two auxiliary keys hold
//! the DB endpoint and the session-scoped bearer token.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::session::{now_ms, SessionState};

pub const KEY_SESSION: &str = "session";
pub const KEY_DB_SITE_URL: &str = "dbSiteUrl";
pub const KEY_BEARER_TOKEN: &str = "bearerToken";

#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(include_str!("../migrations/0001_init.sql"))
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    pub async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM session_kv WHERE session_id = ?1 AND key = ?2")
            .bind(session_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("value")).transpose()
    }

    pub async fn put(&self, session_id: &str, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO session_kv (session_id, key, value, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(session_id, key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at"#,
        )
        .bind(session_id)
        .bind(key)
        .bind(value)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_session(&self, session_id: &str) -> Option<SessionState> {
        let raw = match self.get(session_id, KEY_SESSION).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(session_id, error = %err, "failed to read session snapshot");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(session_id, error = %err, "discarding corrupt session snapshot");
                None
            }
        }
    }

    /// Durable writes are best-effort towards callers: a failed write is
    /// logged and the in-memory state remains authoritative for this
    /// process lifetime.
    pub async fn save_session(&self, state: &SessionState) {
        let raw = match serde_json::to_string(state) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(session_id = %state.session_id, error = %err, "failed to encode session");
                return;
            }
        };
        if let Err(err) = self.put(&state.session_id, KEY_SESSION, &raw).await {
            warn!(session_id = %state.session_id, error = %err, "failed to persist session");
        }
    }

    pub async fn save_auth(&self, session_id: &str, db_site_url: &str, bearer: &str) {
        for (key, value) in [(KEY_DB_SITE_URL, db_site_url), (KEY_BEARER_TOKEN, bearer)] {
            if let Err(err) = self.put(session_id, key, value).await {
                warn!(session_id, key, error = %err, "failed to persist auth config");
            }
        }
    }

    pub async fn load_auth(&self, session_id: &str) -> Option<(String, String)> {
        let db_site_url = self.get(session_id, KEY_DB_SITE_URL).await.ok()??;
        let bearer = self.get(session_id, KEY_BEARER_TOKEN).await.ok()??;
        Some((db_site_url, bearer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Message, MessageRole};

    async fn store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = StateStore::open(&dir.path().join("state.db"))
            .await
            .expect("open store");
        (store, dir)
    }

    #[tokio::test]
    async fn session_snapshot_round_trips() {
        let (store, _dir) = store().await;
        let mut state =
            SessionState::new("s1".to_string(), "acme/hello".to_string(), "u1".to_string());
        state.append_message(Message::text(MessageRole::User, "hi"));
        store.save_session(&state).await;

        let loaded = store.load_session("s1").await.expect("snapshot");
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn later_writes_overwrite_earlier_ones() {
        let (store, _dir) = store().await;
        store.put("s1", KEY_SESSION, "one").await.unwrap();
        store.put("s1", KEY_SESSION, "two").await.unwrap();
        assert_eq!(store.get("s1", KEY_SESSION).await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn auth_keys_are_scoped_per_session() {
        let (store, _dir) = store().await;
        store.save_auth("s1", "https://db.example", "tok-1").await;
        assert_eq!(
            store.load_auth("s1").await,
            Some(("https://db.example".to_string(), "tok-1".to_string()))
        );
        assert_eq!(store.load_auth("s2").await, None);
    }

    #[tokio::test]
    async fn corrupt_snapshot_loads_as_fresh() {
        let (store, _dir) = store().await;
        store.put("s1", KEY_SESSION, "{not json").await.unwrap();
        assert!(store.load_session("s1").await.is_none());
    }
}
