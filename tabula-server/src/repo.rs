//! Session/message storage seam.
//!
//! The pipeline talks to a `SessionRepo` trait object so tests can run
//! against an in-memory repo while the server binary uses Postgres. Both
//! implementations keep the same ordering contract: messages replay by
//! `(time, creation, id)` ascending, sessions list by `updated_at`
//! descending.

use async_trait::async_trait;
use sqlx::PgPool;
use tabula_core::TabulaError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub title: String,
    pub owner: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub text: String,
    pub time: i64,
    pub table_summary: Option<serde_json::Value>,
    pub table_data: Option<serde_json::Value>,
    pub created_at: i64,
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn insert_session(&self, row: &SessionRow) -> Result<(), TabulaError>;
    async fn fetch_session(&self, id: &str) -> Result<Option<SessionRow>, TabulaError>;
    async fn touch_session(&self, id: &str, updated_at: i64) -> Result<(), TabulaError>;
    async fn set_title(&self, id: &str, title: &str) -> Result<(), TabulaError>;
    async fn insert_message(&self, row: &MessageRow) -> Result<(), TabulaError>;
    async fn count_user_messages(&self, session_id: &str) -> Result<i64, TabulaError>;
    async fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRow>, TabulaError>;
    async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRow>, TabulaError>;
    async fn delete_session(&self, id: &str, owner: &str) -> Result<bool, TabulaError>;
    /// Keeps the `keep` most recent messages by `(time, creation)` desc.
    async fn prune_messages(&self, session_id: &str, keep: usize) -> Result<u64, TabulaError>;
    /// Keeps the `keep` most recently updated sessions of one owner.
    async fn prune_sessions(&self, owner: &str, keep: usize) -> Result<u64, TabulaError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgSessionRepo {
    pool: PgPool,
}

impl PgSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepo for PgSessionRepo {
    async fn insert_session(&self, row: &SessionRow) -> Result<(), TabulaError> {
        sqlx::query(
            "INSERT INTO sessions (id, title, owner, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&row.id)
        .bind(&row.title)
        .bind(&row.owner)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<SessionRow>, TabulaError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, title, owner, created_at, updated_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_session(&self, id: &str, updated_at: i64) -> Result<(), TabulaError> {
        sqlx::query("UPDATE sessions SET updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<(), TabulaError> {
        sqlx::query("UPDATE sessions SET title = $2 WHERE id = $1")
            .bind(id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(&self, row: &MessageRow) -> Result<(), TabulaError> {
        sqlx::query(
            "INSERT INTO messages \
             (id, session_id, role, text, time, table_summary, table_data, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&row.id)
        .bind(&row.session_id)
        .bind(&row.role)
        .bind(&row.text)
        .bind(row.time)
        .bind(&row.table_summary)
        .bind(&row.table_data)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_user_messages(&self, session_id: &str) -> Result<i64, TabulaError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE session_id = $1 AND role = 'user'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRow>, TabulaError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, session_id, role, text, time, table_summary, table_data, created_at \
             FROM messages WHERE session_id = $1 \
             ORDER BY time ASC, created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRow>, TabulaError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, title, owner, created_at, updated_at FROM sessions \
             WHERE owner = $1 ORDER BY updated_at DESC, id DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_session(&self, id: &str, owner: &str) -> Result<bool, TabulaError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1 AND owner = $2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_messages(&self, session_id: &str, keep: usize) -> Result<u64, TabulaError> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE session_id = $1 AND id NOT IN ( \
               SELECT id FROM messages WHERE session_id = $1 \
               ORDER BY time DESC, created_at DESC, id DESC LIMIT $2)",
        )
        .bind(session_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn prune_sessions(&self, owner: &str, keep: usize) -> Result<u64, TabulaError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE owner = $1 AND id NOT IN ( \
               SELECT id FROM sessions WHERE owner = $1 \
               ORDER BY updated_at DESC, id DESC LIMIT $2)",
        )
        .bind(owner)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// In-memory (tests, single-process deployments)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    sessions: Vec<SessionRow>,
    /// Messages carry an insertion sequence so creation order survives
    /// identical timestamps.
    messages: Vec<(u64, MessageRow)>,
    next_seq: u64,
}

/// Explicit-context in-memory repo; every instance is independent.
#[derive(Default)]
pub struct MemorySessionRepo {
    state: std::sync::Mutex<MemoryState>,
}

impl MemorySessionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionRepo for MemorySessionRepo {
    async fn insert_session(&self, row: &SessionRow) -> Result<(), TabulaError> {
        let mut state = self.lock();
        if state.sessions.iter().any(|s| s.id == row.id) {
            return Err(TabulaError::Other(format!(
                "duplicate session id {}",
                row.id
            )));
        }
        state.sessions.push(row.clone());
        Ok(())
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<SessionRow>, TabulaError> {
        Ok(self.lock().sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn touch_session(&self, id: &str, updated_at: i64) -> Result<(), TabulaError> {
        if let Some(session) = self.lock().sessions.iter_mut().find(|s| s.id == id) {
            session.updated_at = updated_at;
        }
        Ok(())
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<(), TabulaError> {
        if let Some(session) = self.lock().sessions.iter_mut().find(|s| s.id == id) {
            session.title = title.to_string();
        }
        Ok(())
    }

    async fn insert_message(&self, row: &MessageRow) -> Result<(), TabulaError> {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.push((seq, row.clone()));
        Ok(())
    }

    async fn count_user_messages(&self, session_id: &str) -> Result<i64, TabulaError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|(_, m)| m.session_id == session_id && m.role == "user")
            .count() as i64)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRow>, TabulaError> {
        let state = self.lock();
        let mut rows: Vec<(u64, MessageRow)> = state
            .messages
            .iter()
            .filter(|(_, m)| m.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            a.time
                .cmp(&b.time)
                .then(a.created_at.cmp(&b.created_at))
                .then(seq_a.cmp(seq_b))
        });
        Ok(rows.into_iter().map(|(_, m)| m).collect())
    }

    async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRow>, TabulaError> {
        let state = self.lock();
        let mut rows: Vec<SessionRow> = state
            .sessions
            .iter()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn delete_session(&self, id: &str, owner: &str) -> Result<bool, TabulaError> {
        let mut state = self.lock();
        let before = state.sessions.len();
        state.sessions.retain(|s| !(s.id == id && s.owner == owner));
        let deleted = state.sessions.len() < before;
        if deleted {
            state.messages.retain(|(_, m)| m.session_id != id);
        }
        Ok(deleted)
    }

    async fn prune_messages(&self, session_id: &str, keep: usize) -> Result<u64, TabulaError> {
        let survivors: Vec<String> = {
            let state = self.lock();
            let mut rows: Vec<(u64, &MessageRow)> = state
                .messages
                .iter()
                .filter(|(_, m)| m.session_id == session_id)
                .map(|(seq, m)| (*seq, m))
                .collect();
            rows.sort_by(|(seq_a, a), (seq_b, b)| {
                b.time
                    .cmp(&a.time)
                    .then(b.created_at.cmp(&a.created_at))
                    .then(seq_b.cmp(seq_a))
            });
            rows.into_iter().take(keep).map(|(_, m)| m.id.clone()).collect()
        };

        let mut state = self.lock();
        let before = state.messages.len();
        state
            .messages
            .retain(|(_, m)| m.session_id != session_id || survivors.contains(&m.id));
        Ok((before - state.messages.len()) as u64)
    }

    async fn prune_sessions(&self, owner: &str, keep: usize) -> Result<u64, TabulaError> {
        let survivors: Vec<String> = {
            let state = self.lock();
            let mut rows: Vec<&SessionRow> =
                state.sessions.iter().filter(|s| s.owner == owner).collect();
            rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
            rows.into_iter().take(keep).map(|s| s.id.clone()).collect()
        };

        let mut state = self.lock();
        let doomed: Vec<String> = state
            .sessions
            .iter()
            .filter(|s| s.owner == owner && !survivors.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();
        state.sessions.retain(|s| !doomed.contains(&s.id));
        state.messages.retain(|(_, m)| !doomed.contains(&m.session_id));
        Ok(doomed.len() as u64)
    }
}
