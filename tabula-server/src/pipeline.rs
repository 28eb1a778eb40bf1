//! Message pipeline: session lifecycle, ownership enforcement, message
//! insertion, title derivation, and bounded retention.
//!
//! Retention runs synchronously inside every mutating write, which already
//! holds the per-session advisory lock, so pruning never races a concurrent
//! write to the same session.

use std::sync::Arc;

use tabula_core::models::{Message, Role, Session, Table};
use tabula_core::{sanitize, TabulaError};

use crate::repo::{MessageRow, SessionRepo, SessionRow};

pub const MAX_TITLE_LENGTH: usize = 120;
pub const MAX_OWNER_LENGTH: usize = 128;
pub const DEFAULT_TITLE: &str = "New chat";

pub fn gen_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4().simple())
}

pub fn gen_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Opaque client identifier: trimmed and length-capped, never empty.
pub fn normalize_owner(raw: &str) -> Result<String, TabulaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TabulaError::InvalidInput(
            "client identifier is required".to_string(),
        ));
    }
    Ok(trimmed.chars().take(MAX_OWNER_LENGTH).collect())
}

fn clamp_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        trimmed.chars().take(MAX_TITLE_LENGTH).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionLimits {
    pub max_messages_per_session: usize,
    pub max_sessions_per_owner: usize,
}

impl From<&tabula_core::config::RetentionConfig> for RetentionLimits {
    fn from(cfg: &tabula_core::config::RetentionConfig) -> Self {
        Self {
            max_messages_per_session: cfg.max_messages_per_session,
            max_sessions_per_owner: cfg.max_sessions_per_owner,
        }
    }
}

pub struct MessagePipeline {
    repo: Arc<dyn SessionRepo>,
    retention: RetentionLimits,
    /// Active storage row cap for sanitized tables.
    row_limit: usize,
}

impl MessagePipeline {
    pub fn new(repo: Arc<dyn SessionRepo>, retention: RetentionLimits, row_limit: usize) -> Self {
        Self {
            repo,
            retention,
            row_limit,
        }
    }

    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    /// Allocates a session for `owner` and applies session-count retention.
    pub async fn create_session(
        &self,
        owner: &str,
        title: Option<&str>,
    ) -> Result<Session, TabulaError> {
        self.create_session_with_id(&gen_session_id(), owner, title)
            .await
    }

    async fn create_session_with_id(
        &self,
        id: &str,
        owner: &str,
        title: Option<&str>,
    ) -> Result<Session, TabulaError> {
        let owner = normalize_owner(owner)?;
        let now = now_ms();
        let row = SessionRow {
            id: id.to_string(),
            title: clamp_title(title.unwrap_or("")),
            owner: owner.clone(),
            created_at: now,
            updated_at: now,
        };
        self.repo.insert_session(&row).await?;
        self.repo
            .prune_sessions(&owner, self.retention.max_sessions_per_owner)
            .await?;
        self.get_session_with_messages(id, &owner)
            .await?
            .ok_or(TabulaError::SessionNotFound)
    }

    /// Get-or-create. A session that exists under a different owner yields
    /// [`TabulaError::OwnershipMismatch`]; callers are expected to allocate
    /// a replacement session instead of sharing state.
    pub async fn ensure_session(&self, id: &str, owner: &str) -> Result<Session, TabulaError> {
        let owner = normalize_owner(owner)?;
        match self.repo.fetch_session(id).await? {
            None => self.create_session_with_id(id, &owner, None).await,
            Some(existing) if existing.owner != owner => Err(TabulaError::OwnershipMismatch {
                session_id: id.to_string(),
            }),
            Some(_) => self
                .get_session_with_messages(id, &owner)
                .await?
                .ok_or(TabulaError::SessionNotFound),
        }
    }

    async fn assert_ownership(&self, id: &str, owner: &str) -> Result<SessionRow, TabulaError> {
        match self.repo.fetch_session(id).await? {
            None => Err(TabulaError::SessionNotFound),
            Some(row) if row.owner != owner => Err(TabulaError::OwnershipMismatch {
                session_id: id.to_string(),
            }),
            Some(row) => Ok(row),
        }
    }

    /// Inserts a user turn. The first user message of a session sets the
    /// title (trimmed, length-capped) exactly once.
    pub async fn add_user_message(
        &self,
        session_id: &str,
        owner: &str,
        message_id: Option<&str>,
        text: &str,
        time: Option<i64>,
    ) -> Result<String, TabulaError> {
        let owner = normalize_owner(owner)?;
        self.assert_ownership(session_id, &owner).await?;

        let id = message_id
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(gen_message_id);
        let row = MessageRow {
            id: id.clone(),
            session_id: session_id.to_string(),
            role: Role::User.as_str().to_string(),
            text: text.to_string(),
            time: time.unwrap_or_else(now_ms),
            table_summary: None,
            table_data: None,
            created_at: now_ms(),
        };
        self.repo.insert_message(&row).await?;
        self.repo.touch_session(session_id, now_ms()).await?;

        if self.repo.count_user_messages(session_id).await? == 1 {
            self.repo.set_title(session_id, &clamp_title(text)).await?;
        }

        self.repo
            .prune_messages(session_id, self.retention.max_messages_per_session)
            .await?;
        Ok(id)
    }

    /// Inserts a bot turn. Tables are sanitized before storage and the
    /// summary is derived from the sanitized tables, never from raw input.
    /// Returns the message id and the sanitized tables.
    pub async fn add_bot_message(
        &self,
        session_id: &str,
        owner: &str,
        text: &str,
        tables: &[Table],
    ) -> Result<(String, Vec<Table>), TabulaError> {
        let owner = normalize_owner(owner)?;
        self.assert_ownership(session_id, &owner).await?;

        let sanitized = sanitize::sanitize_tables(tables, self.row_limit);
        let summary = sanitize::build_summary(&sanitized);

        let id = gen_message_id();
        let now = now_ms();
        let row = MessageRow {
            id: id.clone(),
            session_id: session_id.to_string(),
            role: Role::Bot.as_str().to_string(),
            text: text.to_string(),
            time: now,
            table_summary: (!summary.is_empty())
                .then(|| serde_json::to_value(&summary))
                .transpose()
                .map_err(|e| TabulaError::Other(e.to_string()))?,
            table_data: (!sanitized.is_empty())
                .then(|| serde_json::to_value(&sanitized))
                .transpose()
                .map_err(|e| TabulaError::Other(e.to_string()))?,
            created_at: now,
        };
        self.repo.insert_message(&row).await?;
        self.repo.touch_session(session_id, now_ms()).await?;
        self.repo
            .prune_messages(session_id, self.retention.max_messages_per_session)
            .await?;
        Ok((id, sanitized))
    }

    /// Ownership-checked read; `None` when the session does not exist for
    /// this owner.
    pub async fn get_session_with_messages(
        &self,
        id: &str,
        owner: &str,
    ) -> Result<Option<Session>, TabulaError> {
        let owner = normalize_owner(owner)?;
        let row = match self.repo.fetch_session(id).await? {
            None => return Ok(None),
            Some(row) if row.owner != owner => {
                return Err(TabulaError::OwnershipMismatch {
                    session_id: id.to_string(),
                })
            }
            Some(row) => row,
        };

        let messages = self.load_messages(id).await?;
        Ok(Some(self.assemble_session(row, messages)))
    }

    /// All sessions of one owner, most recently updated first, full message
    /// lists attached.
    pub async fn list_sessions(&self, owner: &str) -> Result<Vec<Session>, TabulaError> {
        let owner = normalize_owner(owner)?;
        let rows = self.repo.list_sessions(&owner).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let messages = self.load_messages(&row.id).await?;
            sessions.push(self.assemble_session(row, messages));
        }
        Ok(sessions)
    }

    /// Ownership-checked delete; owner mismatch and absence both report
    /// not-found.
    pub async fn delete_session(&self, id: &str, owner: &str) -> Result<bool, TabulaError> {
        let owner = normalize_owner(owner)?;
        self.repo.delete_session(id, &owner).await
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>, TabulaError> {
        let rows = self.repo.list_messages(session_id).await?;
        Ok(rows.into_iter().map(|row| self.format_row(row)).collect())
    }

    /// Stored JSON columns that fail to parse degrade to empty structures so
    /// reads stay available.
    fn format_row(&self, row: MessageRow) -> Message {
        let summary = sanitize::summary_from_value(row.table_summary.as_ref());
        let tables = sanitize::tables_from_value(row.table_data.as_ref(), self.row_limit);
        sanitize::sanitize_message_record(
            &row.id,
            &row.role,
            &row.text,
            row.time,
            &summary,
            &tables,
            self.row_limit,
        )
    }

    fn assemble_session(&self, row: SessionRow, messages: Vec<Message>) -> Session {
        Session {
            id: row.id,
            title: row.title,
            owner: row.owner,
            created_at: row.created_at,
            updated_at: row.updated_at,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemorySessionRepo;
    use serde_json::json;

    fn pipeline_with(max_messages: usize, max_sessions: usize) -> MessagePipeline {
        MessagePipeline::new(
            Arc::new(MemorySessionRepo::new()),
            RetentionLimits {
                max_messages_per_session: max_messages,
                max_sessions_per_owner: max_sessions,
            },
            200,
        )
    }

    fn table(rows: Vec<serde_json::Value>, headers: &[&str]) -> Table {
        Table {
            label: "result".to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows,
            rows_truncated: false,
            total_rows: 0,
            csv: None,
            chart_type: None,
            limit: None,
            max_rows: None,
        }
    }

    #[tokio::test]
    async fn title_set_once_from_first_user_message() {
        let p = pipeline_with(200, 100);
        let session = p.create_session("alice", None).await.unwrap();
        assert_eq!(session.title, DEFAULT_TITLE);

        p.add_user_message(&session.id, "alice", None, "   Show Q3 revenue   ", Some(1))
            .await
            .unwrap();
        p.add_user_message(&session.id, "alice", None, "now by region", Some(2))
            .await
            .unwrap();

        let loaded = p
            .get_session_with_messages(&session.id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, "Show Q3 revenue");
    }

    #[tokio::test]
    async fn long_titles_are_capped() {
        let p = pipeline_with(200, 100);
        let session = p.create_session("alice", None).await.unwrap();
        let long = "x".repeat(500);
        p.add_user_message(&session.id, "alice", None, &long, Some(1))
            .await
            .unwrap();
        let loaded = p
            .get_session_with_messages(&session.id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title.chars().count(), MAX_TITLE_LENGTH);
    }

    #[tokio::test]
    async fn message_retention_evicts_oldest_by_time() {
        let p = pipeline_with(3, 100);
        let session = p.create_session("alice", None).await.unwrap();
        for time in [1, 2, 3, 4] {
            p.add_user_message(&session.id, "alice", None, "msg", Some(time))
                .await
                .unwrap();
        }
        let loaded = p
            .get_session_with_messages(&session.id, "alice")
            .await
            .unwrap()
            .unwrap();
        let times: Vec<i64> = loaded.messages.iter().map(|m| m.time).collect();
        assert_eq!(times, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn session_retention_keeps_most_recently_updated() {
        let p = pipeline_with(200, 2);
        // Real-clock pauses keep updated_at values distinct; ordering falls
        // back to id comparison on equal timestamps.
        let s1 = p.create_session("alice", Some("one")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let s2 = p.create_session("alice", Some("two")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Touch s1 so s2 becomes the eviction candidate on the next create.
        p.add_user_message(&s1.id, "alice", None, "bump", None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let s3 = p.create_session("alice", Some("three")).await.unwrap();

        let sessions = p.list_sessions("alice").await.unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(sessions.len(), 2);
        assert!(ids.contains(&s1.id.as_str()));
        assert!(ids.contains(&s3.id.as_str()));
        assert!(!ids.contains(&s2.id.as_str()));
    }

    #[tokio::test]
    async fn ensure_session_rejects_foreign_owner() {
        let p = pipeline_with(200, 100);
        let session = p.create_session("alice", None).await.unwrap();

        let err = p.ensure_session(&session.id, "bob").await.unwrap_err();
        assert!(matches!(err, TabulaError::OwnershipMismatch { .. }));

        // Caller fallback: a fresh session under the second owner.
        let replacement = p.create_session("bob", None).await.unwrap();
        assert_ne!(replacement.id, session.id);
        assert!(p
            .get_session_with_messages(&replacement.id, "bob")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn ensure_session_creates_when_absent() {
        let p = pipeline_with(200, 100);
        let session = p.ensure_session("sess_fixed", "alice").await.unwrap();
        assert_eq!(session.id, "sess_fixed");
        let again = p.ensure_session("sess_fixed", "alice").await.unwrap();
        assert_eq!(again.id, "sess_fixed");
    }

    #[tokio::test]
    async fn user_message_requires_existing_owned_session() {
        let p = pipeline_with(200, 100);
        let err = p
            .add_user_message("sess_missing", "alice", None, "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TabulaError::SessionNotFound));

        let session = p.create_session("alice", None).await.unwrap();
        let err = p
            .add_user_message(&session.id, "bob", None, "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TabulaError::OwnershipMismatch { .. }));
    }

    #[tokio::test]
    async fn bot_tables_are_sanitized_and_summarized() {
        let p = pipeline_with(200, 100);
        let session = p.create_session("alice", None).await.unwrap();

        let raw = vec![
            table(vec![json!({"a": "1"}), json!({"a": "-"})], &["a"]),
            table(vec![json!({"b": "-"})], &["b"]),
        ];
        let (_, sanitized) = p
            .add_bot_message(&session.id, "alice", "reply", &raw)
            .await
            .unwrap();
        // Second table was all placeholders and must be gone.
        assert_eq!(sanitized.len(), 1);

        let loaded = p
            .get_session_with_messages(&session.id, "alice")
            .await
            .unwrap()
            .unwrap();
        let bot = &loaded.messages[0];
        assert_eq!(bot.role, Role::Bot);
        assert_eq!(bot.table_data.len(), 1);
        assert_eq!(bot.table_summary.len(), 1);
        assert_eq!(bot.table_summary[0].total_rows, 1);
    }

    #[tokio::test]
    async fn delete_session_reports_not_found_for_foreign_owner() {
        let p = pipeline_with(200, 100);
        let session = p.create_session("alice", None).await.unwrap();
        assert!(!p.delete_session(&session.id, "bob").await.unwrap());
        assert!(p.delete_session(&session.id, "alice").await.unwrap());
        assert!(!p.delete_session(&session.id, "alice").await.unwrap());
    }

    #[tokio::test]
    async fn empty_owner_fails_fast() {
        let p = pipeline_with(200, 100);
        let err = p.create_session("   ", None).await.unwrap_err();
        assert!(matches!(err, TabulaError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn malformed_stored_columns_degrade_to_empty() {
        let repo = Arc::new(MemorySessionRepo::new());
        let p = MessagePipeline::new(
            repo.clone(),
            RetentionLimits {
                max_messages_per_session: 200,
                max_sessions_per_owner: 100,
            },
            200,
        );
        let session = p.create_session("alice", None).await.unwrap();

        repo.insert_message(&MessageRow {
            id: "msg_bad".to_string(),
            session_id: session.id.clone(),
            role: "bot".to_string(),
            text: "corrupt".to_string(),
            time: 1,
            table_summary: Some(json!("not a summary")),
            table_data: Some(json!(42)),
            created_at: 1,
        })
        .await
        .unwrap();

        let loaded = p
            .get_session_with_messages(&session.id, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert!(loaded.messages[0].table_data.is_empty());
        assert!(loaded.messages[0].table_summary.is_empty());
    }
}
