//! Client-side session mirror.
//!
//! Holds the ordered session list and the active-session pointer. Inbound
//! payloads are normalized and clamped with the same bounds the server
//! retention uses, so the mirror can never outgrow what the server would
//! keep. Optimistic local edits are reconciled against the authoritative
//! chat response.

use tabula_core::models::{Message, Role, Session, Table, TableSummary};
use tabula_core::sanitize;

use crate::api::ChatResponse;

pub const MAX_STORED_SESSIONS: usize = 100;
pub const MAX_MESSAGES_PER_SESSION: usize = 200;

const DEFAULT_TITLE: &str = "New chat";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn temp_message_id(role: Role) -> String {
    format!("{}_tmp_{}", role.as_str(), uuid::Uuid::new_v4().simple())
}

fn normalize_session(mut session: Session) -> Session {
    let title = session.title.trim();
    session.title = if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.to_string()
    };
    session.messages.truncate(MAX_MESSAGES_PER_SESSION);
    session.messages = session
        .messages
        .iter()
        .map(|m| {
            sanitize::sanitize_message_record(
                &m.id,
                m.role.as_str(),
                &m.text,
                m.time,
                &m.table_summary,
                &m.table_data,
                0,
            )
        })
        .collect();
    session
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    current_session_id: Option<String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn set_current_session_id(&mut self, id: Option<String>) {
        self.current_session_id = id;
    }

    pub fn current_session(&self) -> Option<&Session> {
        let id = self.current_session_id.as_deref()?;
        self.session_by_id(id)
    }

    pub fn session_by_id(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn session_by_id_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Replaces the whole list. The current-session pointer falls back to
    /// the head of the list when its target is gone.
    pub fn set_sessions(&mut self, list: Vec<Session>) {
        self.sessions = list
            .into_iter()
            .take(MAX_STORED_SESSIONS)
            .map(normalize_session)
            .collect();
        let current_still_exists = self
            .current_session_id
            .as_deref()
            .is_some_and(|id| self.sessions.iter().any(|s| s.id == id));
        if !current_still_exists {
            self.current_session_id = self.sessions.first().map(|s| s.id.clone());
        }
    }

    /// Merge-by-id: replace in place when the id is known, else prepend.
    /// Returns the stored session's id.
    pub fn upsert_session(&mut self, session: Session) -> String {
        let session = normalize_session(session);
        let id = session.id.clone();
        match self.sessions.iter().position(|s| s.id == id) {
            Some(index) => self.sessions[index] = session,
            None => self.sessions.insert(0, session),
        }
        self.sessions.truncate(MAX_STORED_SESSIONS);
        if self.current_session_id.is_none() {
            self.current_session_id = Some(id.clone());
        }
        id
    }

    /// Upsert and make current.
    pub fn ensure_session(&mut self, session: Session) -> String {
        let id = self.upsert_session(session);
        self.current_session_id = Some(id.clone());
        id
    }

    pub fn remove_session_local(&mut self, id: &str) {
        let Some(index) = self.sessions.iter().position(|s| s.id == id) else {
            return;
        };
        self.sessions.remove(index);
        if self.current_session_id.as_deref() == Some(id) {
            self.current_session_id = self.sessions.first().map(|s| s.id.clone());
        }
    }

    /// A session without any user message is "empty" and eligible for
    /// silent pruning on navigation away.
    pub fn is_empty_session(&self, id: &str) -> bool {
        self.session_by_id(id)
            .is_some_and(|s| !s.has_user_messages())
    }

    /// Optimistic user turn, appended before the server round trip. Returns
    /// a clone of the stored message, `None` when the session is unknown.
    pub fn add_user_message_local(
        &mut self,
        session_id: &str,
        text: &str,
        id: Option<String>,
        time: Option<i64>,
    ) -> Option<Message> {
        let message = Message {
            id: id
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| temp_message_id(Role::User)),
            role: Role::User,
            text: text.to_string(),
            time: time.unwrap_or_else(now_ms),
            table_summary: Vec::new(),
            table_data: Vec::new(),
        };
        self.append_message(session_id, message)
    }

    pub fn add_bot_message_local(
        &mut self,
        session_id: &str,
        text: &str,
        table_data: Vec<Table>,
        table_summary: Vec<TableSummary>,
    ) -> Option<Message> {
        let message = Message {
            id: temp_message_id(Role::Bot),
            role: Role::Bot,
            text: text.to_string(),
            time: now_ms(),
            table_summary,
            table_data,
        };
        self.append_message(session_id, message)
    }

    fn append_message(&mut self, session_id: &str, message: Message) -> Option<Message> {
        let now = now_ms();
        let session = self.session_by_id_mut(session_id)?;
        session.messages.push(message.clone());
        let len = session.messages.len();
        if len > MAX_MESSAGES_PER_SESSION {
            session.messages.drain(..len - MAX_MESSAGES_PER_SESSION);
        }
        session.updated_at = now;
        Some(message)
    }

    pub fn remove_message(&mut self, session_id: &str, message_id: &str) {
        if let Some(session) = self.session_by_id_mut(session_id) {
            session.messages.retain(|m| m.id != message_id);
        }
    }

    /// Reconciles a chat response against the mirror.
    ///
    /// When the server allocated a replacement session, the local session
    /// under the old id (optimistic message included) is discarded and the
    /// authoritative payload takes its place, so the turn is represented
    /// exactly once. Without an authoritative session payload the bot
    /// message is appended locally with a summary derived from the returned
    /// tables.
    pub fn apply_chat_response(&mut self, initial_session_id: &str, response: &ChatResponse) {
        let session_id = if response.session_id.trim().is_empty() {
            initial_session_id.to_string()
        } else {
            response.session_id.trim().to_string()
        };
        if session_id != initial_session_id {
            self.remove_session_local(initial_session_id);
        }
        self.current_session_id = Some(session_id.clone());

        if let Some(session) = &response.session {
            self.upsert_session(session.clone());
        } else {
            let summary = sanitize::build_summary(&response.tables);
            self.add_bot_message_local(
                &session_id,
                &response.reply,
                response.tables.clone(),
                summary,
            );
        }
    }
}
