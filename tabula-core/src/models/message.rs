use serde::{Deserialize, Serialize};

use super::table::{Table, TableSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }

    /// Anything that is not explicitly a user message is treated as bot
    /// output when replaying stored rows.
    pub fn from_stored(raw: &str) -> Self {
        if raw == "user" {
            Role::User
        } else {
            Role::Bot
        }
    }
}

/// A single conversation turn. Immutable once written; only the owning
/// session's `updated_at` is touched afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// Caller-supplied timestamp in epoch milliseconds.
    pub time: i64,
    #[serde(default)]
    pub table_summary: Vec<TableSummary>,
    #[serde(default)]
    pub table_data: Vec<Table>,
}
