use serde::{Deserialize, Serialize};

use super::message::Message;

/// A conversation owned by exactly one opaque client identifier for its
/// entire lifetime. The owner never travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    #[serde(skip)]
    pub owner: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn has_user_messages(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == super::message::Role::User)
    }
}
