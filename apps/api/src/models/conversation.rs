use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    /// Instruction payload sent to the assistant. Persisted, never displayed.
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One persisted conversation message. `id` is generated by the caller and is
/// the idempotency key: saving the same id twice stores one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub analysis_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, analysis_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            analysis_id,
            thread_id: None,
            section: None,
            suggestion: None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.role != MessageRole::System
    }
}

/// Row shape of `assistant_messages`.
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub analysis_id: Uuid,
    pub thread_id: Option<String>,
    pub section: Option<String>,
    pub suggestion: Option<String>,
}

impl TryFrom<MessageRow> for ConversationMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::parse(&row.role)
            .ok_or_else(|| anyhow::anyhow!("Unknown message role '{}' on {}", row.role, row.id))?;
        Ok(ConversationMessage {
            id: row.id,
            role,
            content: row.content,
            timestamp: row.timestamp,
            analysis_id: row.analysis_id,
            thread_id: row.thread_id,
            section: row.section,
            suggestion: row.suggestion,
        })
    }
}

/// Row shape of `assistant_threads`. The newest row per analysis is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetadataRow {
    pub analysis_id: Uuid,
    pub thread_id: String,
    pub assistant_id: Option<String>,
    pub run_id: Option<String>,
    pub section: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
