//! Persistence Gateway: idempotent writes of messages and thread metadata.
//!
//! Correctness under retries relies on the idempotency keys alone:
//! messages dedupe on `id`, thread metadata on `(analysis_id, thread_id)`.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::conversation::{ConversationMessage, MessageRow, ThreadMetadataRow};

/// Parameters for recording which thread (and last run) serves an analysis.
#[derive(Debug, Clone, Copy)]
pub struct ThreadMetadataParams<'a> {
    pub analysis_id: Uuid,
    pub thread_id: &'a str,
    pub assistant_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub section: Option<&'a str>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Inserts the message unless a message with the same id already exists.
    async fn save_message(&self, message: &ConversationMessage) -> Result<()>;

    /// Creates or refreshes the `(analysis_id, thread_id)` row.
    async fn upsert_thread_metadata(&self, params: ThreadMetadataParams<'_>) -> Result<()>;

    /// The canonical thread for an analysis: the most recently created row.
    async fn latest_thread(&self, analysis_id: Uuid) -> Result<Option<ThreadMetadataRow>>;

    /// All messages for an analysis in timestamp order, system rows included.
    async fn messages(&self, analysis_id: Uuid) -> Result<Vec<ConversationMessage>>;
}

/// The user-facing read path. System instruction rows never leave the store.
pub async fn visible_transcript(
    store: &dyn ConversationStore,
    analysis_id: Uuid,
) -> Result<Vec<ConversationMessage>> {
    Ok(store
        .messages(analysis_id)
        .await?
        .into_iter()
        .filter(ConversationMessage::is_visible)
        .collect())
}

/// Saves a message, logging instead of failing. A reply that was already
/// generated must reach the user even if history cannot be written.
pub async fn save_message_best_effort(store: &dyn ConversationStore, message: &ConversationMessage) {
    if let Err(e) = store.save_message(message).await {
        warn!(
            "Failed to persist {} message {} for analysis {}: {e:#}",
            message.role.as_str(),
            message.id,
            message.analysis_id
        );
    }
}

pub async fn upsert_thread_metadata_best_effort(
    store: &dyn ConversationStore,
    params: ThreadMetadataParams<'_>,
) {
    if let Err(e) = store.upsert_thread_metadata(params).await {
        warn!(
            "Failed to record thread {} for analysis {}: {e:#}",
            params.thread_id, params.analysis_id
        );
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn save_message(&self, message: &ConversationMessage) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO assistant_messages
                (id, role, content, timestamp, analysis_id, thread_id, section, suggestion)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(message.analysis_id)
        .bind(&message.thread_id)
        .bind(&message.section)
        .bind(&message.suggestion)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Message {} already stored, skipping", message.id);
        }
        Ok(())
    }

    async fn upsert_thread_metadata(&self, params: ThreadMetadataParams<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assistant_threads
                (analysis_id, thread_id, assistant_id, run_id, section, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, now(), now())
            ON CONFLICT (analysis_id, thread_id) DO UPDATE SET
                assistant_id = COALESCE(EXCLUDED.assistant_id, assistant_threads.assistant_id),
                run_id       = COALESCE(EXCLUDED.run_id, assistant_threads.run_id),
                section      = COALESCE(EXCLUDED.section, assistant_threads.section),
                updated_at   = now()
            "#,
        )
        .bind(params.analysis_id)
        .bind(params.thread_id)
        .bind(params.assistant_id)
        .bind(params.run_id)
        .bind(params.section)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_thread(&self, analysis_id: Uuid) -> Result<Option<ThreadMetadataRow>> {
        Ok(sqlx::query_as::<_, ThreadMetadataRow>(
            r#"
            SELECT analysis_id, thread_id, assistant_id, run_id, section, created_at, updated_at
            FROM assistant_threads
            WHERE analysis_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn messages(&self, analysis_id: Uuid) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, role, content, timestamp, analysis_id, thread_id, section, suggestion
            FROM assistant_messages
            WHERE analysis_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConversationMessage::try_from).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryTables {
    messages: Vec<ConversationMessage>,
    threads: Vec<ThreadMetadataRow>,
}

/// Process-local store with the same idempotency rules as the Postgres one.
#[derive(Default)]
pub struct InMemoryConversationStore {
    tables: Mutex<MemoryTables>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("conversation store lock poisoned"))
    }

    pub fn message_count(&self) -> Result<usize> {
        Ok(self.tables()?.messages.len())
    }

    pub fn thread_rows(&self, analysis_id: Uuid) -> Result<Vec<ThreadMetadataRow>> {
        Ok(self
            .tables()?
            .threads
            .iter()
            .filter(|t| t.analysis_id == analysis_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save_message(&self, message: &ConversationMessage) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.messages.iter().any(|m| m.id == message.id) {
            debug!("Message {} already stored, skipping", message.id);
            return Ok(());
        }
        tables.messages.push(message.clone());
        Ok(())
    }

    async fn upsert_thread_metadata(&self, params: ThreadMetadataParams<'_>) -> Result<()> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        match tables
            .threads
            .iter_mut()
            .find(|t| t.analysis_id == params.analysis_id && t.thread_id == params.thread_id)
        {
            Some(row) => {
                if let Some(assistant_id) = params.assistant_id {
                    row.assistant_id = Some(assistant_id.to_string());
                }
                if let Some(run_id) = params.run_id {
                    row.run_id = Some(run_id.to_string());
                }
                if let Some(section) = params.section {
                    row.section = Some(section.to_string());
                }
                row.updated_at = now.max(row.updated_at);
            }
            None => tables.threads.push(ThreadMetadataRow {
                analysis_id: params.analysis_id,
                thread_id: params.thread_id.to_string(),
                assistant_id: params.assistant_id.map(str::to_string),
                run_id: params.run_id.map(str::to_string),
                section: params.section.map(str::to_string),
                created_at: now,
                updated_at: now,
            }),
        }
        Ok(())
    }

    async fn latest_thread(&self, analysis_id: Uuid) -> Result<Option<ThreadMetadataRow>> {
        // max_by_key keeps the last maximum, so equal timestamps favour the later insert.
        Ok(self
            .tables()?
            .threads
            .iter()
            .filter(|t| t.analysis_id == analysis_id)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn messages(&self, analysis_id: Uuid) -> Result<Vec<ConversationMessage>> {
        let mut messages: Vec<_> = self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.analysis_id == analysis_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }
}
