//! Assistant client: the single point of entry for all assistant runtime calls.
//!
//! No other module talks to the Assistants API directly. The orchestrator only
//! sees the `AssistantRuntime` trait, so tests can swap in a scripted runtime.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;

const MAX_RETRIES: u32 = 3;
const LIST_MESSAGES_LIMIT: u32 = 20;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("Thread is busy with an active run: {0}")]
    ThreadBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AssistantError {
    /// The runtime rejected the call because another run holds the thread.
    pub fn is_thread_busy(&self) -> bool {
        matches!(self, AssistantError::ThreadBusy(_))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Runtime data model
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Unknown => "unknown",
        }
    }

    /// Terminal states other than `completed`. No tools are registered, so a
    /// run asking for tool outputs can never finish and counts as failed.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete
                | RunStatus::RequiresAction
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunLastError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunLastError>,
}

/// A message as listed from a thread, flattened to its text parts.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: String,
    /// Unix seconds, as reported by the runtime.
    pub created_at: i64,
    pub run_id: Option<String>,
    pub text: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Trait
// ────────────────────────────────────────────────────────────────────────────

/// The conversation service the orchestrator drives. Carried in `AppState`
/// as `Arc<dyn AssistantRuntime>`.
#[async_trait]
pub trait AssistantRuntime: Send + Sync {
    fn assistant_id(&self) -> &str;

    async fn create_thread(&self) -> Result<String, AssistantError>;

    /// Succeeds only if the thread still exists.
    async fn retrieve_thread(&self, thread_id: &str) -> Result<(), AssistantError>;

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<(), AssistantError>;

    /// Starts a run. `instructions` override the assistant's instructions for
    /// this run only and are not written into the thread.
    async fn create_run(&self, thread_id: &str, instructions: &str) -> Result<Run, AssistantError>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError>;

    /// Most recent messages first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AssistantError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    id: String,
    role: String,
    created_at: i64,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

impl From<MessageObject> for ThreadMessage {
    fn from(message: MessageObject) -> Self {
        let text = message
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text.as_ref().map(|t| t.value.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        ThreadMessage {
            id: message.id,
            role: message.role,
            created_at: message.created_at,
            run_id: message.run_id,
            text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// ────────────────────────────────────────────────────────────────────────────
// OpenAI Assistants v2 client
// ────────────────────────────────────────────────────────────────────────────

/// HTTP client for the OpenAI Assistants API with retry on rate limits.
#[derive(Clone)]
pub struct OpenAiAssistantClient {
    client: Client,
    api_key: String,
    base_url: String,
    assistant_id: String,
}

impl OpenAiAssistantClient {
    pub fn new(api_key: String, base_url: String, assistant_id: String) -> Result<Self, AssistantError> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            assistant_id,
        })
    }

    /// Sends one request, retrying with exponential backoff.
    /// 429 is always retried since the runtime did not process the call.
    /// 5xx and transport errors are retried only for GETs so a message or run
    /// is never created twice.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, AssistantError> {
        let url = format!("{}{}", self.base_url, path);
        let idempotent = method == Method::GET;
        let mut last_error: Option<AssistantError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Assistant call {} {} attempt {} failed, retrying after {}ms...",
                    method,
                    path,
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let mut builder = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key)
                .header("OpenAI-Beta", "assistants=v2");
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) if idempotent => {
                    last_error = Some(AssistantError::Http(e));
                    continue;
                }
                Err(e) => return Err(AssistantError::Http(e)),
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || (idempotent && status.is_server_error()) {
                let body = response.text().await.unwrap_or_default();
                warn!("Assistant API returned {}: {}", status, body);
                last_error = Some(AssistantError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(classify_error(status, message));
            }

            let bytes = response.bytes().await?;
            debug!("Assistant call {} {} succeeded", method, path);
            return Ok(serde_json::from_slice(&bytes)?);
        }

        Err(last_error.unwrap_or(AssistantError::RateLimited {
            retries: MAX_RETRIES,
        }))
    }
}

fn classify_error(status: StatusCode, message: String) -> AssistantError {
    if status == StatusCode::NOT_FOUND {
        return AssistantError::NotFound(message);
    }
    if status == StatusCode::BAD_REQUEST && is_active_run_message(&message) {
        return AssistantError::ThreadBusy(message);
    }
    AssistantError::Api {
        status: status.as_u16(),
        message,
    }
}

/// The runtime reports overlapping runs as e.g.
/// "Can't add messages to thread_x while a run run_y is active."
fn is_active_run_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("while a run") || lower.contains("already has an active run")
}

#[async_trait]
impl AssistantRuntime for OpenAiAssistantClient {
    fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    async fn create_thread(&self) -> Result<String, AssistantError> {
        let thread: ThreadObject = self.request(Method::POST, "/threads", Some(json!({}))).await?;
        Ok(thread.id)
    }

    async fn retrieve_thread(&self, thread_id: &str) -> Result<(), AssistantError> {
        let _: ThreadObject = self
            .request(Method::GET, &format!("/threads/{thread_id}"), None)
            .await?;
        Ok(())
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<(), AssistantError> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                &format!("/threads/{thread_id}/messages"),
                Some(json!({ "role": "user", "content": content })),
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, instructions: &str) -> Result<Run, AssistantError> {
        self.request(
            Method::POST,
            &format!("/threads/{thread_id}/runs"),
            Some(json!({
                "assistant_id": self.assistant_id,
                "instructions": instructions,
            })),
        )
        .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError> {
        self.request(
            Method::GET,
            &format!("/threads/{thread_id}/runs/{run_id}"),
            None,
        )
        .await
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AssistantError> {
        let list: MessageList = self
            .request(
                Method::GET,
                &format!("/threads/{thread_id}/messages?order=desc&limit={LIST_MESSAGES_LIMIT}"),
                None,
            )
            .await?;
        Ok(list.data.into_iter().map(ThreadMessage::from).collect())
    }
}
