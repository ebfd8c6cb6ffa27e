//! One assistant turn, server side.
//!
//! Flow: validate → pick thread (caller id → latest metadata → new) →
//!       write context into the thread if it is new → record the thread →
//!       persist user + system rows → invoke → interpret → persist reply + metadata.
//!
//! Invocation failures and transient thread lookup errors reach the caller.
//! Missing threads, context lookups and persistence errors are absorbed and logged.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assistant_client::prompts::{
    ASSISTANT_BASE, CONTEXT_MESSAGE_HEADER, NO_CONTEXT_NOTICE, PRIOR_CONTEXT_NOTICE,
    SUGGESTION_FORMAT,
};
use crate::assistant_client::{AssistantError, AssistantRuntime};
use crate::conversation::context::{resolve_context, ContextLevel, ContextResolution};
use crate::conversation::identity::parse_uuid_v4;
use crate::conversation::interpreter::interpret;
use crate::conversation::invoker::{invoke, InvokeError};
use crate::conversation::locator::locate_thread;
use crate::conversation::persistence::{
    save_message_best_effort, upsert_thread_metadata_best_effort, ConversationStore,
    ThreadMetadataParams,
};
use crate::models::conversation::{ConversationMessage, MessageRole};
use crate::state::AppState;

/// Fallback text shown when a turn fails.
pub const FAILED_TURN_MESSAGE: &str =
    "Sorry, I couldn't complete that request. Please try again in a moment.";
const BUSY_TURN_MESSAGE: &str =
    "I'm still working on a previous request in this conversation. Please retry in a moment.";

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

/// Request body for `POST /api/v1/assistant-turn`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantTurnRequest {
    pub message: String,
    pub analysis_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Only sent on the first turn of a thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_content: Option<String>,
    /// Caller-generated id of the user message; retries reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

/// Response body. Failures keep status 200 and set `error`, with a
/// user-safe `message` so the UI always has something to render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantTurnResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_level: Option<ContextLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl AssistantTurnResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conversation thread unavailable: {0}")]
    ThreadUnavailable(#[source] AssistantError),

    #[error("assistant turn failed on thread {thread_id}: {source}")]
    Invoke {
        thread_id: String,
        #[source]
        source: InvokeError,
    },
}

impl TurnError {
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            TurnError::Invoke { thread_id, .. } => Some(thread_id),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TurnError::Validation(_))
    }

    pub fn into_response(self) -> AssistantTurnResponse {
        let message = match &self {
            TurnError::Validation(msg) => msg.clone(),
            TurnError::Invoke { source, .. } if source.is_thread_busy() => {
                BUSY_TURN_MESSAGE.to_string()
            }
            _ => FAILED_TURN_MESSAGE.to_string(),
        };
        AssistantTurnResponse {
            message,
            thread_id: self.thread_id().map(str::to_string),
            run_id: match &self {
                TurnError::Invoke { source, .. } => source.run_id().map(str::to_string),
                _ => None,
            },
            retryable: self.is_retryable(),
            error: Some(self.to_string()),
            ..Default::default()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Turn pipeline
// ────────────────────────────────────────────────────────────────────────────

/// Runs one turn and always produces a response body.
pub async fn handle_turn(
    state: &AppState,
    request: AssistantTurnRequest,
    cancel: &CancellationToken,
) -> AssistantTurnResponse {
    match run_turn(state, request, cancel).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                TurnError::Validation(msg) => warn!("Rejected assistant turn: {msg}"),
                other => error!("Assistant turn failed: {other}"),
            }
            e.into_response()
        }
    }
}

pub async fn run_turn(
    state: &AppState,
    request: AssistantTurnRequest,
    cancel: &CancellationToken,
) -> Result<AssistantTurnResponse, TurnError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(TurnError::Validation("message cannot be empty".to_string()));
    }
    let analysis_id = parse_uuid_v4(&request.analysis_id).ok_or_else(|| {
        TurnError::Validation(format!(
            "analysisId must be a UUID, got '{}'",
            request.analysis_id
        ))
    })?;
    let section = request
        .current_section
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let (thread_id, fresh_thread) = select_thread(
        state.runtime.as_ref(),
        state.store.as_ref(),
        analysis_id,
        request.thread_id.as_deref(),
    )
    .await?;

    let context = if fresh_thread || request.resume_content.is_some() {
        Some(
            resolve_context(
                state.resumes.as_ref(),
                analysis_id,
                section,
                request.resume_content.as_deref(),
            )
            .await,
        )
    } else {
        None
    };
    let instructions = build_instructions(section, context.as_ref());

    let store = state.store.as_ref();
    let assistant_id = state.runtime.assistant_id().to_string();

    // Seed context lives in the thread history; instructions last one run.
    // A new thread is recorded only after seeding, so a failed seed is
    // retried on a fresh thread.
    if let Some(seed) = context.as_ref().and_then(context_message) {
        state
            .runtime
            .add_user_message(&thread_id, &seed)
            .await
            .map_err(TurnError::ThreadUnavailable)?;
        debug!("Seeded thread {thread_id} with context");
    }
    if fresh_thread {
        upsert_thread_metadata_best_effort(
            store,
            ThreadMetadataParams {
                analysis_id,
                thread_id: &thread_id,
                assistant_id: Some(&assistant_id),
                run_id: None,
                section,
            },
        )
        .await;
    }

    let mut user_message = ConversationMessage::new(MessageRole::User, message, analysis_id);
    if let Some(id) = request.message_id {
        user_message.id = id;
    }
    user_message.thread_id = Some(thread_id.clone());
    user_message.section = section.map(str::to_string);
    save_message_best_effort(store, &user_message).await;

    let mut system_message =
        ConversationMessage::new(MessageRole::System, instructions.as_str(), analysis_id);
    system_message.thread_id = Some(thread_id.clone());
    system_message.section = section.map(str::to_string);
    save_message_best_effort(store, &system_message).await;

    let invocation = invoke(
        state.runtime.as_ref(),
        &thread_id,
        message,
        &instructions,
        state.poll_policy,
        cancel,
    )
    .await;

    let invocation = match invocation {
        Ok(invocation) => invocation,
        Err(source) => {
            // Keep the thread discoverable so the retry lands on it.
            upsert_thread_metadata_best_effort(
                store,
                ThreadMetadataParams {
                    analysis_id,
                    thread_id: &thread_id,
                    assistant_id: Some(&assistant_id),
                    run_id: source.run_id(),
                    section,
                },
            )
            .await;
            return Err(TurnError::Invoke { thread_id, source });
        }
    };

    let reply = interpret(&invocation.text);
    let mut assistant_message =
        ConversationMessage::new(MessageRole::Assistant, reply.display_text.as_str(), analysis_id);
    assistant_message.timestamp = Utc::now().max(user_message.timestamp);
    assistant_message.thread_id = Some(thread_id.clone());
    assistant_message.section = section.map(str::to_string);
    assistant_message.suggestion = reply.suggestion.clone();
    save_message_best_effort(store, &assistant_message).await;

    upsert_thread_metadata_best_effort(
        store,
        ThreadMetadataParams {
            analysis_id,
            thread_id: &thread_id,
            assistant_id: Some(&assistant_id),
            run_id: Some(&invocation.run_id),
            section,
        },
    )
    .await;

    info!(
        "Assistant turn completed: analysis={analysis_id} thread={thread_id} run={} suggestion={}",
        invocation.run_id,
        reply.suggestion.is_some()
    );

    Ok(AssistantTurnResponse {
        message: reply.display_text,
        suggestion: reply.suggestion,
        thread_id: Some(thread_id),
        assistant_id: Some(assistant_id),
        run_id: Some(invocation.run_id),
        system_prompt: Some(instructions),
        reply_id: Some(assistant_message.id),
        context_level: context.map(|c| c.level),
        error: None,
        retryable: false,
    })
}

/// Picks the thread for this turn. Returns `(thread_id, created_now)`.
///
/// A caller-supplied or stored thread is used only if the runtime still knows
/// it. Only a thread the runtime reports as missing is replaced; other lookup
/// errors fail the turn. The caller must adopt the returned id.
async fn select_thread(
    runtime: &dyn AssistantRuntime,
    store: &dyn ConversationStore,
    analysis_id: Uuid,
    requested: Option<&str>,
) -> Result<(String, bool), TurnError> {
    let requested = requested.map(str::trim).filter(|t| !t.is_empty());

    let candidate = match requested {
        Some(thread_id) => Some(thread_id.to_string()),
        None => match locate_thread(store, analysis_id).await {
            Ok(location) => location.thread_id,
            Err(e) => {
                warn!("Thread lookup for analysis {analysis_id} failed: {e:#}");
                None
            }
        },
    };

    if let Some(thread_id) = candidate {
        match runtime.retrieve_thread(&thread_id).await {
            Ok(()) => return Ok((thread_id, false)),
            Err(AssistantError::NotFound(reason)) => {
                warn!("Thread {thread_id} no longer exists, starting a new one: {reason}")
            }
            // Transient failures keep the thread; only a missing one is replaced.
            Err(e) => return Err(TurnError::ThreadUnavailable(e)),
        }
    }

    let thread_id = runtime
        .create_thread()
        .await
        .map_err(TurnError::ThreadUnavailable)?;
    info!("Created thread {thread_id} for analysis {analysis_id}");

    Ok((thread_id, true))
}

/// The message that writes seed context into a thread, or `None` when
/// there is nothing to seed.
pub fn context_message(context: &ContextResolution) -> Option<String> {
    if context.level == ContextLevel::None {
        return None;
    }
    let mut parts = vec![CONTEXT_MESSAGE_HEADER.to_string()];
    if let Some(resume) = &context.resume_content {
        parts.push(format!("Resume content:\n{resume}"));
    }
    if let Some(job) = &context.job_description {
        parts.push(format!("Target job description:\n{job}"));
    }
    Some(parts.join("\n\n"))
}

/// Builds the per-run instruction override. `context` is `None` on turns of
/// an already-seeded thread.
pub fn build_instructions(section: Option<&str>, context: Option<&ContextResolution>) -> String {
    let mut parts = vec![ASSISTANT_BASE.to_string(), SUGGESTION_FORMAT.to_string()];

    if let Some(section) = section {
        parts.push(format!(
            "The user is currently editing the \"{section}\" section of their resume."
        ));
    }

    match context {
        None => parts.push(PRIOR_CONTEXT_NOTICE.to_string()),
        Some(context) if context.level == ContextLevel::None => {
            parts.push(NO_CONTEXT_NOTICE.to_string())
        }
        Some(context) => {
            if let Some(resume) = &context.resume_content {
                parts.push(format!("Resume content:\n{resume}"));
            }
            if let Some(job) = &context.job_description {
                parts.push(format!("Target job description:\n{job}"));
            }
        }
    }

    parts.join("\n\n")
}
