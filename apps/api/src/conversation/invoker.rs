//! Assistant Invoker: one turn against a thread, polled to completion.
//!
//! Flow: add user message → create run (per-run instructions) → poll status
//! every `interval` for at most `max_polls` → read the newest assistant reply.
//!
//! Completion is polled because the runtime offers no delivery guarantee to
//! this service. The poll ceiling is the hard bound on turn latency.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assistant_client::{AssistantError, AssistantRuntime, RunStatus, ThreadMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_polls: 60,
        }
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to add message to thread: {0}")]
    AddMessage(#[source] AssistantError),

    #[error("failed to start run: {0}")]
    StartRun(#[source] AssistantError),

    #[error("failed to poll run {run_id}: {source}")]
    Poll {
        run_id: String,
        #[source]
        source: AssistantError,
    },

    #[error("run {run_id} ended with status {status}{}", reason_suffix(.reason))]
    RunFailed {
        run_id: String,
        status: RunStatus,
        reason: Option<String>,
    },

    #[error("run {run_id} timed out after {polls} polls")]
    TimedOut { run_id: String, polls: u32 },

    #[error("failed to list thread messages: {0}")]
    ListMessages(#[source] AssistantError),

    #[error("run completed without an assistant reply")]
    EmptyReply,

    #[error("invocation cancelled")]
    Cancelled,
}

impl InvokeError {
    /// Another run holds the thread (e.g. a second tab). Worth retrying.
    pub fn is_thread_busy(&self) -> bool {
        match self {
            InvokeError::AddMessage(e) | InvokeError::StartRun(e) => e.is_thread_busy(),
            _ => false,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            InvokeError::Poll { run_id, .. }
            | InvokeError::RunFailed { run_id, .. }
            | InvokeError::TimedOut { run_id, .. } => Some(run_id),
            _ => None,
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: String,
    /// Raw assistant text, before interpretation.
    pub text: String,
    pub raw_messages: Vec<ThreadMessage>,
}

/// Runs one assistant turn on `thread_id`.
///
/// `cancel` is checked between poll iterations; a cancelled invocation leaves
/// the run going on the runtime side.
pub async fn invoke(
    runtime: &dyn AssistantRuntime,
    thread_id: &str,
    user_message: &str,
    instructions: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<Invocation, InvokeError> {
    runtime
        .add_user_message(thread_id, user_message)
        .await
        .map_err(InvokeError::AddMessage)?;

    let run = runtime
        .create_run(thread_id, instructions)
        .await
        .map_err(InvokeError::StartRun)?;
    let run_id = run.id;
    info!("Started run {run_id} on thread {thread_id}");

    for poll in 1..=policy.max_polls {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Run {run_id} abandoned after {} polls: cancelled", poll - 1);
                return Err(InvokeError::Cancelled);
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }

        let run = runtime
            .get_run(thread_id, &run_id)
            .await
            .map_err(|source| InvokeError::Poll {
                run_id: run_id.clone(),
                source,
            })?;
        debug!("Run {run_id} poll {poll}/{}: {}", policy.max_polls, run.status);

        if run.status == RunStatus::Completed {
            let raw_messages = runtime
                .list_messages(thread_id)
                .await
                .map_err(InvokeError::ListMessages)?;
            let text = latest_assistant_text(&raw_messages).ok_or(InvokeError::EmptyReply)?;
            info!("Run {run_id} completed after {poll} polls");
            return Ok(Invocation {
                run_id,
                text,
                raw_messages,
            });
        }

        if run.status.is_failure() {
            let reason = run.last_error.and_then(|e| e.message.or(e.code));
            return Err(InvokeError::RunFailed {
                run_id,
                status: run.status,
                reason,
            });
        }
    }

    Err(InvokeError::TimedOut {
        run_id,
        polls: policy.max_polls,
    })
}

/// The newest assistant message by `created_at`; on equal timestamps the one
/// listed first wins. Empty texts are skipped.
fn latest_assistant_text(messages: &[ThreadMessage]) -> Option<String> {
    let mut latest: Option<&ThreadMessage> = None;
    for message in messages
        .iter()
        .filter(|m| m.role == "assistant" && !m.text.trim().is_empty())
    {
        if latest.map_or(true, |l| message.created_at > l.created_at) {
            latest = Some(message);
        }
    }
    latest.map(|m| m.text.clone())
}
