use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::assistant_client::AssistantRuntime;
use crate::conversation::invoker::PollPolicy;
use crate::conversation::persistence::ConversationStore;
use crate::conversation::resume_store::ResumeStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<dyn AssistantRuntime>,
    pub store: Arc<dyn ConversationStore>,
    pub resumes: Arc<dyn ResumeStore>,
    pub poll_policy: PollPolicy,
    /// Cancelled on shutdown; each turn polls under a child token.
    pub shutdown: CancellationToken,
}
