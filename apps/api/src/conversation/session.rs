//! Client conversation state machine, one instance per UI surface.
//!
//! `Idle → Sending → Idle` on success, `Idle → Sending → Error` on failure;
//! `Error` accepts `send` and `retry` like `Idle`.
//!
//! At most one turn is in flight per session: `send` or `retry` while
//! `Sending`, or while `navigate` is still locating the thread, is rejected,
//! never fired. The session owns the cached thread id
//! and the fire-once context gate; the server's thread id always wins.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::context::{fetch_once, FireOnce};
use crate::conversation::identity::{resolve_identity, IdentitySources};
use crate::conversation::locator::ThreadLocation;
use crate::conversation::transport::TurnBackend;
use crate::conversation::turn::{AssistantTurnRequest, FAILED_TURN_MESSAGE};
use crate::models::conversation::{ConversationMessage, MessageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Sending,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub suggestion: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Placeholder reply standing in for a failed turn.
    pub is_error: bool,
}

impl TranscriptEntry {
    fn user(content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: MessageRole::User,
            content: content.to_string(),
            suggestion: None,
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    fn assistant(id: Option<Uuid>, content: String, suggestion: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(Uuid::new_v4),
            role: MessageRole::Assistant,
            content,
            suggestion,
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    fn error_placeholder(content: String) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(None, content, None)
        }
    }
}

impl From<ConversationMessage> for TranscriptEntry {
    fn from(message: ConversationMessage) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            suggestion: message.suggestion,
            timestamp: message.timestamp,
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BlankMessage,
    /// No analysis id could be resolved from the current location.
    NoIdentity,
    /// A turn is already in flight.
    Busy,
    /// The conversation's thread and history are still being looked up.
    Loading,
    NothingToRetry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Replied(TranscriptEntry),
    Failed { message: String, retryable: bool },
    Rejected(Rejection),
    /// The user navigated away before the turn finished; nothing was applied.
    Discarded,
}

struct SessionState {
    analysis_id: Option<Uuid>,
    section: Option<String>,
    thread_id: Option<String>,
    context_gate: Arc<FireOnce>,
    transcript: Vec<TranscriptEntry>,
    status: SessionStatus,
    /// Set while `navigate` locates the thread for the current identity.
    locating: bool,
    last_error: Option<String>,
    /// Last user message as `(id, text)`; `retry` resubmits it verbatim.
    last_user: Option<(Uuid, String)>,
    /// Bumped on every identity change; results from older epochs are dropped.
    epoch: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            analysis_id: None,
            section: None,
            thread_id: None,
            context_gate: Arc::new(FireOnce::new()),
            transcript: Vec::new(),
            status: SessionStatus::Idle,
            locating: false,
            last_error: None,
            last_user: None,
            epoch: 0,
        }
    }

    fn reset(&mut self, analysis_id: Option<Uuid>) {
        let epoch = self.epoch + 1;
        let section = self.section.take();
        *self = Self::new();
        self.analysis_id = analysis_id;
        self.section = section;
        self.epoch = epoch;
    }

    fn in_flight(&self) -> Option<Rejection> {
        if self.status == SessionStatus::Sending {
            Some(Rejection::Busy)
        } else if self.locating {
            Some(Rejection::Loading)
        } else {
            None
        }
    }

    fn begin_turn(&mut self, analysis_id: Uuid, message_id: Uuid, message: String) -> PendingTurn {
        self.status = SessionStatus::Sending;
        self.last_error = None;
        PendingTurn {
            epoch: self.epoch,
            analysis_id,
            message_id,
            message,
            thread_id: self.thread_id.clone(),
            section: self.section.clone(),
            context_gate: self.context_gate.clone(),
        }
    }

    fn fail(&mut self, message: String, retryable: bool, detail: String) -> TurnOutcome {
        self.transcript
            .push(TranscriptEntry::error_placeholder(message.clone()));
        self.status = SessionStatus::Error;
        self.last_error = Some(detail);
        TurnOutcome::Failed { message, retryable }
    }
}

struct PendingTurn {
    epoch: u64,
    analysis_id: Uuid,
    message_id: Uuid,
    message: String,
    thread_id: Option<String>,
    section: Option<String>,
    context_gate: Arc<FireOnce>,
}

pub struct ConversationSession {
    backend: Arc<dyn TurnBackend>,
    state: Mutex<SessionState>,
}

impl ConversationSession {
    pub fn new(backend: Arc<dyn TurnBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(SessionState::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-resolves the identity key after a location change. When it changes,
    /// per-conversation state is reset and the existing thread and transcript
    /// are loaded. Returns the resolved key.
    pub async fn navigate(&self, sources: &IdentitySources<'_>) -> Option<Uuid> {
        let resolved = resolve_identity(sources);
        let epoch = {
            let mut state = self.state();
            if state.analysis_id == resolved {
                return resolved;
            }
            state.reset(resolved);
            state.locating = resolved.is_some();
            state.epoch
        };
        let analysis_id = resolved?;

        let location = self
            .backend
            .locate_thread(analysis_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Thread lookup for analysis {analysis_id} failed, will start a new thread: {e:#}");
                ThreadLocation::new_thread()
            });
        let history = self
            .backend
            .load_transcript(analysis_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Transcript load for analysis {analysis_id} failed: {e:#}");
                Vec::new()
            });

        let mut state = self.state();
        if state.epoch != epoch {
            return resolved;
        }
        state.locating = false;
        if location.already_seeded {
            state.context_gate.mark_fired();
        }
        state.thread_id = location.thread_id;
        state.transcript = history
            .into_iter()
            .filter(ConversationMessage::is_visible)
            .map(TranscriptEntry::from)
            .collect();
        resolved
    }

    /// Detaches from the current conversation. An in-flight turn keeps
    /// running on the server but its result is discarded.
    pub fn leave(&self) {
        self.state().reset(None);
    }

    pub fn set_section(&self, section: Option<&str>) {
        self.state().section = section.map(str::to_string);
    }

    pub async fn send(&self, text: &str) -> TurnOutcome {
        let turn = {
            let mut state = self.state();
            if text.trim().is_empty() {
                return TurnOutcome::Rejected(Rejection::BlankMessage);
            }
            let Some(analysis_id) = state.analysis_id else {
                return TurnOutcome::Rejected(Rejection::NoIdentity);
            };
            if let Some(rejection) = state.in_flight() {
                return TurnOutcome::Rejected(rejection);
            }
            let entry = TranscriptEntry::user(text);
            state.last_user = Some((entry.id, text.to_string()));
            let message_id = entry.id;
            state.transcript.push(entry);
            state.begin_turn(analysis_id, message_id, text.to_string())
        };
        self.dispatch(turn).await
    }

    /// Resubmits the last user message. Any reply already shown for that turn
    /// (error placeholder or answer) is replaced, not duplicated.
    pub async fn retry(&self) -> TurnOutcome {
        let turn = {
            let mut state = self.state();
            let Some(analysis_id) = state.analysis_id else {
                return TurnOutcome::Rejected(Rejection::NoIdentity);
            };
            if let Some(rejection) = state.in_flight() {
                return TurnOutcome::Rejected(rejection);
            }
            let Some((message_id, message)) = state.last_user.clone() else {
                return TurnOutcome::Rejected(Rejection::NothingToRetry);
            };
            match state.transcript.iter().rposition(|e| e.id == message_id) {
                Some(pos) => state.transcript.truncate(pos + 1),
                None => state.transcript.push(TranscriptEntry {
                    id: message_id,
                    ..TranscriptEntry::user(&message)
                }),
            }
            state.begin_turn(analysis_id, message_id, message)
        };
        self.dispatch(turn).await
    }

    async fn dispatch(&self, turn: PendingTurn) -> TurnOutcome {
        let resume_content = fetch_once(&turn.context_gate, || {
            self.backend
                .fetch_context(turn.analysis_id, turn.section.as_deref())
        })
        .await
        .and_then(|context| context.resume_content);

        let request = AssistantTurnRequest {
            message: turn.message,
            analysis_id: turn.analysis_id.to_string(),
            current_section: turn.section,
            thread_id: turn.thread_id,
            resume_content,
            message_id: Some(turn.message_id),
        };
        let result = self.backend.send_turn(&request).await;

        let mut state = self.state();
        if state.epoch != turn.epoch {
            debug!(
                "Dropping reply for analysis {} after navigation",
                turn.analysis_id
            );
            return TurnOutcome::Discarded;
        }

        match result {
            Ok(response) => {
                // Server is authoritative for thread identity.
                if let Some(thread_id) = &response.thread_id {
                    state.thread_id = Some(thread_id.clone());
                }
                match response.error {
                    Some(detail) => state.fail(response.message, response.retryable, detail),
                    None => {
                        let entry = TranscriptEntry::assistant(
                            response.reply_id,
                            response.message,
                            response.suggestion,
                        );
                        state.transcript.push(entry.clone());
                        state.status = SessionStatus::Idle;
                        TurnOutcome::Replied(entry)
                    }
                }
            }
            Err(e) => {
                warn!("Assistant turn request failed: {e:#}");
                state.fail(FAILED_TURN_MESSAGE.to_string(), true, format!("{e:#}"))
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn analysis_id(&self) -> Option<Uuid> {
        self.state().analysis_id
    }

    pub fn thread_id(&self) -> Option<String> {
        self.state().thread_id.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn context_seeded(&self) -> bool {
        self.state().context_gate.has_fired()
    }

    /// Renderable transcript. Never contains system messages.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.state()
            .transcript
            .iter()
            .filter(|e| e.role != MessageRole::System)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::conversation::context::{resolve_context, ContextResolution};
    use crate::conversation::locator::locate_thread;
    use crate::conversation::persistence::visible_transcript;
    use crate::conversation::testing::{harness, ScriptedRuntime, StubResumeStore};
    use crate::conversation::turn::{handle_turn, AssistantTurnResponse};
    use crate::state::AppState;

    const KEY: &str = "3f2b8c1e-9d4a-4b6e-8f1a-2c3d4e5f6a7b";
    const OTHER: &str = "7a6b5c4d-3e2f-4a1b-9c8d-7e6f5a4b3c2d";

    fn ok_reply(text: &str, thread_id: &str) -> AssistantTurnResponse {
        AssistantTurnResponse {
            message: text.to_string(),
            thread_id: Some(thread_id.to_string()),
            ..Default::default()
        }
    }

    fn error_reply() -> AssistantTurnResponse {
        AssistantTurnResponse {
            message: FAILED_TURN_MESSAGE.to_string(),
            thread_id: Some("thread_1".to_string()),
            error: Some("run run_1 timed out after 60 polls".to_string()),
            retryable: true,
            ..Default::default()
        }
    }

    /// Backend with scripted replies; optionally parks each send, or each
    /// thread lookup, until released.
    struct FakeBackend {
        location: ThreadLocation,
        replies: Mutex<VecDeque<Result<AssistantTurnResponse>>>,
        requests: Mutex<Vec<AssistantTurnRequest>>,
        context_calls: Mutex<u32>,
        park: bool,
        park_locate: bool,
        entered: Notify,
        release: Notify,
    }

    impl FakeBackend {
        fn new(location: ThreadLocation) -> Self {
            Self {
                location,
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                context_calls: Mutex::new(0),
                park: false,
                park_locate: false,
                entered: Notify::new(),
                release: Notify::new(),
            }
        }

        fn parked(location: ThreadLocation) -> Self {
            Self {
                park: true,
                ..Self::new(location)
            }
        }

        fn slow_to_locate(location: ThreadLocation) -> Self {
            Self {
                park_locate: true,
                ..Self::new(location)
            }
        }

        fn queue(&self, reply: Result<AssistantTurnResponse>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn requests(&self) -> Vec<AssistantTurnRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TurnBackend for FakeBackend {
        async fn locate_thread(&self, _analysis_id: Uuid) -> Result<ThreadLocation> {
            if self.park_locate {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(self.location.clone())
        }

        async fn fetch_context(
            &self,
            _analysis_id: Uuid,
            _section: Option<&str>,
        ) -> Result<Option<ContextResolution>> {
            *self.context_calls.lock().unwrap() += 1;
            Ok(Some(ContextResolution::from_parts(
                Some("Resume body".to_string()),
                None,
            )))
        }

        async fn load_transcript(&self, _analysis_id: Uuid) -> Result<Vec<ConversationMessage>> {
            Ok(Vec::new())
        }

        async fn send_turn(&self, request: &AssistantTurnRequest) -> Result<AssistantTurnResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if self.park {
                self.entered.notify_one();
                self.release.notified().await;
            }
            let queued = self.replies.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| Ok(ok_reply("Sounds good", "thread_1")))
        }
    }

    /// Backend that runs the server pipeline in-process.
    struct InProcessBackend {
        state: AppState,
        requests: Mutex<Vec<AssistantTurnRequest>>,
    }

    #[async_trait]
    impl TurnBackend for InProcessBackend {
        async fn locate_thread(&self, analysis_id: Uuid) -> Result<ThreadLocation> {
            locate_thread(self.state.store.as_ref(), analysis_id).await
        }

        async fn fetch_context(
            &self,
            analysis_id: Uuid,
            section: Option<&str>,
        ) -> Result<Option<ContextResolution>> {
            Ok(Some(
                resolve_context(self.state.resumes.as_ref(), analysis_id, section, None).await,
            ))
        }

        async fn load_transcript(&self, analysis_id: Uuid) -> Result<Vec<ConversationMessage>> {
            visible_transcript(self.state.store.as_ref(), analysis_id).await
        }

        async fn send_turn(&self, request: &AssistantTurnRequest) -> Result<AssistantTurnResponse> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(handle_turn(&self.state, request.clone(), &CancellationToken::new()).await)
        }
    }

    async fn open(backend: Arc<dyn TurnBackend>) -> Arc<ConversationSession> {
        let session = Arc::new(ConversationSession::new(backend));
        let path = format!("/analysis/{KEY}");
        session.navigate(&IdentitySources::from_path(&path)).await;
        session
    }

    #[tokio::test]
    async fn test_send_rejects_blank_and_unresolved() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::new_thread()));
        let session = ConversationSession::new(backend.clone());

        assert_eq!(
            session.send("hello").await,
            TurnOutcome::Rejected(Rejection::NoIdentity)
        );
        assert_eq!(
            session
                .navigate(&IdentitySources::from_path("/dashboard"))
                .await,
            None
        );
        assert_eq!(
            session.send("hello").await,
            TurnOutcome::Rejected(Rejection::NoIdentity)
        );

        let path = format!("/analysis/{KEY}");
        session.navigate(&IdentitySources::from_path(&path)).await;
        assert_eq!(
            session.send("   ").await,
            TurnOutcome::Rejected(Rejection::BlankMessage)
        );
        assert!(session.transcript().is_empty());
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_successful_turn_appends_reply_and_adopts_thread() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::existing("thread_local")));
        backend.queue(Ok(AssistantTurnResponse {
            suggestion: Some("Better".to_string()),
            ..ok_reply("Try:\n```Better```", "thread_server")
        }));
        let session = open(backend.clone()).await;
        assert_eq!(session.thread_id().as_deref(), Some("thread_local"));

        let outcome = session.send("Improve this").await;

        let TurnOutcome::Replied(entry) = outcome else {
            panic!("expected a reply, got {outcome:?}");
        };
        assert_eq!(entry.suggestion.as_deref(), Some("Better"));
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.thread_id().as_deref(), Some("thread_server"));
        let roles: Vec<_> = session.transcript().iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(
            backend.requests()[0].thread_id.as_deref(),
            Some("thread_local")
        );
    }

    #[tokio::test]
    async fn test_existing_thread_skips_context_fetch() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::existing("thread_1")));
        let session = open(backend.clone()).await;
        assert!(session.context_seeded());

        session.send("Hi").await;

        assert_eq!(*backend.context_calls.lock().unwrap(), 0);
        assert_eq!(backend.requests()[0].resume_content, None);
    }

    #[tokio::test]
    async fn test_second_send_while_sending_is_rejected() {
        let backend = Arc::new(FakeBackend::parked(ThreadLocation::new_thread()));
        let session = open(backend.clone()).await;

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.send("first").await }
        });
        backend.entered.notified().await;

        assert_eq!(session.status(), SessionStatus::Sending);
        assert_eq!(
            session.send("second").await,
            TurnOutcome::Rejected(Rejection::Busy)
        );
        assert_eq!(
            session.retry().await,
            TurnOutcome::Rejected(Rejection::Busy)
        );

        backend.release.notify_one();
        let first = first.await.unwrap();

        assert!(matches!(first, TurnOutcome::Replied(_)), "{first:?}");
        assert_eq!(backend.requests().len(), 1);
        assert_eq!(session.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_shows_placeholder_and_retry_replaces_it() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::new_thread()));
        backend.queue(Ok(error_reply()));
        backend.queue(Ok(ok_reply("Here is a better summary", "thread_1")));
        let session = open(backend.clone()).await;

        let failed = session.send("Rewrite my summary").await;
        assert_eq!(
            failed,
            TurnOutcome::Failed {
                message: FAILED_TURN_MESSAGE.to_string(),
                retryable: true
            }
        );
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().is_some());
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert!(transcript[1].is_error);

        let retried = session.retry().await;
        assert!(matches!(retried, TurnOutcome::Replied(_)), "{retried:?}");
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert!(!transcript[1].is_error);
        assert_eq!(transcript[1].content, "Here is a better summary");
        assert_eq!(session.status(), SessionStatus::Idle);

        let requests = backend.requests();
        assert_eq!(requests[0].message, requests[1].message);
        assert_eq!(requests[0].message_id, requests[1].message_id);
        // Context went out with the first attempt only.
        assert!(requests[0].resume_content.is_some());
        assert_eq!(requests[1].resume_content, None);
    }

    #[tokio::test]
    async fn test_transport_error_is_visible() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::new_thread()));
        backend.queue(Err(anyhow::anyhow!("connection refused")));
        let session = open(backend).await;

        let outcome = session.send("Hello").await;

        assert!(matches!(outcome, TurnOutcome::Failed { retryable: true, .. }));
        assert!(session.transcript()[1].is_error);
        assert!(session
            .last_error()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_retry_after_reply_replaces_it() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::new_thread()));
        backend.queue(Ok(ok_reply("First answer", "thread_1")));
        backend.queue(Ok(ok_reply("Second answer", "thread_1")));
        let session = open(backend.clone()).await;

        assert!(matches!(session.send("Tighten this").await, TurnOutcome::Replied(_)));
        let retried = session.retry().await;

        assert!(matches!(retried, TurnOutcome::Replied(_)), "{retried:?}");
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].content, "Tighten this");
        assert_eq!(transcript[1].content, "Second answer");
        assert!(transcript.iter().all(|e| e.content != "First answer"));
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].message_id, requests[1].message_id);
    }

    #[tokio::test]
    async fn test_send_waits_for_thread_lookup() {
        let backend = Arc::new(FakeBackend::slow_to_locate(ThreadLocation::existing(
            "thread_1",
        )));
        let session = Arc::new(ConversationSession::new(backend.clone()));

        let navigating = tokio::spawn({
            let session = session.clone();
            async move {
                let path = format!("/analysis/{KEY}");
                session.navigate(&IdentitySources::from_path(&path)).await
            }
        });
        backend.entered.notified().await;

        assert_eq!(
            session.send("Too early").await,
            TurnOutcome::Rejected(Rejection::Loading)
        );
        assert!(session.transcript().is_empty());

        backend.release.notify_one();
        navigating.await.unwrap();

        assert!(matches!(session.send("Now").await, TurnOutcome::Replied(_)));
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].thread_id.as_deref(), Some("thread_1"));
        assert_eq!(requests[0].resume_content, None);
        assert_eq!(*backend.context_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_without_prior_send() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::new_thread()));
        let session = open(backend).await;
        assert_eq!(
            session.retry().await,
            TurnOutcome::Rejected(Rejection::NothingToRetry)
        );
    }

    #[tokio::test]
    async fn test_reply_after_navigation_is_discarded() {
        let backend = Arc::new(FakeBackend::parked(ThreadLocation::new_thread()));
        let session = open(backend.clone()).await;

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.send("first").await }
        });
        backend.entered.notified().await;

        let path = format!("/analysis/{OTHER}");
        session.navigate(&IdentitySources::from_path(&path)).await;
        backend.release.notify_one();

        assert_eq!(pending.await.unwrap(), TurnOutcome::Discarded);
        assert!(session.transcript().is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.analysis_id(), Some(Uuid::parse_str(OTHER).unwrap()));
    }

    #[tokio::test]
    async fn test_leave_detaches_session() {
        let backend = Arc::new(FakeBackend::new(ThreadLocation::existing("thread_1")));
        let session = open(backend).await;
        session.leave();
        assert_eq!(session.analysis_id(), None);
        assert_eq!(session.thread_id(), None);
        assert_eq!(
            session.send("Hello").await,
            TurnOutcome::Rejected(Rejection::NoIdentity)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_first_turn_seeds_second_does_not() {
        let h = harness(
            ScriptedRuntime::completing_after(3, "Reply"),
            StubResumeStore::with_analysis("Resume body", "Job description"),
        );
        let backend = Arc::new(InProcessBackend {
            state: h.state.clone(),
            requests: Mutex::new(Vec::new()),
        });
        let session = ConversationSession::new(backend.clone());
        let analysis_id = h.analysis_id.to_string();
        session
            .navigate(&IdentitySources::with_explicit(&analysis_id))
            .await;

        assert!(matches!(session.send("First").await, TurnOutcome::Replied(_)));
        assert!(matches!(session.send("Second").await, TurnOutcome::Replied(_)));

        let requests = backend.requests.lock().unwrap().clone();
        assert_eq!(requests[0].thread_id, None);
        assert_eq!(requests[0].resume_content.as_deref(), Some("Resume body"));
        assert_eq!(requests[1].thread_id.as_deref(), Some("thread_scripted_1"));
        assert_eq!(requests[1].resume_content, None);
        assert_eq!(h.runtime.threads_created(), 1);
        // Context message, then the two turns.
        let seen = h.runtime.user_messages_seen();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].contains("Resume body"));
        assert_eq!(&seen[1..], &["First".to_string(), "Second".to_string()]);

        // A fresh session on the same analysis picks up thread and history.
        let reopened = ConversationSession::new(backend.clone());
        reopened
            .navigate(&IdentitySources::with_explicit(&analysis_id))
            .await;
        assert_eq!(reopened.thread_id().as_deref(), Some("thread_scripted_1"));
        assert!(reopened.context_seeded());
        assert_eq!(reopened.transcript().len(), 4);
    }
}
