//! Test doubles: a scripted assistant runtime and a stub resume store.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assistant_client::{AssistantError, AssistantRuntime, Run, RunStatus, ThreadMessage};
use crate::conversation::invoker::PollPolicy;
use crate::conversation::persistence::{ConversationStore, InMemoryConversationStore};
use crate::conversation::resume_store::ResumeStore;
use crate::models::resume::AnalysisRow;
use crate::state::AppState;

#[derive(Default)]
struct RunScript {
    polls_until_done: u32,
    final_status: Option<RunStatus>,
    current_run: Option<(String, String)>,
    current_polls: u32,
    replied: bool,
}

/// An assistant runtime whose runs finish after a fixed number of polls.
pub struct ScriptedRuntime {
    script: Mutex<RunScript>,
    reply: Mutex<String>,
    busy: AtomicBool,
    retrieve_failure: Mutex<Option<u16>>,
    threads: Mutex<Vec<String>>,
    messages: Mutex<Vec<(String, ThreadMessage)>>,
    instructions: Mutex<Vec<String>>,
    user_messages: Mutex<Vec<String>>,
    polls: AtomicU32,
    runs: AtomicU32,
    clock: AtomicI64,
}

impl ScriptedRuntime {
    fn scripted(polls_until_done: u32, final_status: RunStatus, reply: &str) -> Self {
        Self {
            script: Mutex::new(RunScript {
                polls_until_done,
                final_status: Some(final_status),
                ..Default::default()
            }),
            reply: Mutex::new(reply.to_string()),
            busy: AtomicBool::new(false),
            retrieve_failure: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            instructions: Mutex::new(Vec::new()),
            user_messages: Mutex::new(Vec::new()),
            polls: AtomicU32::new(0),
            runs: AtomicU32::new(0),
            clock: AtomicI64::new(1_700_000_000),
        }
    }

    pub fn completing_after(polls: u32, reply: &str) -> Self {
        Self::scripted(polls, RunStatus::Completed, reply)
    }

    pub fn ending_with(polls: u32, status: RunStatus) -> Self {
        Self::scripted(polls, status, "")
    }

    pub fn stuck() -> Self {
        Self::scripted(u32::MAX, RunStatus::Completed, "")
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_final_status(&self, status: RunStatus) {
        self.script.lock().unwrap().final_status = Some(status);
    }

    /// Makes every `retrieve_thread` fail with the given HTTP status.
    pub fn fail_retrieve_with(&self, status: u16) {
        *self.retrieve_failure.lock().unwrap() = Some(status);
    }

    /// Makes `thread_id` retrievable as if created in an earlier session.
    pub fn register_thread(&self, thread_id: &str) {
        self.threads.lock().unwrap().push(thread_id.to_string());
    }

    pub fn threads_created(&self) -> usize {
        self.threads
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.starts_with("thread_scripted_"))
            .count()
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn runs_started(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn instructions_seen(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }

    pub fn user_messages_seen(&self) -> Vec<String> {
        self.user_messages.lock().unwrap().clone()
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn check_busy(&self, thread_id: &str) -> Result<(), AssistantError> {
        if self.busy.load(Ordering::SeqCst) {
            return Err(AssistantError::ThreadBusy(format!(
                "Can't add messages to {thread_id} while a run run_other is active."
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AssistantRuntime for ScriptedRuntime {
    fn assistant_id(&self) -> &str {
        "asst_scripted"
    }

    async fn create_thread(&self) -> Result<String, AssistantError> {
        let mut threads = self.threads.lock().unwrap();
        let id = format!("thread_scripted_{}", threads.len() + 1);
        threads.push(id.clone());
        Ok(id)
    }

    async fn retrieve_thread(&self, thread_id: &str) -> Result<(), AssistantError> {
        if let Some(status) = *self.retrieve_failure.lock().unwrap() {
            return Err(AssistantError::Api {
                status,
                message: "upstream unavailable".to_string(),
            });
        }
        if self.threads.lock().unwrap().iter().any(|t| t == thread_id) {
            Ok(())
        } else {
            Err(AssistantError::NotFound(format!("No thread found with id '{thread_id}'.")))
        }
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<(), AssistantError> {
        self.check_busy(thread_id)?;
        self.user_messages.lock().unwrap().push(content.to_string());
        let message = ThreadMessage {
            id: format!("msg_{}", Uuid::new_v4()),
            role: "user".to_string(),
            created_at: self.tick(),
            run_id: None,
            text: content.to_string(),
        };
        self.messages
            .lock()
            .unwrap()
            .push((thread_id.to_string(), message));
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, instructions: &str) -> Result<Run, AssistantError> {
        self.check_busy(thread_id)?;
        let run_number = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.instructions
            .lock()
            .unwrap()
            .push(instructions.to_string());
        let run_id = format!("run_scripted_{run_number}");
        let mut script = self.script.lock().unwrap();
        script.current_run = Some((thread_id.to_string(), run_id.clone()));
        script.current_polls = 0;
        script.replied = false;
        Ok(Run {
            id: run_id,
            thread_id: thread_id.to_string(),
            status: RunStatus::Queued,
            last_error: None,
        })
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.current_polls += 1;
        let status = if script.current_polls >= script.polls_until_done {
            script.final_status.unwrap_or(RunStatus::Completed)
        } else {
            RunStatus::InProgress
        };

        if status == RunStatus::Completed && !script.replied {
            script.replied = true;
            let message = ThreadMessage {
                id: format!("msg_{}", Uuid::new_v4()),
                role: "assistant".to_string(),
                created_at: self.tick(),
                run_id: Some(run_id.to_string()),
                text: self.reply.lock().unwrap().clone(),
            };
            self.messages
                .lock()
                .unwrap()
                .push((thread_id.to_string(), message));
        }

        Ok(Run {
            id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            status,
            last_error: None,
        })
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AssistantError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|(t, _)| t == thread_id)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

/// A resume store holding one analysis.
pub struct StubResumeStore {
    pub analysis_id: Uuid,
    pub resume_id: Uuid,
    pub job_posting_id: Uuid,
    pub resume: Option<String>,
    pub job_description: Option<String>,
    pub section: Option<(String, String)>,
    pub fail: bool,
}

impl StubResumeStore {
    pub fn with_analysis(resume: &str, job_description: &str) -> Self {
        Self {
            analysis_id: Uuid::new_v4(),
            resume_id: Uuid::new_v4(),
            job_posting_id: Uuid::new_v4(),
            resume: Some(resume.to_string()),
            job_description: Some(job_description.to_string()),
            section: None,
            fail: false,
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            return Err(anyhow!("resume store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for StubResumeStore {
    async fn analysis(&self, analysis_id: Uuid) -> Result<Option<AnalysisRow>> {
        self.check()?;
        Ok((analysis_id == self.analysis_id).then(|| AnalysisRow {
            id: self.analysis_id,
            resume_id: Some(self.resume_id),
            job_posting_id: Some(self.job_posting_id),
        }))
    }

    async fn resume_content(&self, resume_id: Uuid) -> Result<Option<String>> {
        self.check()?;
        Ok(self.resume.clone().filter(|_| resume_id == self.resume_id))
    }

    async fn section_content(&self, resume_id: Uuid, section: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .section
            .as_ref()
            .filter(|(name, _)| resume_id == self.resume_id && name == section)
            .map(|(_, content)| content.clone()))
    }

    async fn job_description(&self, job_posting_id: Uuid) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .job_description
            .clone()
            .filter(|_| job_posting_id == self.job_posting_id))
    }
}

pub struct TestHarness {
    pub state: AppState,
    pub runtime: Arc<ScriptedRuntime>,
    pub store: Arc<InMemoryConversationStore>,
    pub analysis_id: Uuid,
}

/// App state over the doubles, polling every 10ms.
pub fn harness(runtime: ScriptedRuntime, resumes: StubResumeStore) -> TestHarness {
    let runtime = Arc::new(runtime);
    let store = Arc::new(InMemoryConversationStore::new());
    let analysis_id = resumes.analysis_id;
    let state = AppState {
        runtime: runtime.clone(),
        store: store.clone() as Arc<dyn ConversationStore>,
        resumes: Arc::new(resumes),
        poll_policy: PollPolicy {
            interval: std::time::Duration::from_millis(10),
            max_polls: 60,
        },
        shutdown: CancellationToken::new(),
    };
    TestHarness {
        state,
        runtime,
        store,
        analysis_id,
    }
}
