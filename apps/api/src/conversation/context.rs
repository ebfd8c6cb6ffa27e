//! Context Fetcher: resolves the resume/job payload that seeds a thread.
//!
//! One resolution path ranks what it found (`full`, `partial`, `none`);
//! every lookup failure degrades the level instead of failing the turn.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::resume_store::ResumeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextLevel {
    /// Resume content and job description.
    Full,
    /// Exactly one of the two.
    Partial,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResolution {
    pub level: ContextLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_description: Option<String>,
}

impl ContextResolution {
    pub fn none() -> Self {
        Self::from_parts(None, None)
    }

    /// Blank strings count as absent.
    pub fn from_parts(resume_content: Option<String>, job_description: Option<String>) -> Self {
        let resume_content = resume_content.filter(|s| !s.trim().is_empty());
        let job_description = job_description.filter(|s| !s.trim().is_empty());
        let level = match (&resume_content, &job_description) {
            (Some(_), Some(_)) => ContextLevel::Full,
            (None, None) => ContextLevel::None,
            _ => ContextLevel::Partial,
        };
        Self {
            level,
            resume_content,
            job_description,
        }
    }
}

/// Resolves seed context for an analysis.
///
/// Resume content precedence: `client_resume_content`, then the editor content
/// of `section`, then the stored resume text. The job description comes from
/// the analysis' job posting.
pub async fn resolve_context(
    resumes: &dyn ResumeStore,
    analysis_id: Uuid,
    section: Option<&str>,
    client_resume_content: Option<&str>,
) -> ContextResolution {
    let analysis = match resumes.analysis(analysis_id).await {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!("Context fetch: analysis {analysis_id} lookup failed: {e:#}");
            None
        }
    };

    let mut resume_content = client_resume_content
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);
    let resume_id = analysis.as_ref().and_then(|a| a.resume_id);

    if resume_content.is_none() {
        if let (Some(resume_id), Some(section)) = (resume_id, section) {
            resume_content = degrade(
                resumes.section_content(resume_id, section).await,
                "section content",
                analysis_id,
            );
        }
    }
    if resume_content.is_none() {
        if let Some(resume_id) = resume_id {
            resume_content = degrade(
                resumes.resume_content(resume_id).await,
                "resume content",
                analysis_id,
            );
        }
    }

    let job_description = match analysis.as_ref().and_then(|a| a.job_posting_id) {
        Some(job_id) => degrade(
            resumes.job_description(job_id).await,
            "job description",
            analysis_id,
        ),
        None => None,
    };

    let resolution = ContextResolution::from_parts(resume_content, job_description);
    debug!(
        "Resolved context for analysis {analysis_id}: {:?}",
        resolution.level
    );
    resolution
}

fn degrade(result: anyhow::Result<Option<String>>, what: &str, analysis_id: Uuid) -> Option<String> {
    result.unwrap_or_else(|e| {
        warn!("Context fetch: {what} for analysis {analysis_id} failed: {e:#}");
        None
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Fire-once gate
// ────────────────────────────────────────────────────────────────────────────

/// Set the first time it fires and never reset for the owner's lifetime.
#[derive(Debug, Default)]
pub struct FireOnce {
    fired: AtomicBool,
}

impl FireOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once.
    pub fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn mark_fired(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Runs `fetch` only if the gate has not fired yet. The gate is consumed
/// whether or not the fetch succeeds; a failure yields `None`.
pub async fn fetch_once<T, F, Fut>(gate: &FireOnce, fetch: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    if !gate.try_fire() {
        return None;
    }
    match fetch().await {
        Ok(value) => value,
        Err(e) => {
            warn!("Context fetch failed, continuing without context: {e:#}");
            None
        }
    }
}
