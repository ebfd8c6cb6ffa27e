use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::resume::AnalysisRow;

/// Read-only view of the resume data store. Owned by another service; the
/// orchestrator only fetches documents by id.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn analysis(&self, analysis_id: Uuid) -> Result<Option<AnalysisRow>>;

    /// Full resume text.
    async fn resume_content(&self, resume_id: Uuid) -> Result<Option<String>>;

    /// Editor content of one section of a resume.
    async fn section_content(&self, resume_id: Uuid, section: &str) -> Result<Option<String>>;

    async fn job_description(&self, job_posting_id: Uuid) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct PgResumeStore {
    pool: PgPool,
}

impl PgResumeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResumeStore for PgResumeStore {
    async fn analysis(&self, analysis_id: Uuid) -> Result<Option<AnalysisRow>> {
        Ok(sqlx::query_as::<_, AnalysisRow>(
            "SELECT id, resume_id, job_posting_id FROM analyses WHERE id = $1",
        )
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn resume_content(&self, resume_id: Uuid) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar::<_, Option<String>>("SELECT content FROM resumes WHERE id = $1")
                .bind(resume_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten(),
        )
    }

    async fn section_content(&self, resume_id: Uuid, section: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT content
            FROM resume_sections
            WHERE resume_id = $1 AND section = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(resume_id)
        .bind(section)
        .fetch_optional(&self.pool)
        .await?
        .flatten())
    }

    async fn job_description(&self, job_posting_id: Uuid) -> Result<Option<String>> {
        Ok(sqlx::query_scalar::<_, Option<String>>(
            "SELECT description FROM job_postings WHERE id = $1",
        )
        .bind(job_posting_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten())
    }
}
