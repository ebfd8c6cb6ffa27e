use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A resume analysis: one resume scored against one job posting.
/// Its id is the conversation identity key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalysisRow {
    pub id: Uuid,
    pub resume_id: Option<Uuid>,
    pub job_posting_id: Option<Uuid>,
}
