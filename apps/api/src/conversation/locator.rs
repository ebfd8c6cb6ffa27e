use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::conversation::persistence::ConversationStore;

/// Where the next turn of an analysis should go.
///
/// An existing thread already carries the seed context in its history, so
/// finding one also means the context fetch can be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadLocation {
    pub thread_id: Option<String>,
    pub already_seeded: bool,
}

impl ThreadLocation {
    pub fn existing(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            already_seeded: true,
        }
    }

    pub fn new_thread() -> Self {
        Self {
            thread_id: None,
            already_seeded: false,
        }
    }
}

/// Looks up the canonical (most recently created) thread for an analysis.
pub async fn locate_thread(store: &dyn ConversationStore, analysis_id: Uuid) -> Result<ThreadLocation> {
    let location = match store.latest_thread(analysis_id).await? {
        Some(row) => ThreadLocation::existing(row.thread_id),
        None => ThreadLocation::new_thread(),
    };
    debug!("Located thread for analysis {analysis_id}: {:?}", location.thread_id);
    Ok(location)
}
