use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::conversation::context::{resolve_context, ContextResolution};
use crate::conversation::identity::parse_uuid_v4;
use crate::conversation::locator::{locate_thread, ThreadLocation};
use crate::conversation::persistence::visible_transcript;
use crate::conversation::turn::{handle_turn, AssistantTurnRequest, AssistantTurnResponse};
use crate::errors::AppError;
use crate::models::conversation::ConversationMessage;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SectionQuery {
    pub section: Option<String>,
}

/// POST /api/v1/assistant-turn
///
/// Always 200: failures are carried in the body's `error` field.
pub async fn handle_assistant_turn(
    State(state): State<AppState>,
    Json(request): Json<AssistantTurnRequest>,
) -> Json<AssistantTurnResponse> {
    let cancel = state.shutdown.child_token();
    Json(handle_turn(&state, request, &cancel).await)
}

/// GET /api/v1/conversations/:analysis_id/thread
pub async fn handle_locate_thread(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
) -> Result<Json<ThreadLocation>, AppError> {
    let analysis_id = analysis_key(&analysis_id)?;
    Ok(Json(locate_thread(state.store.as_ref(), analysis_id).await?))
}

/// GET /api/v1/conversations/:analysis_id/context?section=
pub async fn handle_get_context(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
    Query(params): Query<SectionQuery>,
) -> Result<Json<ContextResolution>, AppError> {
    let analysis_id = analysis_key(&analysis_id)?;
    let resolution = resolve_context(
        state.resumes.as_ref(),
        analysis_id,
        params.section.as_deref(),
        None,
    )
    .await;
    Ok(Json(resolution))
}

/// GET /api/v1/conversations/:analysis_id/messages
///
/// The user-visible transcript; system instruction rows are filtered out.
pub async fn handle_list_messages(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
) -> Result<Json<Vec<ConversationMessage>>, AppError> {
    let analysis_id = analysis_key(&analysis_id)?;
    Ok(Json(
        visible_transcript(state.store.as_ref(), analysis_id).await?,
    ))
}

fn analysis_key(raw: &str) -> Result<Uuid, AppError> {
    parse_uuid_v4(raw)
        .ok_or_else(|| AppError::Validation(format!("analysis id must be a UUID, got '{raw}'")))
}
