use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use dealroom_types::api::CreateConversationResponse;
use dealroom_types::models::Conversation;

use crate::auth::{AppState, Session};
use crate::error::{ApiError, ApiResult};
use crate::initiation::initiate_conversation;

/// User scope: conversations the caller takes part in, newest first.
pub async fn list_my_conversations(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let db = state.db.clone();
    let conversations =
        tokio::task::spawn_blocking(move || db.list_conversations_for_user(session.user_id)).await??;

    Ok(Json(conversations))
}

/// Startup scope: every conversation of a startup, for its founders.
pub async fn list_startup_conversations(
    State(state): State<AppState>,
    Path(startup_id): Path<Uuid>,
    Extension(session): Extension<Session>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let db = state.db.clone();
    let conversations = tokio::task::spawn_blocking(move || -> ApiResult<Vec<Conversation>> {
        if !db.is_founder(startup_id, session.user_id)? {
            return Err(ApiError::Permission(
                "only the startup's founders can list its conversations".into(),
            ));
        }
        Ok(db.list_conversations_for_startup(startup_id)?)
    })
    .await??;

    Ok(Json(conversations))
}

/// Initiation guard over HTTP. 201 for a new thread, 200 when the caller
/// already had one with this startup.
pub async fn create_conversation(
    State(state): State<AppState>,
    Path(startup_id): Path<Uuid>,
    Extension(session): Extension<Session>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let initiated =
        tokio::task::spawn_blocking(move || initiate_conversation(&db, &session, startup_id)).await??;

    // Already durable; a lost notification is recovered by the next fetch
    if initiated.created {
        state
            .fanout
            .conversation_created(initiated.recipient_id, &initiated.conversation);
    }

    let status = if initiated.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(CreateConversationResponse {
            conversation: initiated.conversation,
            created: initiated.created,
        }),
    ))
}
