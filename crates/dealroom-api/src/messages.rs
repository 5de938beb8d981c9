use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use dealroom_db::{AppendOutcome, Database};
use dealroom_types::api::SendMessageRequest;
use dealroom_types::models::{Conversation, DEFAULT_MESSAGE_KIND, Message};

use crate::auth::{AppState, Session};
use crate::error::{ApiError, ApiResult};

/// Participants read their thread; founders also read every thread of
/// their startup.
fn load_readable(db: &Database, session: &Session, conversation_id: Uuid) -> ApiResult<Conversation> {
    let conversation = db
        .get_conversation(conversation_id)?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {}", conversation_id)))?;

    if conversation.is_participant(session.user_id)
        || db.is_founder(conversation.startup_id, session.user_id)?
    {
        Ok(conversation)
    } else {
        Err(ApiError::Permission("not part of this conversation".into()))
    }
}

/// Full thread, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(session): Extension<Session>,
) -> ApiResult<Json<Vec<Message>>> {
    let db = state.db.clone();
    let messages = tokio::task::spawn_blocking(move || -> ApiResult<Vec<Message>> {
        load_readable(&db, &session, conversation_id)?;
        Ok(db.get_messages(conversation_id)?)
    })
    .await??;

    Ok(Json(messages))
}

/// Append a message, then publish `new-message` on the startup's entity
/// channel. The sender sees their message through that event like everyone
/// else; the response body is informational.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(session): Extension<Session>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::Validation("message content is empty".into()));
    }
    let kind = req.kind.unwrap_or_else(|| DEFAULT_MESSAGE_KIND.to_string());

    let db = state.db.clone();
    let sender_id = session.user_id;
    let (startup_id, message) = tokio::task::spawn_blocking(move || -> ApiResult<(Uuid, Message)> {
        let conversation = db
            .get_conversation(conversation_id)?
            .ok_or_else(|| ApiError::NotFound(format!("conversation {}", conversation_id)))?;

        match db.append_message(conversation_id, sender_id, &content, &kind)? {
            AppendOutcome::Appended(message) => Ok((conversation.startup_id, message)),
            AppendOutcome::ConversationNotFound => {
                Err(ApiError::NotFound(format!("conversation {}", conversation_id)))
            }
            AppendOutcome::NotParticipant => {
                Err(ApiError::Permission("not part of this conversation".into()))
            }
        }
    })
    .await??;

    state.fanout.message_appended(startup_id, &message);

    Ok((StatusCode::CREATED, Json(message)))
}
