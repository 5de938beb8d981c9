use tracing::info;
use uuid::Uuid;

use dealroom_db::Database;
use dealroom_types::models::{Conversation, Role};

use crate::auth::Session;
use crate::error::{ApiError, ApiResult};

/// Outcome of an initiation attempt.
#[derive(Debug)]
pub struct Initiated {
    pub conversation: Conversation,
    /// False when an existing thread for the same (startup, investor) pair
    /// was returned instead of a new one.
    pub created: bool,
    /// Primary founder the conversation is addressed to.
    pub recipient_id: Uuid,
}

/// Open (or reopen) the direct conversation between an investor and a
/// startup's primary founder.
///
/// Founders never start conversations, and a startup without founders has
/// nobody to address. Repeat calls for the same pair resolve to the same
/// conversation; the store's unique index backs this up under races.
///
/// Blocking: call from `spawn_blocking`.
pub fn initiate_conversation(db: &Database, session: &Session, startup_id: Uuid) -> ApiResult<Initiated> {
    if session.role != Role::Investor {
        return Err(ApiError::Permission(
            "only investors can start a conversation".into(),
        ));
    }

    let startup = db
        .get_startup(startup_id)?
        .ok_or_else(|| ApiError::NotFound(format!("startup {}", startup_id)))?;

    // First founder listed is the designated recipient
    let recipient_id = startup
        .primary_founder()
        .ok_or_else(|| ApiError::NotFound(format!("startup {} has no founders", startup_id)))?;

    let (conversation, created) =
        db.create_direct_conversation(startup_id, recipient_id, session.user_id)?;

    if created {
        info!(
            "{} opened conversation {} with {} ({})",
            session.user_id, conversation.id, recipient_id, startup.name
        );
    }

    Ok(Initiated {
        conversation,
        created,
        recipient_id,
    })
}
