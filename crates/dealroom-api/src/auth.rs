use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use dealroom_db::Database;
use dealroom_gateway::Fanout;
use dealroom_types::api::Claims;
use dealroom_types::models::Role;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub fanout: Fanout,
    pub jwt_secret: String,
}

/// The authenticated caller. Built from validated claims and passed
/// explicitly to everything that checks identity or role.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            name: claims.name,
            role: claims.role,
        }
    }
}

/// Validate an HS256 session token issued by the account service.
pub fn decode_session(secret: &str, token: &str) -> Result<Session, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized)?;

    Ok(data.claims.into())
}
