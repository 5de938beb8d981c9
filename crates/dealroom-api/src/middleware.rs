use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use crate::auth::{AppState, decode_session};
use crate::error::ApiError;

/// Extract and validate the bearer token, then attach the `Session`.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(ApiError::Unauthorized)?;
    let session = decode_session(&state.jwt_secret, bearer.token())?;

    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}
