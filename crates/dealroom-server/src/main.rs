mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use dealroom_api::auth::{AppState, AppStateInner, decode_session};
use dealroom_api::middleware::require_auth;
use dealroom_api::{ApiError, conversations, messages};
use dealroom_db::Database;
use dealroom_gateway::{Dispatcher, Fanout, connection};

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    dispatcher: Dispatcher,
}

#[derive(Deserialize)]
struct GatewayQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dealroom=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = Database::open(&config.db_path)?;
    info!("Store opened at {}", config.db_path.display());

    let app = router(Arc::new(db), config.jwt_secret.clone(), Dispatcher::new());

    let addr = config.addr()?;
    info!("Dealroom server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(db: Arc<Database>, jwt_secret: String, dispatcher: Dispatcher) -> Router {
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        fanout: Fanout::new(Arc::new(dispatcher.clone())),
        jwt_secret,
    });

    let state = ServerState {
        app: app_state.clone(),
        dispatcher,
    };

    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_my_conversations))
        .route(
            "/startups/{startup_id}/conversations",
            get(conversations::list_startup_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Browsers cannot set headers on a WebSocket handshake, so the token rides
/// in the query string and is checked before upgrading.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = decode_session(&state.app.jwt_secret, &query.token)?;
    let db = state.app.db.clone();
    let dispatcher = state.dispatcher.clone();

    Ok(ws
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, dispatcher, db, session.user_id, session.role)
        })
        .into_response())
}
