use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use wsapi_core::{CacheEngine, Definition, Disposition, EngineStats};

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub engine: CacheEngine,
}

impl AppState {
    pub fn new(config: ServerConfig, definition: Definition) -> Self {
        let engine = CacheEngine::with_config(definition, config.engine.clone());
        Self {
            config: Arc::new(config),
            engine,
        }
    }
}

pub async fn serve(config: ServerConfig, definition: Definition) -> Result<()> {
    let state = AppState::new(config, definition);
    let sweeper = state.engine.spawn_sweeper();

    let listen_addr = state.config.listen_addr.clone();
    let ws_path = state.config.ws_path.clone();
    let app = router(state);

    info!(addr = %listen_addr, path = %ws_path, "wsapi listening");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    let result = axum::serve(listener, app).await;
    sweeper.abort();
    result?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/stats", get(stats))
        .route("/api/functions", get(functions))
        .route(&state.config.ws_path, get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

#[derive(Serialize)]
struct FunctionsPayload {
    get: Vec<String>,
    set: Vec<String>,
}

async fn functions(State(state): State<AppState>) -> Json<FunctionsPayload> {
    let definition = state.engine.definition();
    let mut get: Vec<String> = definition.get_names().map(str::to_string).collect();
    let mut set: Vec<String> = definition.set_names().map(str::to_string).collect();
    get.sort();
    set.sort();
    Json(FunctionsPayload { get, set })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_ws(socket, state).await {
            warn!(?err, "websocket session ended with error");
        }
    })
}

async fn handle_ws(mut socket: WebSocket, state: AppState) -> Result<()> {
    let (outbox, mut replies) = mpsc::unbounded_channel();
    let mut session = state.engine.open_session(outbox);
    let id = session.id();
    info!(session = %id, "websocket connected");

    loop {
        tokio::select! {
            // Pushes and replies produced by the engine
            reply = replies.recv() => {
                let Some(reply) = reply else {
                    break;
                };
                let text = serde_json::to_string(&reply)?;
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            // Requests from this client
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(txt))) => {
                        if session.handle_text(txt.as_str()) == Disposition::Close {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!(session = %id, "ignoring binary WS payload");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(session = %id, error = %err, "websocket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // A dropped connection releases everything the session held.
    let released = session.release_all();
    info!(session = %id, released, "websocket closed");
    Ok(())
}
