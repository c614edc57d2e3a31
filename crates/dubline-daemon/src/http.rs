use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use dubline_engine::EngineEvent;
use dubline_proto::protocol::{Command, EngineState, PlaybackEvent, Settings};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_rx: watch::Receiver<EngineState>,
    event_tx: mpsc::Sender<EngineEvent>,
}

/// Body of `POST /api/settings`.
#[derive(Deserialize)]
struct SettingsBody {
    enabled: bool,
    #[serde(flatten)]
    settings: Settings,
}

#[derive(Deserialize)]
struct ContextBody {
    media_id: String,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_rx: watch::Receiver<EngineState>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState { state_rx, event_tx });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/enable", post(enable))
        .route("/api/disable", post(disable))
        .route("/api/settings", post(settings))
        .route("/api/context", post(context))
        .route("/api/ad/:state", post(ad_state))
        .route("/api/playback", post(playback))
        // Browser extensions call in from arbitrary origins.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    if state.event_tx.send(EngineEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward command: engine channel closed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<EngineState> {
    Json(state.state_rx.borrow().clone())
}

/// Without a body the session's current language and hint are kept.
async fn enable(State(state): State<HttpState>, body: Option<Json<Settings>>) -> StatusCode {
    let settings = match body {
        Some(Json(settings)) => settings,
        None => {
            let current = state.state_rx.borrow();
            Settings {
                language: current.language.clone(),
                hint: current.hint.clone(),
            }
        }
    };
    info!("HTTP API: enable ({})", settings.language);
    forward(&state, Command::Enable { settings }).await
}

async fn disable(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: disable");
    forward(&state, Command::Disable).await
}

async fn settings(State(state): State<HttpState>, Json(body): Json<SettingsBody>) -> StatusCode {
    info!(
        "HTTP API: settings enabled={} language={}",
        body.enabled, body.settings.language
    );
    let cmd = Command::SettingsChanged {
        enabled: body.enabled,
        settings: body.settings,
    };
    forward(&state, cmd).await
}

async fn context(State(state): State<HttpState>, Json(body): Json<ContextBody>) -> StatusCode {
    info!("HTTP API: context {}", body.media_id);
    forward(
        &state,
        Command::ContextChanged {
            media_id: body.media_id,
        },
    )
    .await
}

async fn ad_state(State(state): State<HttpState>, Path(flag): Path<String>) -> StatusCode {
    let is_ad = match flag.as_str() {
        "on" => true,
        "off" => false,
        _ => return StatusCode::BAD_REQUEST,
    };
    forward(&state, Command::AdStateChanged { is_ad }).await
}

async fn playback(State(state): State<HttpState>, Json(evt): Json<PlaybackEvent>) -> StatusCode {
    forward(&state, Command::Playback(evt)).await
}
