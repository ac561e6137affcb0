//! HTTP and WebSocket surface of the relay service.

use crate::config::Config;
use crate::relay;
use crate::session::SessionFactory;
use crate::twilio::{self, StatusCallback, TwilioClient};
use axum::{
    Json, Router,
    extract::{Form, State, WebSocketUpgrade, ws::WebSocket},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub twilio: Arc<TwilioClient>,
    pub sessions: Arc<dyn SessionFactory>,
}

impl AppState {
    pub fn new(config: Config, sessions: Arc<dyn SessionFactory>) -> Self {
        let twilio = Arc::new(TwilioClient::new(
            &config.twilio_api_base,
            &config.twilio_account_sid,
            config.twilio_auth_token.clone(),
            &config.twilio_from_number,
        ));
        Self {
            config: Arc::new(config),
            twilio,
            sessions,
        }
    }
}

pub fn router(state: AppState) -> Router {
    // Permissive CORS so a development frontend can reach the API.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/call", post(start_call))
        .route("/voice", post(voice))
        .route("/twilio-callback", post(status_callback))
        .route("/twilio-audio", get(media_ws))
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "voice relay is running" }))
}

#[derive(serde::Deserialize)]
struct CallRequest {
    to: Option<String>,
}

/// Starts an outbound call to the given number.
async fn start_call(State(state): State<AppState>, Json(request): Json<CallRequest>) -> Response {
    let Some(to) = request.to.filter(|to| !to.is_empty()) else {
        warn!("call request missing destination number");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Missing 'to' number" })),
        )
            .into_response();
    };

    match state.twilio.create_call(&to, &state.config.voice_url()).await {
        Ok(sid) => {
            info!(%sid, "call initiated");
            Json(serde_json::json!({ "status": "Call initiated", "sid": sid })).into_response()
        }
        Err(e) => {
            error!("failed to initiate call: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Voice webhook: tells the provider where to open the media stream.
async fn voice(State(state): State<AppState>) -> Response {
    let document = twilio::voice_document(
        "Connecting you to the assistant.",
        &state.config.stream_url(),
        &state.config.callback_url(),
    );
    info!("serving connection document");
    ([(header::CONTENT_TYPE, "application/xml")], document).into_response()
}

/// Stream status callback from the provider; logged, nothing more.
async fn status_callback(Form(callback): Form<StatusCallback>) -> StatusCode {
    match callback.stream_status.as_deref() {
        Some("error") => error!(
            call_sid = ?callback.call_sid,
            code = ?callback.error_code,
            message = ?callback.error_message,
            "provider reported stream error"
        ),
        Some("started") => info!(call_sid = ?callback.call_sid, "provider reported stream started"),
        Some("stopped") => info!(call_sid = ?callback.call_sid, "provider reported stream stopped"),
        status => info!(?status, "provider stream status callback"),
    }
    StatusCode::OK
}

/// Media stream endpoint: one accepted socket becomes one call session.
async fn media_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    info!("incoming media stream connection");
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

async fn handle_media_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = socket.split();
    let summary = relay::run(tx, rx, state.sessions.as_ref()).await;
    match &summary.error {
        None => info!(
            stream_sid = ?summary.stream_sid,
            frames_from_caller = summary.frames_from_caller,
            frames_to_caller = summary.frames_to_caller,
            "call finished"
        ),
        // Per-call failures end here; they never propagate past the handler.
        Some(e) => error!(
            stream_sid = ?summary.stream_sid,
            frames_from_caller = summary.frames_from_caller,
            frames_to_caller = summary.frames_to_caller,
            "call ended with error: {}", e
        ),
    }
}
