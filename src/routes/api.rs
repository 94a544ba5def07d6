//! HTTP surface: health, voice discovery, global character reload, and
//! metrics. The realtime engine itself lives behind the websocket route.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::characters::CharacterLoadError;
use crate::characters::VoiceSource;
use crate::metrics;
use crate::state::AppState;

pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/v1/health", get(health))
        .route("/v1/voices", get(list_voices))
        .route("/v1/characters/reload", post(reload_characters))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "You've reached the sotto-gateway server."
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<crate::services::HealthStatus> {
    Json(state.health.check().await)
}

/// Public listing entry: visible characters only, comments excluded.
#[derive(Debug, Serialize)]
struct VoiceListing {
    name: String,
    good: Option<bool>,
    source: VoiceSource,
}

async fn list_voices(State(state): State<Arc<AppState>>) -> Json<Vec<VoiceListing>> {
    let voices = state
        .characters
        .visible()
        .into_iter()
        .map(|character| VoiceListing {
            name: character.name.clone(),
            good: character.good,
            source: character.voice.clone(),
        })
        .collect();
    Json(voices)
}

#[derive(Debug, Deserialize)]
struct CharacterReloadRequest {
    /// Directory of character files, or the literal `"default"`.
    directory: String,
}

/// Reload the process-wide roster used by `/v1/voices`. Active sessions
/// keep their own registries and are unaffected.
async fn reload_characters(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CharacterReloadRequest>,
) -> Response {
    let directory = state.config.resolve_characters_dir(&request.directory);

    match state.characters.reload(&directory).await {
        Ok(result) => {
            info!(
                directory = %directory.display(),
                loaded = result.loaded_count,
                "Global characters reloaded; active sessions unaffected"
            );
            Json(serde_json::json!({
                "success": true,
                "directory": directory.display().to_string(),
                "total_files": result.total_files,
                "loaded_count": result.loaded_count,
                "error_count": result.error_count,
                "load_duration": result.load_duration.as_secs_f64(),
            }))
            .into_response()
        }
        Err(e) => {
            let status = match &e {
                CharacterLoadError::DirectoryNotFound(_) => StatusCode::NOT_FOUND,
                CharacterLoadError::NotADirectory(_)
                | CharacterLoadError::NoValidCharacters(_) => StatusCode::BAD_REQUEST,
                CharacterLoadError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(serde_json::json!({
                    "success": false,
                    "code": e.code(),
                    "detail": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn render_metrics() -> Response {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::render_prometheus(),
    )
        .into_response()
}
