mod catalog;
mod config;
mod decompose;
mod http;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod preview;
mod sessions;
mod stylist;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use decompose::AnalysisError;
use llm::{LlmClient, VisionModel};
use models::{ApiError, ImageError, ResultEntry, SubmitImageRequest};
use pipeline::Pipeline;
use serde::Serialize;
use serde_json::json;
use sessions::{SessionBoard, SessionError, SessionSnapshot};
use std::{net::SocketAddr, sync::Arc};
use stylist::{
    CapsuleWardrobe, Recommendation, RecommendationRequest, StyleAnalysis, StyleRequest, Stylist,
    StylistError, WardrobeRequest,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "outfit.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env()?;
    let client = http::build_client(&config.http);
    let vision: Arc<dyn VisionModel> = Arc::new(LlmClient::new(client.clone(), config.llm.clone()));
    let pipeline = Pipeline::from_config(&config, client, vision.clone());
    let sessions = SessionBoard::new(pipeline.clone(), &config.sessions);
    sessions.spawn_sweeper();
    let state = AppState {
        sessions,
        pipeline,
        stylist: Stylist::new(vision, config.stylist.clone()),
    };

    let app = router(state, config.server.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    info!(target = "outfit.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    sessions: SessionBoard,
    stylist: Stylist,
}

fn router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/outfits/analyze", post(analyze_outfit))
        .route("/sessions", post(open_session))
        .route("/sessions/{id}", get(get_session).delete(close_session))
        .route("/sessions/{id}/images", post(submit_image))
        .route("/outfits/recommendations", post(recommend_outfit))
        .route("/wardrobes/capsule", post(capsule_wardrobe))
        .route("/styles/analyze", post(analyze_style))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "outfit-finder-rs",
    }))
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    entries: Vec<ResultEntry>,
}

/// Run the full pipeline for one photo and return the finished gallery.
///
/// - Method: `POST`
/// - Path: `/outfits/analyze`
/// - Body: `SubmitImageRequest`
/// - Response: `{ entries: [ResultEntry] }`
///
/// A failed analysis is still `200`; the gallery then holds one `failure` entry.
async fn analyze_outfit(
    State(state): State<AppState>,
    Json(payload): Json<SubmitImageRequest>,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let image = payload.into_payload()?;
    metrics::image_received("/outfits/analyze", image.mime_type(), image.encoded_len());
    let entries = state.pipeline.run(image).await;
    Ok(Json(AnalyzeResponse { entries }))
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    session_id: String,
}

async fn open_session(State(state): State<AppState>) -> (StatusCode, Json<SessionCreated>) {
    let id = state.sessions.open().await;
    (
        StatusCode::CREATED,
        Json(SessionCreated {
            session_id: id.to_string(),
        }),
    )
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    session_id: String,
    run_id: String,
}

/// Start a run in a session, replacing whatever it was showing.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/images`
/// - Response: `202` with the new `run_id`; poll `GET /sessions/{id}`.
async fn submit_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitImageRequest>,
) -> Result<(StatusCode, Json<RunAccepted>), AppError> {
    let session_id = parse_session_id(&id)?;
    let image = payload.into_payload()?;
    metrics::image_received("/sessions/images", image.mime_type(), image.encoded_len());
    let run_id = state.sessions.submit(session_id, image).await?;
    info!(target = "outfit.api", session_id = %session_id, run_id = %run_id, "run_submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
        }),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let session_id = parse_session_id(&id)?;
    state
        .sessions
        .snapshot(session_id)
        .await
        .map(Json)
        .ok_or(AppError::Session(SessionError::NotFound))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session_id = parse_session_id(&id)?;
    state.sessions.close(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Store recommendations for one outfit photo.
///
/// - Method: `POST`
/// - Path: `/outfits/recommendations`
/// - Body: `SubmitImageRequest` fields plus `mode` (`similar` | `new_outfit`),
///   `budget`, `colors`, `direction`
async fn recommend_outfit(
    State(state): State<AppState>,
    Json(payload): Json<RecommendationRequest>,
) -> Result<Json<Recommendation>, AppError> {
    let image = payload.image.into_payload()?;
    metrics::image_received("/outfits/recommendations", image.mime_type(), image.encoded_len());
    let recommendation = state.stylist.recommend(&image, &payload.brief).await?;
    Ok(Json(recommendation))
}

/// Capsule wardrobe from two or more outfit photos.
///
/// - Method: `POST`
/// - Path: `/wardrobes/capsule`
/// - Body: `{ images: [SubmitImageRequest], style?, budget?, season? }`
async fn capsule_wardrobe(
    State(state): State<AppState>,
    Json(payload): Json<WardrobeRequest>,
) -> Result<Json<CapsuleWardrobe>, AppError> {
    let images = stylist::payloads(payload.images)?;
    let wardrobe = state.stylist.capsule_wardrobe(&images, &payload.brief).await?;
    Ok(Json(wardrobe))
}

async fn analyze_style(
    State(state): State<AppState>,
    Json(payload): Json<StyleRequest>,
) -> Result<Json<StyleAnalysis>, AppError> {
    let images = stylist::payloads(payload.images)?;
    let analysis = state.stylist.analyze_style(&images).await?;
    Ok(Json(analysis))
}

fn parse_session_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::InvalidSessionId)
}

#[derive(Debug)]
enum AppError {
    Image(ImageError),
    Session(SessionError),
    InvalidSessionId,
    Stylist(StylistError),
}

impl From<StylistError> for AppError {
    fn from(value: StylistError) -> Self {
        Self::Stylist(value)
    }
}

impl From<ImageError> for AppError {
    fn from(value: ImageError) -> Self {
        Self::Image(value)
    }
}

impl From<SessionError> for AppError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Image(err) => (StatusCode::BAD_REQUEST, "invalid_image", err.to_string()),
            AppError::Session(err) => (StatusCode::NOT_FOUND, "session_not_found", err.to_string()),
            AppError::InvalidSessionId => (
                StatusCode::BAD_REQUEST,
                "invalid_session_id",
                "session id must be a UUID".to_string(),
            ),
            AppError::Stylist(err) => {
                let (status, code) = match &err {
                    StylistError::NotEnoughImages { .. } => {
                        (StatusCode::BAD_REQUEST, "not_enough_images")
                    }
                    StylistError::Analysis(AnalysisError::MissingCredentials) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "stylist_unavailable")
                    }
                    StylistError::Analysis(_) | StylistError::InvalidResponse(_) => {
                        (StatusCode::BAD_GATEWAY, "stylist_failed")
                    }
                };
                (status, code, err.to_string())
            }
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use crate::sessions::SessionConfig;
    use crate::stylist::StylistConfig;
    use crate::testing::{ScriptedMetadata, ScriptedVision, pipeline};
    use tower::ServiceExt;

    fn app(vision: ScriptedVision) -> Router {
        let stylist = Stylist::new(Arc::new(vision.clone()), StylistConfig::default());
        let pipeline = pipeline(vision, Some(ScriptedMetadata::live()), 3);
        router(
            AppState {
                sessions: SessionBoard::new(pipeline.clone(), &SessionConfig::default()),
                pipeline,
                stylist,
            },
            1024 * 1024,
        )
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn image_body() -> Value {
        json!({
            "image_base64": "aGVsbG8gb3V0Zml0",
            "mime_type": "image/png",
            "display_uri": "file:///photos/look.png",
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = call(&app(ScriptedVision::replying("")), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn analyze_returns_ordered_gallery() {
        let app = app(ScriptedVision::replying("- Blue denim jacket\n• White sneakers\n\nRed scarf"));
        let (status, body) = call(&app, "POST", "/outfits/analyze", Some(image_body())).await;
        assert_eq!(status, StatusCode::OK);

        let entries = body["entries"].as_array().expect("entries");
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0]["type"], "echo");
        assert_eq!(entries[0]["image_uri"], "file:///photos/look.png");
        let retailers: Vec<&str> = entries[1..4]
            .iter()
            .map(|e| e["retailer"].as_str().unwrap())
            .collect();
        assert_eq!(retailers, vec!["ASOS", "H&M", "Zara"]);
        assert_eq!(entries[9]["description"], "Red scarf");
        assert!(entries[1..].iter().all(|e| e["type"] == "product"));
    }

    #[tokio::test]
    async fn analyze_failure_is_a_single_failure_entry() {
        let app = app(ScriptedVision::failing(500));
        let (status, body) = call(&app, "POST", "/outfits/analyze", Some(image_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["entries"],
            json!([{"type": "failure", "message": crate::pipeline::FAILURE_MESSAGE}])
        );
    }

    #[tokio::test]
    async fn analyze_rejects_bad_images() {
        let app = app(ScriptedVision::replying("Hat"));
        let (status, body) = call(
            &app,
            "POST",
            "/outfits/analyze",
            Some(json!({"image_base64": "%%%"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_image");
    }

    #[tokio::test]
    async fn session_flow_submit_then_poll() {
        let app = app(ScriptedVision::replying("Linen shirt"));
        let (status, created) = call(&app, "POST", "/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = created["session_id"].as_str().expect("id").to_string();

        let (status, accepted) = call(
            &app,
            "POST",
            &format!("/sessions/{session_id}/images"),
            Some(image_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = accepted["run_id"].as_str().expect("run id").to_string();

        let mut snapshot = Value::Null;
        for _ in 0..200 {
            let (_, body) = call(&app, "GET", &format!("/sessions/{session_id}"), None).await;
            if body["busy"] == false {
                snapshot = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(snapshot["run_id"], run_id.as_str());
        assert_eq!(snapshot["phase"], "done");
        assert_eq!(snapshot["entries"].as_array().map(Vec::len), Some(4));

        let (status, _) = call(&app, "DELETE", &format!("/sessions/{session_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "GET", &format!("/sessions/{session_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn session_routes_validate_ids() {
        let app = app(ScriptedVision::replying("Hat"));
        let (status, body) = call(&app, "GET", "/sessions/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_session_id");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/sessions/{}/images", Uuid::new_v4()),
            Some(image_body()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_poll_right_after_submit_shows_the_echo() {
        let app = app(ScriptedVision::replying("Hat").with_delay(Duration::from_millis(30)));
        let (_, created) = call(&app, "POST", "/sessions", None).await;
        let session_id = created["session_id"].as_str().expect("id").to_string();
        call(
            &app,
            "POST",
            &format!("/sessions/{session_id}/images"),
            Some(image_body()),
        )
        .await;

        let (status, body) = call(&app, "GET", &format!("/sessions/{session_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["busy"], true);
        assert_eq!(body["entries"][0]["type"], "echo");
        assert_eq!(body["entries"][0]["image_uri"], "file:///photos/look.png");
    }

    #[tokio::test]
    async fn recommendations_route_returns_parsed_stores() {
        let app = app(ScriptedVision::replying(
            r#"{"description": "Smart casual", "recommendations": [{"store": "Mango", "items": ["Blazer"], "priceRange": "$80"}]}"#,
        ));
        let mut body = image_body();
        body["mode"] = json!("new_outfit");
        body["budget"] = json!("150");
        let (status, body) = call(&app, "POST", "/outfits/recommendations", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "new_outfit");
        assert_eq!(body["summary"], "Smart casual");
        assert_eq!(body["structured"], true);
        assert_eq!(body["recommendations"][0]["store"], "Mango");
    }

    #[tokio::test]
    async fn wardrobe_route_rejects_a_single_image() {
        let app = app(ScriptedVision::replying("{}"));
        let (status, body) = call(
            &app,
            "POST",
            "/wardrobes/capsule",
            Some(json!({"images": [image_body()], "season": "Winter"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "not_enough_images");
    }

    #[tokio::test]
    async fn style_route_maps_upstream_failure_to_bad_gateway() {
        let app = app(ScriptedVision::failing(500));
        let (status, body) = call(
            &app,
            "POST",
            "/styles/analyze",
            Some(json!({"images": [image_body(), image_body()]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "stylist_failed");
    }
}
