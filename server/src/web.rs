use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use photobooth_common::config::Config;
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::capture::{CaptureCoordinator, CaptureError, CaptureOutcome};
use crate::enhance::Adjust;
use crate::printer::{print_file, print_image, Printer};
use crate::storage::StorageError;
use crate::stream::{frame_stream, mjpeg_response, FrameSource};

const INDEX_HTML: &str = include_str!("../templates/index.html");

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub coordinator: CaptureCoordinator,
    pub source: FrameSource,
    pub printer: Arc<dyn Printer>,
    pub print_width: u32,
    pub print_on_capture: bool,
    pub frame_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

/// Status and body text for a capture request.
#[derive(Debug)]
pub struct CaptureReply {
    pub status: StatusCode,
    pub message: String,
}

impl AppState {
    pub fn new(
        config: &Config,
        coordinator: CaptureCoordinator,
        source: FrameSource,
        printer: Arc<dyn Printer>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coordinator,
            source,
            printer,
            print_width: config.printer.width,
            print_on_capture: config.prints_on_capture(),
            frame_interval: Duration::from_millis(config.camera.frame_interval_ms),
            shutdown,
        }
    }

    /// Capture (and print when configured). Shared by `/capture` and the button.
    pub fn capture_blocking(&self) -> CaptureReply {
        if !self.print_on_capture {
            return match self.coordinator.capture() {
                Ok(record) => reply(StatusCode::OK, format!("Captured {}", record.name)),
                Err(e) => capture_failed(e),
            };
        }
        match self
            .coordinator
            .capture_and_print(self.printer.as_ref(), self.print_width)
        {
            Ok(CaptureOutcome { print: Ok(()), .. }) => reply(StatusCode::OK, "Captured & printed"),
            Ok(CaptureOutcome { print: Err(_), .. }) => {
                reply(StatusCode::INTERNAL_SERVER_ERROR, "Captured but print failed")
            }
            Err(e) => capture_failed(e),
        }
    }
}

fn reply(status: StatusCode, message: impl Into<String>) -> CaptureReply {
    CaptureReply {
        status,
        message: message.into(),
    }
}

fn capture_failed(e: CaptureError) -> CaptureReply {
    match e {
        CaptureError::NoFrameAvailable => {
            warn!("capture requested before the first frame");
            reply(StatusCode::INTERNAL_SERVER_ERROR, "No frame yet")
        }
        CaptureError::Storage(e) => {
            error!(error = %e, "failed to store capture");
            reply(StatusCode::INTERNAL_SERVER_ERROR, format!("Capture failed: {e}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PreviewPrint {
    /// Base64 image, optionally as a `data:image/...;base64,` URL.
    image: String,
    #[serde(default = "unit_factor")]
    brightness: f32,
    #[serde(default = "unit_factor")]
    contrast: f32,
}

fn unit_factor() -> f32 {
    1.0
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /video_feed: endless MJPEG preview
async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    mjpeg_response(frame_stream(
        state.source.clone(),
        state.frame_interval,
        state.shutdown.clone(),
    ))
}

/// POST /capture
async fn capture(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || state.capture_blocking()).await {
        Ok(r) => (r.status, r.message).into_response(),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /photos: names, most recent first
async fn list_photos(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || state.coordinator.store().list()).await;
    match result {
        Ok(Ok(names)) => Json(names).into_response(),
        Ok(Err(e)) => storage_failed(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /photos/:name
async fn get_photo(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || state.coordinator.store().read(&name)).await;
    match result {
        Ok(Ok(bytes)) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Ok(Err(e)) => storage_failed(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /photos/:name/print
async fn print_photo(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || {
        let path = state.coordinator.store().path_of(&name)?;
        Ok::<_, StorageError>(print_file(
            state.printer.as_ref(),
            &path,
            Adjust::Auto,
            state.print_width,
        ))
    })
    .await;

    match result {
        Ok(Ok(Ok(()))) => (StatusCode::OK, "Printed").into_response(),
        Ok(Ok(Err(e))) => {
            error!(error = %e, "print failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Print failed").into_response()
        }
        Ok(Err(e)) => storage_failed(e),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /preview-print
/// Body: { "image": "<base64>", "brightness": 1.2, "contrast": 1.1 }
async fn preview_print(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreviewPrint>,
) -> impl IntoResponse {
    let encoded = match body.image.split_once(";base64,") {
        Some((_, data)) => data,
        None => body.image.as_str(),
    };
    let bytes = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid base64: {e}")).into_response();
        }
    };
    let img = match image::load_from_memory(&bytes) {
        Ok(img) => img,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid image: {e}")).into_response();
        }
    };
    let adjust = Adjust::Manual {
        brightness: body.brightness,
        contrast: body.contrast,
    };

    let result = tokio::task::spawn_blocking(move || {
        print_image(state.printer.as_ref(), &img, adjust, state.print_width)
    })
    .await;

    match result {
        Ok(Ok(())) => {
            info!(
                brightness = body.brightness,
                contrast = body.contrast,
                "printed preview"
            );
            (StatusCode::OK, "Printed").into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "preview print failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Print failed").into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn storage_failed(e: StorageError) -> Response {
    match e {
        StorageError::InvalidName(_) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        StorageError::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        e => {
            error!(error = %e, "photo storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/capture", post(capture))
        .route("/photos", get(list_photos))
        .route("/photos/:name", get(get_photo))
        .route("/photos/:name/print", post(print_photo))
        .route("/preview-print", post(preview_print))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
