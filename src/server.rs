use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    response::Html,
    routing::{get, post},
};
use serde::Serialize;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::{
    config::AppConfig,
    error::ServiceError,
    labels::{GENDER_LABELS, RACE_LABELS},
    model::{FaceAttributes, ModelMetadata, Predictor},
    pages,
    preprocess::IMAGE_SIZE,
};

/// Multipart field carrying the uploaded photo.
pub const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub struct AppState {
    pub predictor: Arc<Predictor>,
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelMetadata,
    input_size: u32,
    race_labels: &'static [&'static str],
    gender_labels: &'static [&'static str],
}

pub fn build_router(config: &AppConfig, predictor: Arc<Predictor>) -> Router {
    let state = AppState { predictor };

    Router::new()
        .route("/", get(index))
        .route("/how_it_works", get(how_it_works))
        .route("/dataset", get(dataset))
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(pages::INDEX)
}

async fn how_it_works() -> Html<&'static str> {
    Html(pages::HOW_IT_WORKS)
}

async fn dataset() -> Html<&'static str> {
    Html(pages::DATASET)
}

async fn health() -> &'static str {
    "ok"
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        model: state.predictor.metadata(),
        input_size: IMAGE_SIZE,
        race_labels: &RACE_LABELS,
        gender_labels: &GENDER_LABELS,
    })
}

async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<FaceAttributes>, ServiceError> {
    let image = read_image_field(&mut multipart).await?;
    let attributes = state.predictor.predict(image).await?;
    Ok(Json(attributes))
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, ServiceError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }
    Err(ServiceError::MissingInput(IMAGE_FIELD))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
