use crate::{
    detection::Detection,
    model_service::{InferenceError, ModelService},
    server::SharedState,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    pub image_base64: String,
    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
}

fn default_conf_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub detections: Vec<Detection>,
    pub inference_time_ms: f32,
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("invalid base64 image payload: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match self {
            PredictError::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

#[instrument(skip(state, request))]
pub async fn predict(
    State(state): State<SharedState>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, PredictError> {
    let model_service = state
        .model_service
        .as_ref()
        .ok_or(PredictError::ModelNotLoaded)?;

    let image_data = general_purpose::STANDARD.decode(&request.image_base64)?;
    let image = image::load_from_memory(&image_data)?.to_rgb8();

    let start = Instant::now();
    let raw_detections =
        model_service.infer(&image, request.conf_threshold, request.iou_threshold)?;
    let inference_time_ms = start.elapsed().as_secs_f32() * 1000.0;

    state.metrics.record_request("/predict");
    state
        .metrics
        .record_inference_duration(inference_time_ms as u64, "/predict");

    let class_names = &model_service.info().class_names;
    let detections: Vec<Detection> = raw_detections
        .into_iter()
        .map(|raw| raw.with_label(class_names))
        .collect();

    tracing::debug!("Returning {} detections", detections.len());

    Ok(Json(InferenceResponse {
        detections,
        inference_time_ms,
    }))
}
