use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

pub async fn service_index(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "service": "yolo_gateway",
        "status": "running",
        "model_loaded": state.model_service.is_some(),
        "endpoints": {
            "health": "/health",
            "model_info": "/model_info",
            "predict": "/predict (POST)",
            "metrics": "/metrics",
        }
    }))
}
