use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct HealthStatus {
    status: String,
    model: String,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    match &state.model_service {
        Some(service) => Json(HealthStatus {
            status: "healthy".into(),
            model: service.info().model_name.clone(),
        })
        .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "model not loaded").into_response(),
    }
}
