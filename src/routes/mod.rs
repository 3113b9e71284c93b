mod health;
mod metrics;
mod model_info;
mod predict;
mod root;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(root::service_index))
        .route("/health", get(health::healthcheck))
        .route("/model_info", get(model_info::model_info))
        .route("/predict", post(predict::predict))
        .route("/metrics", get(metrics::metrics_handler))
}
