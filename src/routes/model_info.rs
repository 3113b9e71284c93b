use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

pub async fn model_info(State(state): State<SharedState>) -> impl IntoResponse {
    match &state.model_service {
        Some(service) => Json(service.info().clone()).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "model not loaded").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detection::{ModelInfo, RawDetection},
        model_service::{InferenceError, ModelService},
        telemetry::Metrics,
    };
    use image::RgbImage;
    use std::sync::Arc;

    struct MockModelService {
        info: ModelInfo,
    }

    impl ModelService for MockModelService {
        fn infer(
            &self,
            _image: &RgbImage,
            _conf_threshold: f32,
            _iou_threshold: f32,
        ) -> Result<Vec<RawDetection>, InferenceError> {
            Ok(Vec::new())
        }

        fn info(&self) -> &ModelInfo {
            &self.info
        }
    }

    fn state_with(model_service: Option<Arc<dyn ModelService>>) -> SharedState {
        SharedState {
            model_service,
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_model_info_unavailable_before_load() {
        let response = model_info(State(state_with(None))).await.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_model_info_round_trips_metadata() {
        let mock = Arc::new(MockModelService {
            info: ModelInfo {
                model_name: "best".to_string(),
                class_names: vec!["cat".to_string(), "dog".to_string()],
                input_size: [640, 640],
            },
        });
        let response = model_info(State(state_with(Some(mock))))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let info: ModelInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(info.model_name, "best");
        assert_eq!(info.class_names, vec!["cat", "dog"]);
        assert_eq!(info.input_size, [640, 640]);
    }
}
