use crate::{
    config::Config, model_service::ModelService, routes::api_routes, telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct SharedState {
    /// `None` until a model has been loaded; every endpoint except the index
    /// answers 503 in that state.
    pub model_service: Option<Arc<dyn ModelService>>,
    pub metrics: Arc<Metrics>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        model_service: Option<Arc<dyn ModelService>>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState {
            model_service,
            metrics,
        };

        // The annotation frontend calls the gateway cross-origin during
        // development, so CORS stays wide open.
        let router = Router::new()
            .merge(api_routes())
            .with_state(app_state)
            .layer(metrics_layer)
            .layer(CorsLayer::permissive());

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting gateway on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
