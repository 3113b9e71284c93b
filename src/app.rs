use crate::{
    config::Config, model_service::ModelService, ort_service::OrtModelService, server::HttpServer,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    if let Err(e) = config.model.validate() {
        tracing::error!("{}", e);
        tracing::error!(
            "Pass the weights path as the first argument or set model.onnx_file in the configuration"
        );
        return Err(e.into());
    }

    let model_service: Arc<dyn ModelService> = match OrtModelService::new(&config.model) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            tracing::error!(
                "Failed to load model from {:?}: {:?}",
                config.model.get_model_path(),
                e
            );
            return Err(e.into());
        }
    };

    tracing::info!(
        "Loaded model {} with {} classes",
        model_service.info().model_name,
        model_service.info().class_names.len()
    );

    let server = HttpServer::new(Some(model_service), &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
