use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yolo_gateway::{config, start_app};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config::get_configuration().expect("failed to load config");
    if let Some(model_path) = std::env::args().nth(1) {
        config.model.set_path(model_path.into());
    }

    let log_level = &format!("{},ort=info", config.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    start_app(config).await?;

    Ok(())
}
