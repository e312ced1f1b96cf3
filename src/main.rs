use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use face_attributes_service::{
    AppConfig, AttributeModel, Predictor, build_router, shutdown_signal,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(config.json_logs);

    tracing::info!(
        topology = %config.topology_path.display(),
        weights = %config.weights_path.display(),
        "loading model artifacts"
    );

    // The listener is only bound once the model is fully loaded.
    let model = load_model(&config)?;
    let predictor = Arc::new(Predictor::new(model));
    let router = build_router(&config, predictor);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn load_model(config: &AppConfig) -> anyhow::Result<Arc<dyn AttributeModel>> {
    let model = face_attributes_service::FaceModel::load(config)?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "tch-backend"))]
fn load_model(_config: &AppConfig) -> anyhow::Result<Arc<dyn AttributeModel>> {
    anyhow::bail!("built without an inference backend, enable the `tch-backend` feature")
}

fn init_tracing(json: bool) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().with_level(true));
    let compact_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(compact_layer)
        .init();
}
