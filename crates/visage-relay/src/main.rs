//! Standalone relay binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use visage_detect::onnx::{cascade_stages, BlazeFaceModel};
use visage_detect::{CascadeDetector, FaceDetector};
use visage_relay::http::build_router;
use visage_relay::{DecoderFactory, DetectorFactory, RelayConfig, SessionRegistry};

/// One shared model, one fresh cascade per session.
struct BlazeFaceFactory {
    model: Arc<BlazeFaceModel>,
}

impl DetectorFactory for BlazeFaceFactory {
    fn create(&self) -> Box<dyn FaceDetector> {
        let (face, eyes, mouth) = cascade_stages(Arc::clone(&self.model));
        Box::new(CascadeDetector::new(face, eyes, mouth))
    }
}

#[cfg(feature = "h264")]
fn decoder_factory() -> Arc<dyn DecoderFactory> {
    Arc::new(visage_relay::media::OpenH264DecoderFactory)
}

#[cfg(not(feature = "h264"))]
fn decoder_factory() -> Arc<dyn DecoderFactory> {
    struct RelayOnly;

    impl DecoderFactory for RelayOnly {
        fn create(
            &self,
        ) -> visage_common::Result<Box<dyn visage_relay::media::FrameDecoder>> {
            Err(visage_common::Error::media(
                "built without the h264 feature, relaying only",
            ))
        }
    }

    Arc::new(RelayOnly)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    visage_common::init_tracing();

    let config = RelayConfig::from_env()?;
    let model_path = config
        .model_path
        .as_deref()
        .context("VISAGE_MODEL_PATH must be set")?;
    let model = match config.detect_confidence {
        Some(confidence) => BlazeFaceModel::load_with_confidence(model_path, confidence),
        None => BlazeFaceModel::load(model_path),
    }
    .with_context(|| format!("loading face model from {}", model_path.display()))?;
    info!(model = %model_path.display(), "face model loaded");

    let registry = SessionRegistry::new(
        config.stun_url.clone(),
        Arc::new(BlazeFaceFactory { model }),
        decoder_factory(),
    );
    let app = build_router(registry.clone(), &config.cors);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("relay listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;
    Ok(())
}

async fn shutdown_signal(registry: SessionRegistry) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        return;
    }
    info!("shutdown signal received, closing sessions");
    registry.shutdown().await;
}
