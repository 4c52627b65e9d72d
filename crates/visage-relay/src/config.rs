//! Environment-driven relay configuration.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use visage_common::{Error, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Allowed origins for the browser-facing HTTP endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorsOrigins {
    /// Any origin, without credentials.
    Any,
    /// An explicit allow-list, with credentials enabled.
    List(Vec<String>),
}

/// Runtime configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub stun_url: String,
    pub cors: CorsOrigins,
    /// Path to the face model, required for the standalone binary.
    pub model_path: Option<PathBuf>,
    /// Override for the model's raw-hit confidence threshold.
    pub detect_confidence: Option<f32>,
}

impl RelayConfig {
    /// Read configuration from `VISAGE_*` environment variables, falling
    /// back to defaults for everything except the model path.
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("VISAGE_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_owned())
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("invalid VISAGE_BIND_ADDR: {e}")))?;

        let stun_url = env::var("VISAGE_STUN_URL").unwrap_or_else(|_| DEFAULT_STUN_URL.to_owned());

        let cors = parse_cors_origins(
            env::var("VISAGE_CORS_ORIGINS")
                .unwrap_or_else(|_| "*".to_owned())
                .as_str(),
        );

        let model_path = env::var("VISAGE_MODEL_PATH").ok().map(PathBuf::from);

        let detect_confidence = match env::var("VISAGE_DETECT_CONFIDENCE") {
            Ok(raw) => Some(
                raw.parse::<f32>()
                    .ok()
                    .filter(|c| (0.0..=1.0).contains(c))
                    .ok_or_else(|| {
                        Error::config(format!("invalid VISAGE_DETECT_CONFIDENCE: {raw:?}"))
                    })?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            bind_addr,
            stun_url,
            cors,
            model_path,
            detect_confidence,
        })
    }
}

/// Parse a comma-separated origin list; `*` (or empty) means any origin.
pub fn parse_cors_origins(raw: &str) -> CorsOrigins {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return CorsOrigins::Any;
    }
    CorsOrigins::List(
        trimmed
            .split(',')
            .map(|o| o.trim().to_owned())
            .filter(|o| !o.is_empty())
            .collect(),
    )
}
