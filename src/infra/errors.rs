// src/infra/errors.rs — Error types for streamcap

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    // Transient-external: status temporarily unknown, never "all offline"
    #[error("Helix status fetch failed: {0}")]
    StatusFetch(String),

    // Protocol-disconnect
    #[error("IRC protocol error: {0}")]
    Protocol(String),

    #[error("IRC connection is closed")]
    Disconnected,

    // Configuration/startup (fatal before the loop starts)
    #[error("Missing credential: set {0} in the environment")]
    MissingCredentials(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    // Infra
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
