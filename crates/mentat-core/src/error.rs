use thiserror::Error;

/// Errors surfaced by the core crate.
///
/// These stay typed so the agent crate can distinguish "the model server is
/// unreachable" from "the configuration file is broken"; the agent itself
/// reports through `anyhow` and the solve-level error log.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    #[error("response failed schema validation: {0}")]
    SchemaValidation(String),
}
