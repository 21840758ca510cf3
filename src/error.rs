//! Application-wide error types.

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
