use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Optimizer failed: {0}")]
    Optimizer(String),
    #[error("Optimizer did not answer in time")]
    OptimizerTimeout,
    #[error("State handoff failed: {0}")]
    Handoff(String),
    #[error("The node has been shut down")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, Error>;
