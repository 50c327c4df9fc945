use std::path::PathBuf;

use rewind_engine::RewindError;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] RewindError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    Input(String),
}
