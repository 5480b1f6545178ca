use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] duet_core::Error),
    #[error(transparent)]
    Config(#[from] duet_core::config::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("--fields must be a JSON object")]
    FieldsNotAnObject,
    #[error("Pass --keep primary|secondary or --fields '<json object>'")]
    NoChoice,
    #[error("Refusing to clear the queue without --yes")]
    ClearNotConfirmed,
    #[error("Sync pass for {0} finished with failed tables: {1}")]
    PassIncomplete(String, String),
}
