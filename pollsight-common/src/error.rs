use thiserror::Error;

/// Errors from the shared configuration, encoding and logging helpers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR encoding error: {0}")]
    Cbor(String),
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::Cbor(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
