use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("No active job for {0}")]
    JobNotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("Cannot rename: {0}")]
    RenameRefused(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures reported by a backing download or upload engine.
///
/// Adapters never let anything else escape their boundary; the listener turns
/// these into user-facing reasons with `to_string()`.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    #[error("engine rejected request ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed engine response: {0}")]
    Malformed(String),

    #[error("unsupported source: {0}")]
    InvalidSource(String),

    #[error("engine did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown engine handle {0}")]
    UnknownHandle(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("I/O failure: {0}")]
    Io(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            EngineError::Malformed(err.to_string())
        } else {
            EngineError::Unreachable(err.to_string())
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job {0} is already registered")]
    Duplicate(String),

    #[error("job {0} is not registered")]
    NotFound(String),

    #[error("job {uid} no longer uses handle {handle}")]
    StaleHandle { uid: String, handle: String },
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("not a supported archive: {0}")]
    NotSupported(String),

    #[error("archive command failed: {0}")]
    Command(String),

    #[error("archive I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip failure: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
