use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup manager not initialized")]
    Uninitialized,

    #[error("InfluxDB is not running on {host}:{port}")]
    Unreachable { host: String, port: u16 },

    #[error("InfluxDB version {found} is lower than {minimum}")]
    UnsupportedVersion { found: String, minimum: String },

    #[error("influxd failed: {0}")]
    Subprocess(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Decompress error: {0}")]
    Decompress(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl From<zip::result::ZipError> for BackupError {
    fn from(e: zip::result::ZipError) -> Self {
        BackupError::Archive(e.to_string())
    }
}

impl From<serde_yaml::Error> for BackupError {
    fn from(e: serde_yaml::Error) -> Self {
        BackupError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Query(e.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Internal(e.to_string())
    }
}
