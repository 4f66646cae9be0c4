use thiserror::Error;

/// Library-wide error type.
///
/// Transient I/O failures (probe timeouts, unreachable hosts) are generally
/// mapped to sentinel values at the component boundary and never reach this
/// type; what remains here are failures the caller has to decide about.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("home assistant error: {0}")]
    HomeAssistant(String),

    #[error("privileged operation failed: {0}")]
    Privileged(String),

    #[error("decoy error: {0}")]
    Decoy(String),

    #[error("duplicate credential value generated")]
    DuplicateCredential,

    #[error("decoy {0} not found")]
    DecoyNotFound(i64),

    #[error("no virtual IPs available")]
    IpPoolExhausted,
}

pub type Result<T> = std::result::Result<T, SensorError>;
