use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("Invalid or missing API key")]
    Auth,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("no models found for group: {0}")]
    UnknownGroup(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("upstream error ({status}): {body}")]
    UpstreamStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("invalid stream payload: {0}")]
    InvalidStream(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;
