use thiserror::Error;

/// Failures talking to the embedding or chat provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

/// Failures in the offline pipeline (crawl, clean, chunk, embed).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("index storage error: {0}")]
    Storage(String),

    #[error("crawl job failed: {0}")]
    Crawl(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Failures on the request-serving path.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("index storage error: {0}")]
    Storage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("service not ready yet: {0}")]
    NotReady(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
