use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("Cache IO error: {0}")]
    CacheIo(String),

    #[error("Stream IO error: {0}")]
    StreamIo(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code sent to the client when this error ends a request.
    ///
    /// 416 is reused as the generic "bad target URL" rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUri(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
