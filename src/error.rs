use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

/// Malformed playlist text. Setup aborts on these; the parser never guesses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("playlist does not start with #EXTM3U")]
    MissingHeader,

    #[error("{tag} is not followed by a URI line")]
    MissingUri { tag: &'static str },

    #[error("invalid segment duration in line `{line}`")]
    InvalidDuration { line: String },

    #[error("playlist declares both variant streams and media segments")]
    MixedPlaylist,
}

/// Failure while talking to an upstream host.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} responded with HTTP {status}")]
    Status { status: StatusCode, url: String },

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("body of {url} exceeds the limit of {limit} bytes")]
    BodyTooLarge { url: String, limit: u64 },
}

impl UpstreamError {
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            return Self::Timeout { url };
        }
        Self::Network { url, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Status { status, .. } => *status,
            Self::Network { .. } | Self::BodyTooLarge { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("playlist parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("playlist resolution failed: {reason}")]
    Resolution { reason: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("resource of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("range not satisfiable for length {length}")]
    RangeNotSatisfiable { length: u64 },

    #[error("no proxy is active")]
    NoProxy,
}

impl ProxyError {
    pub fn resolution(reason: impl Into<String>) -> Self {
        Self::Resolution {
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Parse(_) | Self::Resolution { .. } => StatusCode::BAD_GATEWAY,
            Self::Upstream(e) => e.status_code(),
            Self::Io { source } if source.kind() == std::io::ErrorKind::StorageFull => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TooLarge { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::NotFound { .. } | Self::NoProxy => StatusCode::NOT_FOUND,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        debug!("Responding with error: status={} err={}", status, self);
        let mut builder = Response::builder()
            .status(status)
            .header("Cache-Control", "no-cache");
        if let Self::RangeNotSatisfiable { length } = &self {
            builder = builder.header("Content-Range", format!("bytes */{length}"));
        }
        builder
            .body(Body::from(self.to_string()))
            .unwrap_or_else(|_| status.into_response())
    }
}
