//! Failures that can still be reported with a status line.
//!
//! Anything that goes wrong after the response headers have been sent is handled in
//! [`crate::pipe`] instead, by ending the body early.

use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum_extra::headers::HeaderMapExt as _;
use humantime::format_duration;

use crate::pipe::apply_common_headers;
use crate::range::RangeNotSatisfiable;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid media path \"{0}\"")]
    InvalidPath(String),

    #[error("Media not found")]
    NotFound,

    #[error(transparent)]
    RangeNotSatisfiable(#[from] RangeNotSatisfiable),

    #[error("Upstream did not answer within {}", format_duration(*.0))]
    UpstreamTimeout(Duration),

    #[error("Upstream I/O failed: {0}")]
    UpstreamIo(#[from] std::io::Error),

    #[error("Upstream request failed: {0}")]
    UpstreamRequest(#[from] reqwest::Error),

    #[error("Upstream answered with status {0}")]
    UpstreamStatus(StatusCode),

    #[error("Upstream sent bytes from offset {actual} instead of {expected}")]
    UpstreamRangeMismatch { expected: u64, actual: u64 },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamRequest(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamIo(_)
            | ProxyError::UpstreamRequest(_)
            | ProxyError::UpstreamStatus(_)
            | ProxyError::UpstreamRangeMismatch { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the client may simply try the same request again
    pub fn is_retryable(&self) -> bool {
        self.status().is_server_error()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        apply_common_headers(&mut headers);

        match &self {
            ProxyError::RangeNotSatisfiable(err) => {
                tracing::debug!("{err}");

                headers.typed_insert(err.content_range());
            }

            _ if self.is_retryable() => {
                tracing::warn!("Upstream failure before response was committed: {self}");
            }

            _ => {
                tracing::debug!("{self}");
            }
        }

        (status, headers, self.to_string()).into_response()
    }
}
