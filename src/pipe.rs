//! Streaming of planned byte ranges from the upstream to the client.
//!
//! A [`StreamSession`] owns the single upstream reader of one response and hands out chunks
//! as they arrive, never reading further ahead than one chunk. Once the headers are out
//! nothing can be corrected any more: an upstream that ends early or fails ends the body
//! early, and the client notices the short read against `Content-Length`.
//!
//! ```text
//! Idle -> HeadersCommitted -> Streaming -> Completed
//!                                      \-> Aborted
//! ```

use std::future::Future as _;
use std::io;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CACHE_CONTROL;
use axum::http::header::CONTENT_DISPOSITION;
use axum::http::header::CONTENT_TYPE;
use axum::http::header::X_CONTENT_TYPE_OPTIONS;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::response::Response;
use axum_extra::headers::AcceptRanges;
use axum_extra::headers::ContentLength;
use axum_extra::headers::HeaderMapExt as _;
use bytes::BufMut as _;
use bytes::Bytes;
use bytes::BytesMut;
use futures_util::Stream;
use tokio::time::Sleep;
use tokio_util::io::poll_read_buf;

use crate::config::ProxySettings;
use crate::error::ProxyError;
use crate::range::RangePlan;
use crate::upstream::MediaId;
use crate::upstream::ResourceDescriptor;
use crate::upstream::Upstream;
use crate::upstream::UpstreamReader;

/// Partial streams must never end up in a cache
const CACHE_CONTROL_NO_STORE: HeaderValue = HeaderValue::from_static("no-store, must-revalidate");

/// Play in the browser instead of downloading
const CONTENT_DISPOSITION_INLINE: HeaderValue = HeaderValue::from_static("inline");

const NOSNIFF: HeaderValue = HeaderValue::from_static("nosniff");

/// The upstream closed the connection before the declared length was sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Upstream ended after {sent} of {expected} bytes")]
pub struct StreamTruncated {
    pub expected: u64,
    pub sent: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HeadersCommitted,
    Streaming,
    Completed,
    Aborted,
}

impl SessionState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

/// Live forwarding state of one response.
pub struct StreamSession {
    id: MediaId,
    state: SessionState,
    reader: Option<UpstreamReader>,
    buffer: BytesMut,
    chunk_size: usize,
    read_timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
    content_length: Option<u64>,
    bytes_sent: u64,
}

impl StreamSession {
    pub fn new(
        id: MediaId,
        reader: UpstreamReader,
        plan: &RangePlan,
        settings: &ProxySettings,
    ) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            reader: Some(reader),
            buffer: BytesMut::new(),
            chunk_size: settings.chunk_size.max(1),
            read_timeout: settings.read_timeout,
            deadline: None,
            content_length: plan.content_length(),
            bytes_sent: 0,
        }
    }

    /// Mark the response headers as sent; from here on the status can no longer change.
    pub fn commit_headers(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::HeadersCommitted;
        }
    }

    #[inline]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Whether the upstream reader has been let go
    #[inline]
    pub const fn is_released(&self) -> bool {
        self.reader.is_none()
    }

    fn remaining(&self) -> Option<u64> {
        self.content_length
            .map(|length| length.saturating_sub(self.bytes_sent))
    }

    /// Drop the upstream reader and enter a terminal state, only the first call counts
    fn release(&mut self, outcome: SessionState) {
        debug_assert!(outcome.is_terminal());

        if self.reader.take().is_none() {
            return;
        }

        self.deadline = None;
        self.state = outcome;

        if outcome == SessionState::Completed {
            tracing::debug!("Finished streaming {}: {} bytes", self.id, self.bytes_sent);
        }
    }

    fn abort(&mut self, err: io::Error) -> Poll<Option<io::Result<Bytes>>> {
        tracing::warn!(
            "Streaming {} aborted after {} bytes: {err}",
            self.id,
            self.bytes_sent
        );

        self.release(SessionState::Aborted);

        Poll::Ready(Some(Err(err)))
    }
}

impl Stream for StreamSession {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.state {
            SessionState::Completed | SessionState::Aborted => return Poll::Ready(None),
            SessionState::Idle | SessionState::HeadersCommitted => {
                this.state = SessionState::Streaming;
            }
            SessionState::Streaming => {}
        }

        let wanted = match this.remaining() {
            Some(0) => {
                this.release(SessionState::Completed);
                return Poll::Ready(None);
            }
            Some(remaining) => usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .min(this.chunk_size),
            None => this.chunk_size,
        };

        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(None);
        };

        this.buffer.reserve(wanted);
        let mut limited = (&mut this.buffer).limit(wanted);

        match poll_read_buf(Pin::new(reader), cx, &mut limited) {
            Poll::Pending => {
                let read_timeout = this.read_timeout;
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(read_timeout)));

                if deadline.as_mut().poll(cx).is_ready() {
                    return this.abort(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!(
                            "no data from upstream within {}",
                            humantime::format_duration(read_timeout)
                        ),
                    ));
                }

                Poll::Pending
            }

            Poll::Ready(Err(err)) => this.abort(err),

            Poll::Ready(Ok(0)) => match this.content_length {
                Some(expected) if this.bytes_sent < expected => {
                    let truncated = StreamTruncated {
                        expected,
                        sent: this.bytes_sent,
                    };

                    this.abort(io::Error::new(io::ErrorKind::UnexpectedEof, truncated))
                }

                _ => {
                    this.release(SessionState::Completed);
                    Poll::Ready(None)
                }
            },

            Poll::Ready(Ok(n)) => {
                this.deadline = None;
                this.bytes_sent += n as u64;

                let chunk = this.buffer.split().freeze();

                tracing::trace!("Forwarding {n} bytes of {}", this.id);

                if this.remaining() == Some(0) {
                    this.release(SessionState::Completed);
                }

                Poll::Ready(Some(Ok(chunk)))
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::debug!(
                "Client went away while streaming {} after {} bytes",
                self.id,
                self.bytes_sent
            );

            self.release(SessionState::Aborted);
        }
    }
}

/// Headers every media response carries, errors included.
pub fn apply_common_headers(headers: &mut HeaderMap) {
    headers.typed_insert(AcceptRanges::bytes());
    headers.insert(X_CONTENT_TYPE_OPTIONS, NOSNIFF);
    headers.insert(CACHE_CONTROL, CACHE_CONTROL_NO_STORE);
}

/// The headers derived from a plan, identical for `GET` and `HEAD`.
pub fn response_headers(plan: &RangePlan, descriptor: &ResourceDescriptor) -> HeaderMap {
    let mut headers = HeaderMap::new();

    apply_common_headers(&mut headers);
    headers.insert(CONTENT_TYPE, descriptor.content_type.clone());
    headers.insert(CONTENT_DISPOSITION, CONTENT_DISPOSITION_INLINE);

    if let Some(content_length) = plan.content_length() {
        headers.typed_insert(ContentLength(content_length));
    }

    if let Some(content_range) = plan.content_range() {
        headers.typed_insert(content_range);
    }

    headers
}

/// Answer a `HEAD` request, without touching the upstream bytes.
pub fn head(plan: &RangePlan, descriptor: &ResourceDescriptor) -> Response {
    (plan.status(), response_headers(plan, descriptor)).into_response()
}

/// Open the planned range upstream and stream it back.
///
/// # Errors
///
/// Failing to open the upstream read is still reported as an error response; afterwards the
/// headers are committed and failures only shorten the body.
pub async fn open(
    upstream: &dyn Upstream,
    id: &MediaId,
    descriptor: &ResourceDescriptor,
    plan: &RangePlan,
    settings: &ProxySettings,
) -> Result<Response, ProxyError> {
    let reader = tokio::time::timeout(
        settings.upstream_timeout,
        upstream.open_range(id, plan.start(), plan.content_length()),
    )
    .await
    .map_err(|_| ProxyError::UpstreamTimeout(settings.upstream_timeout))??;

    let headers = response_headers(plan, descriptor);

    let mut session = StreamSession::new(id.clone(), reader, plan, settings);
    session.commit_headers();

    Ok((plan.status(), headers, Body::from_stream(session)).into_response())
}
