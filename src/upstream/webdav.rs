use std::io;

use async_trait::async_trait;
use axum_extra::headers::ContentRange;
use axum_extra::headers::HeaderMapExt as _;
use futures_util::TryStreamExt as _;
use reqwest::header::CONTENT_LENGTH;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::RANGE;
use reqwest::Client;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::Url;
use tokio::io::AsyncReadExt as _;
use tokio_util::io::StreamReader;

use super::content_type_for;
use super::MediaId;
use super::ResourceDescriptor;
use super::ResourceSize;
use super::Upstream;
use super::UpstreamReader;
use crate::error::ProxyError;

#[derive(Debug, thiserror::Error)]
#[error("\"{0}\" cannot be used as a WebDAV base URL")]
pub struct InvalidBaseUrl(pub Url);

/// Media files on a WebDAV server, read with plain HTTP range requests
#[derive(Clone, Debug)]
pub struct WebDavUpstream {
    client: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl WebDavUpstream {
    /// Files are looked up below `root` on the server at `base`.
    pub fn new(mut base: Url, root: &str) -> Result<Self, InvalidBaseUrl> {
        if base.cannot_be_a_base() {
            return Err(InvalidBaseUrl(base));
        }

        if let Ok(mut segments) = base.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(root.split('/').filter(|segment| !segment.is_empty()));
        }

        Ok(Self {
            client: Client::new(),
            base,
            username: None,
            password: None,
        })
    }

    #[must_use]
    pub fn with_credentials(mut self, username: String, password: Option<String>) -> Self {
        self.username = Some(username);
        self.password = password;
        self
    }

    fn url_for(&self, id: &MediaId) -> Url {
        let mut url = self.base.clone();

        // the base is checked to be a proper base URL on construction
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(id.segments());
        }

        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);

        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_ref()),
            None => request,
        }
    }

    /// Fallback for servers that refuse `HEAD`: ask for the first byte and read the size
    /// from the `Content-Range` of the answer.
    async fn probe(&self, id: &MediaId, url: Url) -> Result<ResourceDescriptor, ProxyError> {
        let response = self
            .request(Method::GET, url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("WebDAV probe for {id} answered {status}");

        let size = match status {
            StatusCode::NOT_FOUND => return Ok(ResourceDescriptor::missing()),

            StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => response
                .headers()
                .typed_get::<ContentRange>()
                .and_then(|range| range.bytes_len())
                .map_or(ResourceSize::Unknown, ResourceSize::Known),

            status if status.is_success() => content_length(&response),

            status => return Err(ProxyError::UpstreamStatus(status)),
        };

        Ok(ResourceDescriptor::found(
            size,
            content_type_for(id, response.headers().get(CONTENT_TYPE)),
        ))
    }
}

/// `Content-Length` as sent by the server; `Response::content_length` cannot be used
/// because it reports the (empty) body of a `HEAD` response
fn content_length(response: &Response) -> ResourceSize {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(ResourceSize::Unknown, ResourceSize::Known)
}

#[async_trait]
impl Upstream for WebDavUpstream {
    async fn describe(&self, id: &MediaId) -> Result<ResourceDescriptor, ProxyError> {
        let url = self.url_for(id);
        let response = self.request(Method::HEAD, url.clone()).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(ResourceDescriptor::missing()),

            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                self.probe(id, url).await
            }

            status if status.is_success() => Ok(ResourceDescriptor::found(
                content_length(&response),
                content_type_for(id, response.headers().get(CONTENT_TYPE)),
            )),

            status => {
                tracing::warn!("WebDAV HEAD for {id} failed with {status}");
                Err(ProxyError::UpstreamStatus(status))
            }
        }
    }

    async fn open_range(
        &self,
        id: &MediaId,
        start: u64,
        length: Option<u64>,
    ) -> Result<UpstreamReader, ProxyError> {
        let mut request = self.request(Method::GET, self.url_for(id));

        match length {
            Some(0) => return Ok(Box::pin(tokio::io::empty())),
            Some(length) => {
                let end = start.saturating_add(length - 1);
                request = request.header(RANGE, format!("bytes={start}-{end}"));
            }
            None if start > 0 => {
                request = request.header(RANGE, format!("bytes={start}-"));
            }
            None => {}
        }

        let response = request.send().await?;

        let skip = match response.status() {
            StatusCode::NOT_FOUND => return Err(ProxyError::NotFound),

            StatusCode::PARTIAL_CONTENT => {
                let actual = response
                    .headers()
                    .typed_get::<ContentRange>()
                    .and_then(|range| range.bytes_range())
                    .map(|(first, _)| first);

                if let Some(actual) = actual {
                    if actual != start {
                        return Err(ProxyError::UpstreamRangeMismatch {
                            expected: start,
                            actual,
                        });
                    }
                }

                0
            }

            // the server ignored the range and sends everything
            StatusCode::OK => start,

            status => {
                tracing::warn!("WebDAV GET for {id} failed with {status}");
                return Err(ProxyError::UpstreamStatus(status));
            }
        };

        let stream = response.bytes_stream().map_err(io::Error::other);
        let mut reader: UpstreamReader = Box::pin(StreamReader::new(stream));

        if skip > 0 {
            tracing::debug!("WebDAV server ignored the range for {id}, skipping {skip} bytes");

            let skipped = tokio::io::copy(&mut (&mut reader).take(skip), &mut tokio::io::sink())
                .await?;

            if skipped < skip {
                return Err(ProxyError::UpstreamRangeMismatch {
                    expected: start,
                    actual: skipped,
                });
            }
        }

        if let Some(length) = length {
            reader = Box::pin(reader.take(length));
        }

        Ok(reader)
    }
}
