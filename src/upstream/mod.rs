//! Where the media bytes actually live.
//!
//! The proxy only needs two things from a store: the facts about a file (does it exist, how
//! big is it, what is it) and a reader that starts at an arbitrary offset. Stores that
//! cannot seek are expected to skip ahead themselves before handing out the reader.

use std::fmt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::LazyLock;

use async_trait::async_trait;
use axum::http::HeaderValue;
use mime::APPLICATION_OCTET_STREAM;
use tokio::io::AsyncRead;

use crate::error::ProxyError;

pub mod local;
pub mod webdav;

pub use local::LocalUpstream;
pub use webdav::WebDavUpstream;

static CONTENT_TYPE_APPLICATION_OCTET_STREAM: LazyLock<HeaderValue> = LazyLock::new(|| {
    HeaderValue::from_str(APPLICATION_OCTET_STREAM.as_ref())
        .expect("A valid application/octet-stream header value")
});

/// An open byte-range read; dropping it releases the upstream connection or file handle.
pub type UpstreamReader = Pin<Box<dyn AsyncRead + Send>>;

/// Size of a resource as far as the upstream knows it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceSize {
    Known(u64),
    Unknown,
}

impl ResourceSize {
    #[inline]
    pub const fn known(self) -> Option<u64> {
        match self {
            ResourceSize::Known(size) => Some(size),
            ResourceSize::Unknown => None,
        }
    }
}

/// Facts about one upstream resource, fetched once per request.
#[derive(Clone, Debug)]
pub struct ResourceDescriptor {
    pub exists: bool,
    pub size: ResourceSize,
    pub content_type: HeaderValue,
}

impl ResourceDescriptor {
    pub fn found(size: ResourceSize, content_type: HeaderValue) -> Self {
        Self {
            exists: true,
            size,
            content_type,
        }
    }

    pub fn missing() -> Self {
        Self {
            exists: false,
            size: ResourceSize::Unknown,
            content_type: CONTENT_TYPE_APPLICATION_OCTET_STREAM.clone(),
        }
    }
}

/// Pick the content type: the upstream's own claim if it says anything useful, otherwise a
/// guess from the file extension.
pub fn content_type_for(id: &MediaId, reported: Option<&HeaderValue>) -> HeaderValue {
    if let Some(reported) = reported {
        if *reported != *CONTENT_TYPE_APPLICATION_OCTET_STREAM {
            return reported.clone();
        }
    }

    mime_guess::from_path(id.as_path())
        .first_raw()
        .map_or_else(
            || CONTENT_TYPE_APPLICATION_OCTET_STREAM.clone(),
            HeaderValue::from_static,
        )
}

/// Relative path of a media file below the upstream root.
///
/// Only plain path components are accepted, so an id can never escape the root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MediaId(PathBuf);

impl MediaId {
    /// # Errors
    ///
    /// Fails with [`ProxyError::InvalidPath`] on empty, absolute or traversing paths.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let path = PathBuf::from(raw.trim_start_matches('/'));

        // quick check to see if there are any weird path traversal tricks
        let is_valid = path.components().next().is_some()
            && path
                .components()
                .all(|comp| matches!(comp, Component::Normal(_)));

        if !is_valid {
            return Err(ProxyError::InvalidPath(raw.to_owned()));
        }

        Ok(Self(path))
    }

    #[inline]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The path split into its components, as UTF-8
    pub fn segments(&self) -> impl Iterator<Item = std::borrow::Cow<'_, str>> {
        self.0
            .components()
            .map(|comp| comp.as_os_str().to_string_lossy())
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch existence, size and content type in one go.
    async fn describe(&self, id: &MediaId) -> Result<ResourceDescriptor, ProxyError>;

    /// Open a read starting at `start`, yielding at most `length` bytes (or everything up to
    /// the end when `length` is `None`).
    async fn open_range(
        &self,
        id: &MediaId,
        start: u64,
        length: Option<u64>,
    ) -> Result<UpstreamReader, ProxyError>;

    async fn exists(&self, id: &MediaId) -> Result<bool, ProxyError> {
        Ok(self.describe(id).await?.exists)
    }

    async fn size(&self, id: &MediaId) -> Result<ResourceSize, ProxyError> {
        let descriptor = self.describe(id).await?;

        if !descriptor.exists {
            return Err(ProxyError::NotFound);
        }

        Ok(descriptor.size)
    }

    async fn content_type(&self, id: &MediaId) -> Result<HeaderValue, ProxyError> {
        let descriptor = self.describe(id).await?;

        if !descriptor.exists {
            return Err(ProxyError::NotFound);
        }

        Ok(descriptor.content_type)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory upstream that records what the proxy does with it.

    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::task::Context;
    use std::task::Poll;

    use bytes::Bytes;
    use tokio::io::ReadBuf;

    use super::*;

    /// How a reader misbehaves once it has produced `after` bytes
    #[derive(Clone, Copy, Debug)]
    pub enum Failure {
        /// the connection closes cleanly, too early
        Eof { after: usize },

        /// the connection breaks
        Error { after: usize },

        /// the upstream stops sending without closing
        Stall { after: usize },
    }

    #[derive(Default)]
    pub struct MemoryUpstream {
        files: HashMap<PathBuf, Bytes>,
        hide_size: bool,
        failure: Option<Failure>,
        stall_describe: bool,
        opens: AtomicUsize,
        released: Arc<AtomicUsize>,
    }

    impl MemoryUpstream {
        pub fn with_file(mut self, name: &str, content: impl Into<Bytes>) -> Self {
            self.files.insert(PathBuf::from(name), content.into());
            self
        }

        pub fn without_size(mut self) -> Self {
            self.hide_size = true;
            self
        }

        pub fn failing(mut self, failure: Failure) -> Self {
            self.failure = Some(failure);
            self
        }

        pub fn stalling_describe(mut self) -> Self {
            self.stall_describe = true;
            self
        }

        /// Number of byte-range reads opened so far
        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        /// Number of readers that have been dropped
        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    /// Generate deterministic test content.
    pub fn content(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[async_trait]
    impl Upstream for MemoryUpstream {
        async fn describe(&self, id: &MediaId) -> Result<ResourceDescriptor, ProxyError> {
            if self.stall_describe {
                std::future::pending::<()>().await;
            }

            Ok(match self.files.get(id.as_path()) {
                Some(content) => {
                    let size = if self.hide_size {
                        ResourceSize::Unknown
                    } else {
                        ResourceSize::Known(content.len() as u64)
                    };

                    ResourceDescriptor::found(size, content_type_for(id, None))
                }
                None => ResourceDescriptor::missing(),
            })
        }

        async fn open_range(
            &self,
            id: &MediaId,
            start: u64,
            length: Option<u64>,
        ) -> Result<UpstreamReader, ProxyError> {
            let content = self.files.get(id.as_path()).ok_or(ProxyError::NotFound)?;

            self.opens.fetch_add(1, Ordering::SeqCst);

            let start = (start as usize).min(content.len());
            let end = length.map_or(content.len(), |length| {
                (start + length as usize).min(content.len())
            });

            Ok(Box::pin(MemoryReader {
                data: content.slice(start..end),
                position: 0,
                failure: self.failure,
                released: Arc::clone(&self.released),
            }))
        }
    }

    struct MemoryReader {
        data: Bytes,
        position: usize,
        failure: Option<Failure>,
        released: Arc<AtomicUsize>,
    }

    impl AsyncRead for MemoryReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let mut limit = self.data.len();

            match self.failure {
                Some(Failure::Eof { after }) => limit = limit.min(after),
                Some(Failure::Error { after }) if self.position >= after => {
                    return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                }
                Some(Failure::Error { after }) => limit = limit.min(after),
                Some(Failure::Stall { after }) if self.position >= after => {
                    return Poll::Pending;
                }
                Some(Failure::Stall { after }) => limit = limit.min(after),
                None => {}
            }

            let n = buf.remaining().min(limit - self.position.min(limit));
            let position = self.position;
            buf.put_slice(&self.data[position..position + n]);
            self.position += n;

            Poll::Ready(Ok(()))
        }
    }

    impl Drop for MemoryReader {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}
