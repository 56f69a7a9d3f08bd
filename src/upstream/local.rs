use std::io::ErrorKind;
use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncSeekExt as _;

use super::content_type_for;
use super::MediaId;
use super::ResourceDescriptor;
use super::ResourceSize;
use super::Upstream;
use super::UpstreamReader;
use crate::error::ProxyError;

/// Media files in a directory on this machine
#[derive(Clone, Debug)]
pub struct LocalUpstream {
    root: PathBuf,
}

impl LocalUpstream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &MediaId) -> PathBuf {
        self.root.join(id.as_path())
    }
}

#[async_trait]
impl Upstream for LocalUpstream {
    async fn describe(&self, id: &MediaId) -> Result<ResourceDescriptor, ProxyError> {
        let path = self.path_for(id);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(ResourceDescriptor::found(
                ResourceSize::Known(meta.len()),
                content_type_for(id, None),
            )),

            Ok(_) => {
                tracing::trace!("Not a file: {path:?}");
                Ok(ResourceDescriptor::missing())
            }

            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ResourceDescriptor::missing()),

            Err(err) => Err(err.into()),
        }
    }

    async fn open_range(
        &self,
        id: &MediaId,
        start: u64,
        length: Option<u64>,
    ) -> Result<UpstreamReader, ProxyError> {
        let path = self.path_for(id);

        let mut file = match File::open(&path).await {
            Ok(file) => file,

            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!("File is no longer available: {path:?}");
                return Err(ProxyError::NotFound);
            }

            Err(err) => return Err(err.into()),
        };

        // Seek and take the range of the file
        file.seek(SeekFrom::Start(start)).await?;

        let reader: UpstreamReader = match length {
            Some(length) => Box::pin(file.take(length)),
            None => Box::pin(file),
        };

        Ok(reader)
    }
}
