//! Local filesystem provider.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

use crate::attributes::{AccessCondition, Attributes, ContentProperties, Metadata};
use crate::error::ProviderError;
use crate::location::Location;
use crate::provider::{ChunkAddress, ChunkPayload, ObjectDestination, ObjectSource, ProviderFuture};

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(file_path: &str) -> Result<(), ProviderError> {
    if file_path.is_empty() {
        return Err(ProviderError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);
    if path.is_absolute() {
        return Err(ProviderError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ProviderError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(ProviderError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(ProviderError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// A file on the local filesystem, usable as source and destination.
pub struct LocalObject {
    location: Location,
    path: PathBuf,
}

impl LocalObject {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            location: Location::local(path.clone()),
            path,
        }
    }

    /// Resolves `relative` under `base`, refusing paths that escape it.
    pub fn under(base: &Path, relative: &str) -> Result<Self, ProviderError> {
        validate_relative_path(relative)?;
        Ok(Self::new(base.join(relative)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn attributes(&self) -> Result<Attributes, ProviderError> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::NotFound(self.path.display().to_string())
            } else {
                ProviderError::Io(e)
            }
        })?;
        if meta.is_dir() {
            return Err(ProviderError::InvalidPath(format!(
                "{} is a directory",
                self.path.display()
            )));
        }
        Ok(Attributes {
            length: meta.len(),
            ..Attributes::default()
        })
    }

    async fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>, ProviderError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(length as usize);
        file.take(length).read_to_end(&mut buf).await?;
        trace!(path = %self.path.display(), offset, read = buf.len(), "local read");
        Ok(buf)
    }

    async fn write_at(
        &self,
        address: ChunkAddress,
        payload: ChunkPayload,
        conditions: AccessCondition,
    ) -> Result<(), ProviderError> {
        let ChunkPayload::Bytes(data) = payload else {
            return Err(ProviderError::unsupported("server-side copy", &self.location));
        };
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        let offset = match address {
            ChunkAddress::Range { offset } => offset,
            ChunkAddress::Append => {
                let len = file.metadata().await?.len();
                if let Some(expected) = conditions.append_position
                    && expected != len
                {
                    return Err(ProviderError::PreconditionFailed(format!(
                        "append position {expected} does not match length {len}"
                    )));
                }
                len
            }
            ChunkAddress::Block { .. } => {
                return Err(ProviderError::unsupported("block write", &self.location));
            }
        };
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        trace!(path = %self.path.display(), offset, len = data.len(), "local write");
        Ok(())
    }

    async fn allocate(&self, size: u64) -> Result<(), ProviderError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.set_len(size).await?;
        Ok(())
    }
}

impl ObjectSource for LocalObject {
    fn location(&self) -> &Location {
        &self.location
    }

    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes> {
        Box::pin(self.attributes())
    }

    fn read_range(
        &self,
        offset: u64,
        length: u64,
        _conditions: AccessCondition,
    ) -> ProviderFuture<'_, Vec<u8>> {
        Box::pin(self.read_at(offset, length))
    }
}

impl ObjectDestination for LocalObject {
    fn location(&self) -> &Location {
        &self.location
    }

    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes> {
        Box::pin(self.attributes())
    }

    fn create(&self, size: u64, _conditions: AccessCondition) -> ProviderFuture<'_, ()> {
        Box::pin(self.allocate(size))
    }

    fn write_chunk(
        &self,
        address: ChunkAddress,
        payload: ChunkPayload,
        conditions: AccessCondition,
    ) -> ProviderFuture<'_, ()> {
        Box::pin(self.write_at(address, payload, conditions))
    }

    fn commit(&self, _properties: ContentProperties, _metadata: Metadata) -> ProviderFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn read_range(&self, offset: u64, length: u64) -> ProviderFuture<'_, Vec<u8>> {
        Box::pin(self.read_at(offset, length))
    }
}
