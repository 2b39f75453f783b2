//! Sequential adapters over generic async byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::attributes::{AccessCondition, Attributes, ContentProperties, Metadata};
use crate::error::ProviderError;
use crate::location::Location;
use crate::provider::{ChunkAddress, ChunkPayload, ObjectDestination, ObjectSource, ProviderFuture};

struct Cursor<T> {
    inner: T,
    position: u64,
}

/// Read side of a byte stream.
///
/// Reads must arrive in offset order. The length may be unknown, in which
/// case the engine discovers it from the first short read.
pub struct StreamSource<R> {
    location: Location,
    length: Option<u64>,
    reader: Mutex<Cursor<R>>,
}

impl<R> StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(name: &str, reader: R, length: Option<u64>) -> Self {
        Self {
            location: Location::stream(name),
            length,
            reader: Mutex::new(Cursor {
                inner: reader,
                position: 0,
            }),
        }
    }

    async fn read_next(&self, offset: u64, length: u64) -> Result<Vec<u8>, ProviderError> {
        let mut cursor = self.reader.lock().await;
        if offset != cursor.position {
            return Err(ProviderError::InvalidRange(format!(
                "stream is at {}, cannot read at {offset}",
                cursor.position
            )));
        }
        let mut buf = Vec::with_capacity(length as usize);
        (&mut cursor.inner).take(length).read_to_end(&mut buf).await?;
        cursor.position += buf.len() as u64;
        Ok(buf)
    }
}

impl<R> ObjectSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn location(&self) -> &Location {
        &self.location
    }

    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes> {
        let length = self.length.unwrap_or(0);
        Box::pin(async move {
            Ok(Attributes {
                length,
                ..Attributes::default()
            })
        })
    }

    fn read_range(
        &self,
        offset: u64,
        length: u64,
        _conditions: AccessCondition,
    ) -> ProviderFuture<'_, Vec<u8>> {
        Box::pin(self.read_next(offset, length))
    }

    fn sequential_only(&self) -> bool {
        true
    }

    fn length_known(&self) -> bool {
        self.length.is_some()
    }
}

/// Write side of a byte stream. Writes must arrive in offset order.
pub struct StreamDestination<W> {
    location: Location,
    writer: Mutex<Cursor<W>>,
}

impl<W> StreamDestination<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(name: &str, writer: W) -> Self {
        Self {
            location: Location::stream(name),
            writer: Mutex::new(Cursor {
                inner: writer,
                position: 0,
            }),
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().inner
    }

    async fn write_next(
        &self,
        address: ChunkAddress,
        payload: ChunkPayload,
    ) -> Result<(), ProviderError> {
        let ChunkPayload::Bytes(data) = payload else {
            return Err(ProviderError::unsupported("server-side copy", &self.location));
        };
        let mut cursor = self.writer.lock().await;
        match address {
            ChunkAddress::Range { offset } if offset != cursor.position => {
                return Err(ProviderError::InvalidRange(format!(
                    "stream is at {}, cannot write at {offset}",
                    cursor.position
                )));
            }
            ChunkAddress::Block { .. } => {
                return Err(ProviderError::unsupported("block write", &self.location));
            }
            _ => {}
        }
        cursor.inner.write_all(&data).await?;
        cursor.position += data.len() as u64;
        Ok(())
    }

    async fn attributes(&self) -> Result<Attributes, ProviderError> {
        let cursor = self.writer.lock().await;
        Ok(Attributes {
            length: cursor.position,
            ..Attributes::default()
        })
    }
}

impl<W> ObjectDestination for StreamDestination<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn location(&self) -> &Location {
        &self.location
    }

    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes> {
        Box::pin(self.attributes())
    }

    fn create(&self, _size: u64, _conditions: AccessCondition) -> ProviderFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn write_chunk(
        &self,
        address: ChunkAddress,
        payload: ChunkPayload,
        _conditions: AccessCondition,
    ) -> ProviderFuture<'_, ()> {
        Box::pin(self.write_next(address, payload))
    }

    fn commit(&self, _properties: ContentProperties, _metadata: Metadata) -> ProviderFuture<'_, ()> {
        self.flush()
    }

    fn flush(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let mut cursor = self.writer.lock().await;
            cursor.inner.flush().await?;
            Ok(())
        })
    }
}
