//! The closed set of places an object can be read from or written to.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{MAX_BLOCK_COUNT, MAX_BLOCK_SIZE, MAX_RANGE_WRITE};

/// Addressing discipline of a remote blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlobKind {
    /// Independently addressed blocks committed as an ordered list.
    Block,
    /// Fixed-size, 512-byte-page addressable, possibly sparse.
    Page,
    /// Writable only at its current end.
    Append,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Block => "block blob",
            Self::Page => "page blob",
            Self::Append => "append blob",
        };
        f.write_str(s)
    }
}

/// A blob inside a container of a blob endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobLocation {
    /// Service endpoint without a trailing slash, e.g. `https://acct.blob.example`.
    pub endpoint: String,
    pub container: String,
    pub name: String,
    pub kind: BlobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A file inside a share of a file endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    pub endpoint: String,
    pub share: String,
    pub path: String,
}

/// A caller-supplied byte stream, identified only by a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamLocation {
    pub name: String,
}

/// Source or destination of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Location {
    Blob(BlobLocation),
    File(FileLocation),
    /// Arbitrary URI, only usable as a server-side copy source.
    Uri { uri: String },
    Stream(StreamLocation),
    Local { path: PathBuf },
}

/// Discriminant of [`Location`], handy for logging and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Blob(BlobKind),
    File,
    Uri,
    Stream,
    Local,
}

impl Location {
    pub fn blob(endpoint: &str, container: &str, name: &str, kind: BlobKind) -> Self {
        Self::Blob(BlobLocation {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            container: container.to_string(),
            name: name.to_string(),
            kind,
            snapshot: None,
            version: None,
        })
    }

    pub fn file(endpoint: &str, share: &str, path: &str) -> Self {
        Self::File(FileLocation {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            share: share.to_string(),
            path: path.trim_start_matches('/').to_string(),
        })
    }

    pub fn uri(uri: &str) -> Self {
        Self::Uri {
            uri: uri.to_string(),
        }
    }

    pub fn stream(name: &str) -> Self {
        Self::Stream(StreamLocation {
            name: name.to_string(),
        })
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Returns a copy of a blob location pinned to `snapshot`.
    ///
    /// Non-blob locations are returned unchanged.
    pub fn with_snapshot(mut self, snapshot: &str) -> Self {
        if let Self::Blob(b) = &mut self {
            b.snapshot = Some(snapshot.to_string());
        }
        self
    }

    pub fn kind(&self) -> LocationKind {
        match self {
            Self::Blob(b) => LocationKind::Blob(b.kind),
            Self::File(_) => LocationKind::File,
            Self::Uri { .. } => LocationKind::Uri,
            Self::Stream(_) => LocationKind::Stream,
            Self::Local { .. } => LocationKind::Local,
        }
    }

    /// Base URI of a remote location, without snapshot or version markers.
    pub fn base_uri(&self) -> Option<String> {
        match self {
            Self::Blob(b) => Some(format!("{}/{}/{}", b.endpoint, b.container, b.name)),
            Self::File(f) => Some(format!("{}/{}/{}", f.endpoint, f.share, f.path)),
            Self::Uri { uri } => Some(SourceUri::parse(uri).base),
            Self::Stream(_) | Self::Local { .. } => None,
        }
    }

    /// URI a server can copy from, including any snapshot/version marker.
    pub fn copy_source_uri(&self) -> Option<String> {
        match self {
            Self::Blob(b) => {
                let base = format!("{}/{}/{}", b.endpoint, b.container, b.name);
                Some(
                    SourceUri {
                        base,
                        snapshot: b.snapshot.clone(),
                        version: b.version.clone(),
                    }
                    .to_string(),
                )
            }
            Self::File(_) => self.base_uri(),
            Self::Uri { uri } => Some(uri.clone()),
            Self::Stream(_) | Self::Local { .. } => None,
        }
    }

    /// Stable identifier handed to the overwrite predicate and logs.
    pub fn id(&self) -> String {
        match self {
            Self::Stream(s) => format!("stream:{}", s.name),
            Self::Local { path } => path.to_string_lossy().into_owned(),
            _ => self.copy_source_uri().unwrap_or_default(),
        }
    }

    /// Object name used to seed deterministic block identifiers.
    pub fn name(&self) -> String {
        match self {
            Self::Blob(b) => format!("{}/{}", b.container, b.name),
            Self::File(f) => format!("{}/{}", f.share, f.path),
            Self::Uri { uri } => SourceUri::parse(uri).base,
            Self::Stream(s) => s.name.clone(),
            Self::Local { path } => path.to_string_lossy().into_owned(),
        }
    }

    /// Writer discipline for this location when used as a destination.
    ///
    /// Returns `None` for locations that cannot be written (`Uri`).
    pub fn destination_kind(&self) -> Option<DestinationKind> {
        match self {
            Self::Blob(b) => Some(match b.kind {
                BlobKind::Block => DestinationKind::BlockBlob,
                BlobKind::Page => DestinationKind::PageBlob,
                BlobKind::Append => DestinationKind::AppendBlob,
            }),
            Self::File(_) => Some(DestinationKind::File),
            Self::Local { .. } => Some(DestinationKind::Local),
            Self::Stream(_) => Some(DestinationKind::Stream),
            Self::Uri { .. } => None,
        }
    }

    /// Whether the location lives on a remote service (copy engines need this).
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Blob(_) | Self::File(_) | Self::Uri { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// How a destination is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    BlockBlob,
    PageBlob,
    AppendBlob,
    File,
    Local,
    Stream,
}

impl DestinationKind {
    /// Largest object this kind of destination can hold.
    pub fn max_size(self) -> u64 {
        match self {
            Self::BlockBlob => MAX_BLOCK_SIZE * MAX_BLOCK_COUNT,
            Self::PageBlob => 8 * 1024 * 1024 * 1024 * 1024,
            Self::AppendBlob => MAX_RANGE_WRITE * MAX_BLOCK_COUNT,
            Self::File => 4 * 1024 * 1024 * 1024 * 1024,
            Self::Local | Self::Stream => u64::MAX,
        }
    }

    /// Largest chunk a single write may carry, `None` when chunks may widen.
    pub fn max_chunk_size(self) -> Option<u64> {
        match self {
            Self::BlockBlob | Self::Local | Self::Stream => None,
            Self::PageBlob | Self::AppendBlob | Self::File => Some(MAX_RANGE_WRITE),
        }
    }

    /// Any available offset may be written; ordering is restored at commit.
    pub fn is_range_addressable(self) -> bool {
        matches!(self, Self::BlockBlob | Self::PageBlob | Self::File)
    }

    /// Chunks must be consumed strictly in offset order.
    pub fn is_sequential(self) -> bool {
        !self.is_range_addressable()
    }

    /// Blob kind an existing destination must report, if any.
    pub fn blob_kind(self) -> Option<BlobKind> {
        match self {
            Self::BlockBlob => Some(BlobKind::Block),
            Self::PageBlob => Some(BlobKind::Page),
            Self::AppendBlob => Some(BlobKind::Append),
            _ => None,
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BlockBlob => "block blob",
            Self::PageBlob => "page blob",
            Self::AppendBlob => "append blob",
            Self::File => "file",
            Self::Local => "local file",
            Self::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// A copy-source URI split into its base and point-in-time markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUri {
    pub base: String,
    pub snapshot: Option<String>,
    pub version: Option<String>,
}

impl SourceUri {
    /// Splits `uri` at the query string and extracts `snapshot` / `versionid`.
    ///
    /// Other query parameters (signatures and the like) are ignored.
    pub fn parse(uri: &str) -> Self {
        let (base, query) = match uri.split_once('?') {
            Some((b, q)) => (b, q),
            None => (uri, ""),
        };
        let mut snapshot = None;
        let mut version = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.eq_ignore_ascii_case("snapshot") {
                snapshot = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("versionid") {
                version = Some(value.to_string());
            }
        }
        Self {
            base: base.trim_end_matches('/').to_string(),
            snapshot,
            version,
        }
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)?;
        let mut sep = '?';
        if let Some(s) = &self.snapshot {
            write!(f, "{sep}snapshot={s}")?;
            sep = '&';
        }
        if let Some(v) = &self.version {
            write!(f, "{sep}versionid={v}")?;
        }
        Ok(())
    }
}
