//! Object attributes, access conditions and copy status.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::location::BlobKind;

/// User metadata attached to an object.
pub type Metadata = BTreeMap<String, String>;

/// Standard HTTP-ish content properties.
///
/// `None` means "not set". `Some("")` is an explicit empty value, which some
/// provider calls need in order to clear a default they would otherwise apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// Base64 MD5 of the whole content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
}

impl ContentProperties {
    /// Content type is absent or explicitly empty.
    pub fn content_type_is_empty(&self) -> bool {
        self.content_type.as_deref().is_none_or(str::is_empty)
    }

    /// Content encoding is absent or explicitly empty.
    pub fn content_encoding_is_empty(&self) -> bool {
        self.content_encoding.as_deref().is_none_or(str::is_empty)
    }
}

/// Result of an attribute fetch on an existing object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub length: u64,
    pub etag: Option<String>,
    /// Blob kind reported by the service; `None` for non-blob objects.
    pub blob_kind: Option<BlobKind>,
    pub properties: ContentProperties,
    pub metadata: Metadata,
    /// Status of the last server-side copy into this object, if any.
    pub copy: Option<CopyStatus>,
}

/// Preconditions attached to a provider call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessCondition {
    /// Destination ETag must match.
    pub if_match: Option<String>,
    /// Destination ETag must not match; `"*"` means "must not exist".
    pub if_none_match: Option<String>,
    /// Append-only destination must currently be exactly this long.
    pub append_position: Option<u64>,
    /// Append-only destination must not grow past this size.
    pub max_size: Option<u64>,
    /// Copy source ETag must match.
    pub source_if_match: Option<String>,
}

impl AccessCondition {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn if_match(etag: Option<String>) -> Self {
        Self {
            if_match: etag,
            ..Self::default()
        }
    }

    pub fn if_not_exists() -> Self {
        Self {
            if_none_match: Some("*".into()),
            ..Self::default()
        }
    }

    pub fn append_at(position: u64) -> Self {
        Self {
            append_position: Some(position),
            ..Self::default()
        }
    }

    pub fn with_source_etag(mut self, etag: Option<String>) -> Self {
        self.source_if_match = etag;
        self
    }
}

/// Server-side copy progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CopyState {
    Pending,
    Success,
    Failed,
    Aborted,
}

impl fmt::Display for CopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Status of a server-initiated copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStatus {
    pub copy_id: String,
    pub state: CopyState,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    /// Source URI as reported by the service, including snapshot/version markers.
    pub source: String,
    pub description: Option<String>,
}

/// Half-open byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Sorts `ranges` and merges overlapping or touching entries.
    pub fn merge(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
        ranges.retain(|r| r.length > 0);
        ranges.sort();
        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if r.offset <= last.end() => {
                    let end = last.end().max(r.end());
                    last.length = end - last.offset;
                }
                _ => merged.push(r),
            }
        }
        merged
    }
}
