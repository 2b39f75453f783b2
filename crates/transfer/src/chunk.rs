//! Chunks of source data and their checksums.

use sha2::{Digest, Sha256};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 over a sequence of segments, as if they were one buffer.
pub fn checksum_segments(segments: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    for segment in segments {
        hasher.update(segment);
    }
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// An owned chunk buffer, possibly made of several pooled segments.
///
/// Ownership moves reader -> shared map -> writer; whoever holds the chunk
/// last releases its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    offset: u64,
    length: u64,
    segments: Vec<Vec<u8>>,
    /// SHA-256 hex of the content (`None` means no verification).
    checksum: Option<String>,
}

impl Chunk {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self::from_segments(offset, vec![data])
    }

    pub fn from_segments(offset: u64, segments: Vec<Vec<u8>>) -> Self {
        let length = segments.iter().map(|s| s.len() as u64).sum();
        Self {
            offset,
            length,
            segments,
            checksum: None,
        }
    }

    /// Splits `data` into segments of at most `segment_size` bytes.
    pub fn segmented(offset: u64, mut data: Vec<u8>, segment_size: usize) -> Self {
        if segment_size == 0 || data.len() <= segment_size {
            return Self::new(offset, data);
        }
        let mut segments = Vec::with_capacity(data.len().div_ceil(segment_size));
        while data.len() > segment_size {
            let rest = data.split_off(segment_size);
            segments.push(data);
            data = rest;
        }
        segments.push(data);
        Self::from_segments(offset, segments)
    }

    /// Stamps the chunk with the SHA-256 of its current content.
    pub fn with_checksum(mut self) -> Self {
        self.checksum = Some(checksum_segments(&self.segments));
        self
    }

    /// Verifies the stamped checksum, if any.
    pub fn verify(&self) -> Result<(), TransferError> {
        match &self.checksum {
            Some(expected) if *expected != checksum_segments(&self.segments) => {
                Err(TransferError::ChecksumMismatch {
                    offset: self.offset,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Every byte is zero; page destinations skip such chunks.
    pub fn is_zero(&self) -> bool {
        self.segments.iter().all(|s| s.iter().all(|b| *b == 0))
    }

    /// Joins the segments into one contiguous buffer.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.segments.len() == 1 {
            return self.segments.pop().unwrap_or_default();
        }
        let mut out = Vec::with_capacity(self.length as usize);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }
}
