//! Whole-content MD5, applied as the destination's `content_md5` property.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

/// Running MD5 over content fed in offset order.
#[derive(Clone, Default)]
pub struct ContentHasher {
    hasher: Md5,
    consumed: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.consumed += data.len() as u64;
    }

    /// Bytes hashed so far, which is also the next expected offset.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Base64 digest, the encoding used by the content-MD5 property.
    pub fn finish(self) -> String {
        STANDARD.encode(self.hasher.finalize())
    }
}

/// Base64 MD5 of `data`.
pub fn content_md5(data: &[u8]) -> String {
    let mut h = ContentHasher::new();
    h.update(data);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut h = ContentHasher::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.consumed(), 11);
        assert_eq!(h.finish(), content_md5(b"hello world"));
    }
}
