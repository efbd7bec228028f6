//! LFS Object ID (OID) and streaming content hashing.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::{Error, Result};

/// LFS Object ID - a SHA256 hash of the file content.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid {
    bytes: [u8; 32],
}

impl Oid {
    /// Create an OID from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Oid { bytes }
    }

    /// Parse an OID from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 64 {
            return Err(Error::InvalidOid(format!(
                "expected 64 hex chars, got {}",
                hex.len()
            )));
        }

        let bytes = hex::decode(hex).map_err(|e| Error::InvalidOid(e.to_string()))?;

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Oid { bytes: arr })
    }

    /// Compute the OID (SHA256 hash) of content.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(content);
        hasher.finish()
    }

    /// Hash everything a reader yields, returning the OID and byte count.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<(Self, u64)> {
        let mut hasher = ContentHasher::new();
        let n = io::copy(&mut reader, &mut hasher.0)?;
        Ok((hasher.finish(), n))
    }

    /// Hash a file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let (oid, _) = Oid::from_reader(file)?;
        Ok(oid)
    }

    /// Get the OID as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl std::str::FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Oid::from_hex(s)
    }
}

/// Running SHA256 state for content that arrives in pieces.
///
/// The state can be pre-loaded with bytes already on disk so that a resumed
/// download ends with the hash of the whole object.
#[derive(Clone, Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn new() -> Self {
        ContentHasher(Sha256::new())
    }

    /// Feed every byte of `reader` into the hash, returning the count.
    pub fn preload<R: Read>(&mut self, reader: &mut R) -> io::Result<u64> {
        io::copy(reader, &mut self.0)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Oid {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0.finalize());
        Oid { bytes }
    }
}

/// Reader that hashes everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: ContentHasher,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_hasher(inner, ContentHasher::new())
    }

    /// Continue from an existing hash state.
    pub fn with_hasher(inner: R, hasher: ContentHasher) -> Self {
        HashingReader { inner, hasher }
    }

    pub fn finish(self) -> Oid {
        self.hasher.finish()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_from_content() {
        let content = b"Hello, World!";
        let oid = Oid::from_content(content);
        // SHA256 of "Hello, World!"
        assert_eq!(
            oid.to_hex(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_oid_from_hex() {
        let hex = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
        let oid = Oid::from_hex(hex).unwrap();
        assert_eq!(oid.to_hex(), hex);
    }

    #[test]
    fn test_oid_invalid_hex() {
        assert!(Oid::from_hex("not valid hex").is_err());
        assert!(Oid::from_hex("abc").is_err()); // Too short
    }

    #[test]
    fn test_preloaded_hash_matches_whole_content() {
        let content = b"the quick brown fox jumps over the lazy dog";
        let (head, tail) = content.split_at(17);

        let mut hasher = ContentHasher::new();
        let n = hasher.preload(&mut &head[..]).unwrap();
        assert_eq!(n, 17);

        let mut reader = HashingReader::with_hasher(tail, hasher);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();

        assert_eq!(sink, tail);
        assert_eq!(reader.finish(), Oid::from_content(content));
    }

    #[test]
    fn test_from_reader_counts_bytes() {
        let (oid, n) = Oid::from_reader(&b"test"[..]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            oid.to_hex(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
