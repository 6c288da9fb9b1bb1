//! Guest image loading.
//!
//! The guest is a raw machine-code blob copied verbatim to the code region.
//! This module also builds the long-mode control structures that the blob
//! expects to find already installed.

pub mod gdt;
pub mod paging;

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::debug::hex_dump;
use crate::error::{Error, Result};

/// Bytes of the payload shown when it is loaded.
const PREVIEW_LEN: usize = 16 * 5;

/// A raw guest code image, read entirely into host memory.
#[derive(Debug, Clone)]
pub struct Payload {
    path: PathBuf,
    data: Vec<u8>,
}

impl Payload {
    /// Read a payload file.
    ///
    /// A missing file is reported as [`Error::PayloadNotFound`] and an empty
    /// one as [`Error::EmptyPayload`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("reading guest code from '{}'", path.display());

        let mut file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::PayloadNotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let payload = Self::from_bytes(path, data)?;
        info!("read {} bytes", payload.len());
        debug!("code bytes:\n{}", hex_dump(payload.bytes(), PREVIEW_LEN));
        Ok(payload)
    }

    /// Wrap bytes that are already in memory. `origin` is only used in messages.
    pub fn from_bytes(origin: impl AsRef<Path>, data: Vec<u8>) -> Result<Self> {
        let path = origin.as_ref().to_path_buf();
        if data.is_empty() {
            return Err(Error::EmptyPayload(path));
        }
        Ok(Self { path, data })
    }

    /// Where the payload came from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The raw code bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes (never zero).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false: empty payloads are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse an entry-point offset given in hexadecimal, with or without `0x`.
pub fn parse_entry_offset(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(Error::InvalidEntryOffset(s.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| Error::InvalidEntryOffset(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_payload_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x66, 0xba, 0xf8, 0x03, 0xf4]).unwrap();

        let payload = Payload::from_file(file.path()).unwrap();
        assert_eq!(payload.len(), 5);
        assert_eq!(payload.bytes()[4], 0xf4);
        assert_eq!(payload.path(), file.path());
    }

    #[test]
    fn test_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        match Payload::from_file(&path) {
            Err(Error::PayloadNotFound(p)) => assert_eq!(p, path),
            other => panic!("expected PayloadNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            Payload::from_file(file.path()),
            Err(Error::EmptyPayload(_))
        ));
    }

    #[test]
    fn test_parse_entry_offset() {
        assert_eq!(parse_entry_offset("0").unwrap(), 0);
        assert_eq!(parse_entry_offset("10").unwrap(), 0x10);
        assert_eq!(parse_entry_offset("0x1f").unwrap(), 0x1f);
        assert_eq!(parse_entry_offset("0XAB").unwrap(), 0xab);
        assert_eq!(parse_entry_offset(" ff ").unwrap(), 0xff);
        assert!(matches!(
            parse_entry_offset("0x"),
            Err(Error::InvalidEntryOffset(_))
        ));
        assert!(parse_entry_offset("zz").is_err());
        assert!(parse_entry_offset("-1").is_err());
    }
}
