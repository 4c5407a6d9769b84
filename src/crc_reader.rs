//! Helper module to compute a CRC32 checksum
//!
//! Borrowed from zip-rs:
//! <https://github.com/mvdnes/zip-rs/commit/b3c836d9c32efa120cdd5366280f940d3c3b985c>

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;

use crate::result::*;

/// Reader that validates the CRC32 when it reaches the EOF.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    provided_checksum: u32,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, provided_checksum: u32) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            provided_checksum,
        }
    }

    /// Returns the checksum error if the final checksum doesn't match
    /// the one provided by `new()`
    fn check_matches(&self) -> Option<FileError> {
        let actual = self.hasher.clone().finalize();
        if self.provided_checksum == actual {
            None
        } else {
            Some(FileError::ChecksumMismatch {
                want: format!("{:08x}", self.provided_checksum),
                got: format!("{:08x}", actual),
            })
        }
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        if count == 0 && !buf.is_empty() {
            if let Some(mismatch) = self.check_matches() {
                return Err(mismatch.into());
            }
        }
        self.hasher.update(&buf[0..count]);
        Ok(count)
    }
}
