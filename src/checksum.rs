//! Verifies a file against expected digests, hashing it once
//! for however many digests are given.

use std::io::{self, Read, Write};

use digest::DynDigest;
use log::*;
use sha2::{Sha256, Sha512};

use crate::fs::FileSystem;
use crate::read::{ReadOptions, Reader};
use crate::result::*;

/// A digest a file should have
#[derive(Clone)]
pub struct HashChecksum {
    /// Makes a fresh hasher
    pub new_hash: fn() -> Box<dyn DynDigest>,

    /// The expected digest in hex (either case)
    pub want_hex: String,

    /// Only compare the start of the digest against `want_hex`
    pub is_prefix: bool,
}

fn new_sha256() -> Box<dyn DynDigest> {
    Box::new(Sha256::default())
}

fn new_sha512() -> Box<dyn DynDigest> {
    Box::new(Sha512::default())
}

impl HashChecksum {
    pub fn new<S: Into<String>>(new_hash: fn() -> Box<dyn DynDigest>, want_hex: S) -> Self {
        Self {
            new_hash,
            want_hex: want_hex.into(),
            is_prefix: false,
        }
    }

    pub fn sha256<S: Into<String>>(want_hex: S) -> Self {
        Self::new(new_sha256, want_hex)
    }

    pub fn sha512<S: Into<String>>(want_hex: S) -> Self {
        Self::new(new_sha512, want_hex)
    }

    /// Matches digests that start with `want_hex`
    pub fn prefix(self) -> Self {
        Self {
            is_prefix: true,
            ..self
        }
    }
}

/// Returns true if `digest` encodes to `want_hex`
/// (or, with `prefix`, starts with it).
pub fn digest_matches(digest: &[u8], want_hex: &str, prefix: bool) -> bool {
    let got = hex::encode(digest);
    let want = want_hex.to_ascii_lowercase();
    if prefix {
        got.starts_with(&want)
    } else {
        got == want
    }
}

/// Feeds everything written to it into each hasher.
struct MultiHasher {
    hashers: Vec<Box<dyn DynDigest>>,
}

impl Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for hasher in &mut self.hashers {
            hasher.update(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads `reader` to the end and checks it against every checksum.
///
/// With no checksums, this just checks that the whole file can be read.
/// Mismatches are [`FileError::ChecksumMismatch`]; if several digests
/// mismatch, they're all reported.
///
/// # Panics
///
/// If any checksum has an empty `want_hex`.
pub fn verify<R: Read + ?Sized>(reader: &mut R, checksums: &[HashChecksum]) -> FileResult<()> {
    for checksum in checksums {
        assert!(
            !checksum.want_hex.is_empty(),
            "Checksums need an expected digest"
        );
    }
    let mut multi = MultiHasher {
        hashers: checksums.iter().map(|c| (c.new_hash)()).collect(),
    };
    let read = io::copy(reader, &mut multi)?;
    debug!("Hashed {} bytes with {} hashers", read, checksums.len());

    let mismatches = multi
        .hashers
        .into_iter()
        .zip(checksums)
        .filter_map(|(hasher, checksum)| {
            let digest = hasher.finalize();
            if digest_matches(&digest, &checksum.want_hex, checksum.is_prefix) {
                None
            } else {
                Some(FileError::ChecksumMismatch {
                    want: checksum.want_hex.clone(),
                    got: hex::encode(&digest),
                })
            }
        })
        .collect();
    match FileError::combine(mismatches) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Opens `name` from `fsys` as-is (no decompression) and verifies it.
pub fn verify_file(fsys: &dyn FileSystem, name: &str, checksums: &[HashChecksum]) -> FileResult<()> {
    let options = ReadOptions {
        raw: true,
        ..Default::default()
    };
    let mut reader = Reader::open_from_fs(fsys, name, options)?;
    let verified = verify(&mut reader, checksums).with_context(|| format!("verifying {}", name));
    let closed = reader.close();
    match (verified, closed) {
        (Ok(()), closed) => closed,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => Err(FileError::Multiple(vec![e, close])),
    }
}
