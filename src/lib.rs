//! fileio reads and writes files through a buffered pipeline
//! that it works out from the file's name:
//!
//! ```no_run
//! # use std::io;
//! # use fileio::*;
//! // Reads the first member of a gzipped tarball.
//! let file = OsFile::open("backup.tar.gz")?;
//! let mut reader = Reader::open(file, ReadOptions::default(), true)?;
//! if let Some(header) = reader.tar_next()? {
//!     println!("{}:", header.name);
//!     reader.write_to(&mut io::stdout())?;
//! }
//! reader.close()?;
//!
//! // Writes a zip archive with a directory and a file.
//! let file = OsFile::create("notes.zip")?;
//! let mut writer = Writer::create(file, WriteOptions::default(), true)?;
//! writer.zip_create("notes/")?;
//! writer.zip_create("notes/today.txt")?;
//! writer.println("Nothing much.")?;
//! writer.close()?;
//! # Ok::<(), FileError>(())
//! ```
//!
//! Recognized extensions, innermost last:
//!
//! | Extension        | Reading              | Writing              |
//! |------------------|----------------------|----------------------|
//! | `.gz`            | gunzip               | gzip                 |
//! | `.bz2`           | bunzip2              | (unsupported)        |
//! | `.tar`           | split into members   | join members         |
//! | `.zip`           | open entries by name | create entries       |
//! | `.tgz`           | `.tar.gz`            | `.tar.gz`            |
//! | `.tbz`, `.tbz2`  | `.tar.bz2`           | (unsupported)        |
//!
//! Readers can also start at an offset and stop after a limit.
//! Those apply to the file's own bytes, before anything is decompressed,
//! which is handy for archives embedded in larger files.
//!
//! Closing a reader or writer closes every layer it built,
//! from the caller's end down to the file,
//! and reports every error along the way.
//! After that, everything but [`close()`](Reader::close) fails with
//! [`FileError::ReaderClosed`] or [`FileError::WriterClosed`].

pub mod checksum;
pub mod fs;
pub mod read;
pub mod result;
pub mod tar;
pub mod write;
pub mod zip;

pub use checksum::{digest_matches, verify, verify_file, HashChecksum};
pub use fs::{DirFs, FileInfo, FileSystem, MemFile, MemFs, OsFile, ReadFile, WriteFile};
pub use read::{ReadOptions, Reader};
pub use result::{FileError, FileResult};
pub use crate::tar::{TarEntryType, TarHeader};
pub use write::{WriteOptions, WritePanic, Writer};
pub use zip::{CompressionMethod, ZipFile, ZipHeader};

mod arch;
mod bufio;
mod closer;
mod crc_reader;
mod pipeline;
mod spec;
