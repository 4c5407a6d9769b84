//! Reading files through a pipeline.
//!
//! A [`Reader`] picks its pipeline from the file's name:
//! `logs.txt.gz` is gunzipped, `backup.tar` is split into members
//! with [`tar_next()`](Reader::tar_next), and `bundle.zip` has its
//! entries opened by name with [`zip_open()`](Reader::zip_open).
//! [`ReadOptions::raw`] turns all of that off.
//!
//! ```no_run
//! # use fileio::*;
//! let file = OsFile::open("backup.tar.gz")?;
//! let mut reader = Reader::open(file, ReadOptions::default(), true)?;
//! while let Some(header) = reader.tar_next()? {
//!     println!("{} ({} bytes)", header.name, header.size);
//! }
//! reader.close()?;
//! # Ok::<(), FileError>(())
//! ```

use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};

use camino::Utf8PathBuf;
use log::*;

use crate::bufio::BufReader;
use crate::closer::{self, Closer};
use crate::fs::{FileInfo, FileSystem, ReadFile};
use crate::pipeline::{self, ReadStack};
use crate::result::*;
use crate::tar::TarHeader;
use crate::zip::{ZipArchive, ZipDecompressor, ZipFile, ZipHeader};

/// How to open a file for reading
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Where to start reading: from the start of the file if positive,
    /// from the end if negative.
    /// Applied to the file's bytes, before any decompression.
    pub offset: i64,

    /// Stop after this many bytes past the offset (zero for no limit).
    pub limit: u64,

    /// Ignore the file's extensions: no decompression or archive framing.
    pub raw: bool,

    /// Minimum buffer size; zero picks a default.
    pub buf_size: usize,

    /// Return tar members whose names escape the archive root
    /// (absolute paths, `..`) instead of failing with
    /// [`FileError::InsecurePath`].
    pub allow_non_local_tar_names: bool,

    /// Decompressors for zip methods besides Store and Deflate, by method ID
    pub zip_decompressors: HashMap<u16, ZipDecompressor>,
}

/// A buffered reader over a file's pipeline
pub struct Reader<'f> {
    buf: BufReader<ReadStack<'f>>,
    closer: Closer,
    info: FileInfo,
    allow_non_local_tar_names: bool,
}

impl<'f> Reader<'f> {
    /// Opens `file` for reading.
    ///
    /// If `close_file` is set, the reader takes care of closing the file,
    /// even if opening fails. Otherwise, pass a `&mut` to the file
    /// and close it yourself after closing the reader.
    pub fn open<F: ReadFile + 'f>(file: F, options: ReadOptions, close_file: bool) -> FileResult<Self> {
        let (mut stack, info) = pipeline::build_read(Box::new(file), close_file, &options)?;
        debug!("Opened {} as {}", info.name, stack.describe());
        Ok(Self {
            buf: BufReader::with_capacity(options.buf_size, stack),
            closer: Closer::default(),
            info,
            allow_non_local_tar_names: options.allow_non_local_tar_names,
        })
    }

    /// Opens `name` from `fsys` for reading.
    pub fn open_from_fs<S: FileSystem + ?Sized>(
        fsys: &'f S,
        name: &str,
        options: ReadOptions,
    ) -> FileResult<Self> {
        let file = fsys.open(name).with_context(|| format!("opening {}", name))?;
        Self::open(file, options, true)
    }

    fn check_open(&self) -> FileResult<()> {
        if self.closer.closed() {
            Err(FileError::ReaderClosed)
        } else {
            Ok(())
        }
    }

    /// Reads some bytes into `p`, returning how many. Zero means EOF.
    pub fn read(&mut self, p: &mut [u8]) -> FileResult<usize> {
        self.check_open()?;
        self.buf.read(p)
    }

    pub fn read_byte(&mut self) -> FileResult<Option<u8>> {
        self.check_open()?;
        self.buf.read_byte()
    }

    /// Pushes the last byte read back, to be read again.
    /// Only one byte can be unread, and not after a peek.
    pub fn unread_byte(&mut self) -> FileResult<()> {
        self.check_open()?;
        self.buf.unread_byte()
    }

    /// Reads one UTF-8 character, returning it and its size in bytes.
    /// Invalid encodings read as one byte of U+FFFD.
    pub fn read_rune(&mut self) -> FileResult<Option<(char, usize)>> {
        self.check_open()?;
        self.buf.read_rune()
    }

    pub fn unread_rune(&mut self) -> FileResult<()> {
        self.check_open()?;
        self.buf.unread_rune()
    }

    /// Copies everything left to `w`, returning the number of bytes copied.
    pub fn write_to<W: Write + ?Sized>(&mut self, w: &mut W) -> FileResult<u64> {
        self.check_open()?;
        self.buf.write_to(w)
    }

    /// Reads a line, without its line ending.
    ///
    /// Lines longer than the buffer come back in pieces;
    /// the flag is true while more of the line follows.
    /// `None` means EOF.
    pub fn read_line(&mut self) -> FileResult<Option<(&[u8], bool)>> {
        self.check_open()?;
        self.buf.read_line()
    }

    /// Reads a whole line (however long), without its line ending.
    pub fn read_entire_line(&mut self) -> FileResult<Option<Vec<u8>>> {
        self.check_open()?;
        let mut line = match self.buf.read_line()? {
            None => return Ok(None),
            Some((piece, false)) => return Ok(Some(piece.to_vec())),
            Some((piece, true)) => piece.to_vec(),
        };
        loop {
            match self.buf.read_line()? {
                None => return Ok(Some(line)),
                Some((piece, more)) => {
                    line.extend_from_slice(piece);
                    if !more {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }

    /// Copies a line (without its line ending) to `w`
    /// a buffer at a time, returning the number of bytes written,
    /// or `None` at EOF.
    pub fn write_line_to<W: Write + ?Sized>(&mut self, w: &mut W) -> FileResult<Option<u64>> {
        self.check_open()?;
        let mut written = 0;
        let mut any = false;
        while let Some((piece, more)) = self.buf.read_line()? {
            any = true;
            w.write_all(piece)?;
            written += piece.len() as u64;
            if !more {
                break;
            }
        }
        Ok(any.then_some(written))
    }

    /// Returns the next `n` bytes without consuming them.
    /// Fewer come back only at EOF.
    pub fn peek(&mut self, n: usize) -> FileResult<&[u8]> {
        self.check_open()?;
        self.buf.peek(n)
    }

    /// Skips `n` bytes, returning how many were skipped.
    pub fn discard(&mut self, n: usize) -> FileResult<usize> {
        self.check_open()?;
        self.buf.discard(n)
    }

    /// The size of the buffer
    pub fn size(&self) -> usize {
        self.buf.size()
    }

    /// How many bytes can be read from the buffer right now
    pub fn buffered(&self) -> usize {
        self.buf.buffered()
    }

    /// What the file reported when it was opened
    pub fn stat(&self) -> FileResult<FileInfo> {
        self.check_open()?;
        Ok(self.info.clone())
    }

    /// Closes every layer of the pipeline (and the file, if we own it).
    /// Closing again does nothing.
    pub fn close(&mut self) -> FileResult<()> {
        let stack = self.buf.get_mut();
        let result = self
            .closer
            .close(|errors| closer::close_read_layers(stack.top_mut(), errors));
        self.buf.poison(FileError::ReaderClosed);
        trace!("Closed reader for {}", self.info.name);
        result
    }

    pub fn closed(&self) -> bool {
        self.closer.closed()
    }

    pub fn tar_enabled(&self) -> bool {
        matches!(self.buf.get_ref(), ReadStack::Tar(_))
    }

    /// Moves to the next tar member, returning its header,
    /// or `None` at the end of the archive.
    /// Reads then return the member's contents.
    ///
    /// A member whose name escapes the archive root is an
    /// [`FileError::InsecurePath`] carrying the header,
    /// unless [`ReadOptions::allow_non_local_tar_names`] is set.
    pub fn tar_next(&mut self) -> FileResult<Option<TarHeader>> {
        if !self.tar_enabled() {
            return Err(FileError::NotTar);
        }
        self.check_open()?;
        let next = match self.buf.get_mut() {
            ReadStack::Tar(tar) => tar.next_header(),
            _ => return Err(FileError::NotTar),
        };
        let header = match next {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.buf.reset();
                return Ok(None);
            }
            Err(e) => {
                self.buf.poison(e.duplicate());
                return Err(e);
            }
        };
        self.buf.reset();
        debug!("Tar member {} ({} bytes)", header.name, header.size);
        if !header.is_local() {
            if !self.allow_non_local_tar_names {
                return Err(FileError::InsecurePath(Box::new(header)));
            }
            warn!("Tar member {} escapes the archive root", header.name);
        }
        Ok(Some(header))
    }

    /// Calls `visit` with each remaining tar member's header;
    /// `visit` can read the member's contents from the reader.
    /// Stops at the end of the archive or at the first error.
    pub fn tar_walk<F>(&mut self, mut visit: F) -> FileResult<()>
    where
        F: FnMut(&mut Self, &TarHeader) -> FileResult<()>,
    {
        while let Some(header) = self.tar_next()? {
            visit(self, &header)?;
        }
        Ok(())
    }

    pub fn zip_enabled(&self) -> bool {
        matches!(self.buf.get_ref(), ReadStack::Zip(_))
    }

    fn zip(&self) -> FileResult<&ZipArchive<'f>> {
        let ReadStack::Zip(archive) = self.buf.get_ref() else {
            return Err(FileError::NotZip);
        };
        self.check_open()?;
        Ok(archive)
    }

    /// Opens a zip entry by name.
    /// Directories can be named with or without their trailing slash.
    pub fn zip_open(&self, name: &str) -> FileResult<ZipFile<'f>> {
        let archive = self.zip()?;
        let index = archive
            .find(name)
            .ok_or_else(|| FileError::NoSuchFile(Utf8PathBuf::from(name)))?;
        archive.open(index)
    }

    /// Opens a zip entry by its position in [`zip_files()`](Self::zip_files),
    /// for archives with duplicate names.
    pub fn zip_open_index(&self, index: usize) -> FileResult<ZipFile<'f>> {
        self.zip()?.open(index)
    }

    /// The archive's entries, in the order the central directory lists them
    pub fn zip_files(&self) -> FileResult<&[ZipHeader]> {
        Ok(self.zip()?.entries())
    }

    pub fn iter_zip_files(&self) -> FileResult<impl Iterator<Item = &ZipHeader> + '_> {
        Ok(self.zip()?.entries().iter())
    }

    pub fn iter_index_zip_files(
        &self,
    ) -> FileResult<impl Iterator<Item = (usize, &ZipHeader)> + '_> {
        Ok(self.zip()?.entries().iter().enumerate())
    }

    /// The comment at the end of the central directory
    pub fn zip_comment(&self) -> FileResult<&str> {
        Ok(self.zip()?.comment())
    }
}

impl Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(Reader::read(self, buf)?)
    }
}

impl BufRead for Reader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.check_open()?;
        Ok(self.buf.fill_buf()?)
    }

    fn consume(&mut self, amount: usize) {
        self.buf.consume(amount)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::MemFile;
    use crate::tar::TarEntryType;

    fn raw() -> ReadOptions {
        ReadOptions {
            raw: true,
            ..Default::default()
        }
    }

    #[test]
    fn lines() {
        let file = MemFile::new("lines.txt", b"one\r\ntwo\n\nthree".to_vec());
        let mut reader = Reader::open(file, raw(), true).unwrap();
        assert_eq!(reader.read_entire_line().unwrap().unwrap(), b"one");
        assert_eq!(reader.read_entire_line().unwrap().unwrap(), b"two");
        assert_eq!(reader.read_entire_line().unwrap().unwrap(), b"");
        assert_eq!(reader.read_entire_line().unwrap().unwrap(), b"three");
        assert!(reader.read_entire_line().unwrap().is_none());
    }

    #[test]
    fn long_lines() {
        let long = "x".repeat(100);
        let text = format!("{}\n{}", long, long);
        let file = MemFile::new("long", text.into_bytes());
        let options = ReadOptions {
            buf_size: 16,
            ..raw()
        };
        let mut reader = Reader::open(file, options, true).unwrap();
        assert_eq!(reader.size(), 16);

        let (piece, more) = reader.read_line().unwrap().unwrap();
        assert_eq!(piece.len(), 16);
        assert!(more);
        assert_eq!(reader.read_entire_line().unwrap().unwrap().len(), 84);

        let mut out = Vec::new();
        assert_eq!(reader.write_line_to(&mut out).unwrap(), Some(100));
        assert_eq!(out, long.as_bytes());
        assert_eq!(reader.write_line_to(&mut out).unwrap(), None);
    }

    #[test]
    fn runes_and_peeks() {
        let file = MemFile::new("runes", "héllo".as_bytes().to_vec());
        let mut reader = Reader::open(file, raw(), true).unwrap();
        assert_eq!(reader.read_rune().unwrap(), Some(('h', 1)));
        assert_eq!(reader.read_rune().unwrap(), Some(('é', 2)));
        reader.unread_rune().unwrap();
        assert_eq!(reader.peek(2).unwrap(), "é".as_bytes());
        assert!(matches!(
            reader.unread_rune(),
            Err(FileError::InvalidUnreadRune)
        ));
        assert!(matches!(reader.peek(1 << 20), Err(FileError::BufferFull)));
        // Not sticky
        assert_eq!(reader.discard(2).unwrap(), 2);
        assert_eq!(reader.read_byte().unwrap(), Some(b'l'));
        reader.unread_byte().unwrap();
        let mut rest = Vec::new();
        reader.write_to(&mut rest).unwrap();
        assert_eq!(rest, b"llo");
    }

    #[test]
    fn mode_errors() {
        let file = MemFile::new("plain.txt", b"text".to_vec());
        let mut reader = Reader::open(file, ReadOptions::default(), true).unwrap();
        assert!(!reader.tar_enabled());
        assert!(!reader.zip_enabled());
        assert!(matches!(reader.tar_next(), Err(FileError::NotTar)));
        assert!(matches!(reader.zip_files(), Err(FileError::NotZip)));
        assert!(matches!(reader.zip_open("x"), Err(FileError::NotZip)));
        assert!(matches!(reader.zip_comment(), Err(FileError::NotZip)));

        reader.close().unwrap();
        assert!(matches!(reader.tar_next(), Err(FileError::NotTar)));
        assert!(matches!(reader.read(&mut [0; 4]), Err(FileError::ReaderClosed)));
        assert!(matches!(reader.stat(), Err(FileError::ReaderClosed)));
    }

    #[test]
    fn closed_readers_hide_buffered_bytes() {
        let file = MemFile::new("plain.txt", b"some buffered text".to_vec());
        let mut reader = Reader::open(file, raw(), true).unwrap();
        assert_eq!(reader.read_byte().unwrap(), Some(b's'));
        assert!(reader.buffered() > 0);
        reader.close().unwrap();
        assert!(reader.closed());
        assert!(matches!(reader.read_byte(), Err(FileError::ReaderClosed)));
        assert!(matches!(reader.unread_byte(), Err(FileError::ReaderClosed)));
        assert!(matches!(reader.peek(1), Err(FileError::ReaderClosed)));
        assert!(matches!(reader.read_line(), Err(FileError::ReaderClosed)));
        let err: FileError = Read::read(&mut reader, &mut [0; 4]).unwrap_err().into();
        assert!(matches!(err, FileError::ReaderClosed));
        reader.close().unwrap();
    }

    fn tar_of(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut builder = ::tar::Builder::new(&mut out);
            for (name, body) in members {
                let mut header = ::tar::Header::new_ustar();
                header.as_ustar_mut().unwrap().name[..name.len()]
                    .copy_from_slice(name.as_bytes());
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_entry_type(::tar::EntryType::Regular);
                header.set_cksum();
                builder.append(&header, *body).unwrap();
            }
            builder.finish().unwrap();
        }
        out
    }

    #[test]
    fn insecure_tar_names() {
        let bytes = tar_of(&[("../escape.txt", b"gotcha"), ("fine.txt", b"ok")]);

        let file = MemFile::new("bad.tar", bytes.clone());
        let mut reader = Reader::open(file, ReadOptions::default(), true).unwrap();
        match reader.tar_next() {
            Err(FileError::InsecurePath(header)) => {
                assert_eq!(header.name, "../escape.txt");
                assert_eq!(header.kind, TarEntryType::Regular);
            }
            other => panic!("Expected an insecure path, got {:?}", other.map(|_| ())),
        }
        let next = reader.tar_next().unwrap().unwrap();
        assert_eq!(next.name, "fine.txt");

        let options = ReadOptions {
            allow_non_local_tar_names: true,
            ..Default::default()
        };
        let mut reader = Reader::open(MemFile::new("bad.tar", bytes), options, true).unwrap();
        let mut names = Vec::new();
        reader
            .tar_walk(|reader, header| {
                let mut body = Vec::new();
                reader.write_to(&mut body)?;
                names.push((header.name.clone(), body));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            names,
            [
                ("../escape.txt".to_owned(), b"gotcha".to_vec()),
                ("fine.txt".to_owned(), b"ok".to_vec())
            ]
        );
    }
}
