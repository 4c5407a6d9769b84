//! Zip framing: reading entries through an archive's central directory,
//! and writing new archives one entry at a time.
//!
//! Zip keeps its directory at the back of the file, so reading needs
//! random access. When the bytes underneath come straight from a seekable
//! file, entries are read in place; otherwise (say, a `.zip.gz`)
//! the archive is read into memory first.
//!
//! Writing streams: each entry gets a local header, its compressed bytes,
//! and a data descriptor; the central directory is written at close.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, SeekFrom, Write};
use std::rc::Rc;
use std::sync::Arc;

use chrono::NaiveDateTime;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::*;

use crate::arch::usize;
use crate::closer::{self, ReadLayer, WriteLayer};
use crate::crc_reader::Crc32Reader;
use crate::fs::{self, FileInfo, ReadFile, MODE_DIR, MODE_FILE, MODE_TYPE_MASK};
use crate::result::*;
use crate::spec;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    /// The file is uncompressed
    Store,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// Anything else. (The u16 is the method's ID in the archive.)
    /// Readable and writable if a (de)compressor is registered for it.
    Other(u16),
}

/// Metadata for a file or directory in a zip archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipHeader {
    /// The slash-separated path of the entry. Directories end in a slash.
    pub name: String,

    pub comment: String,

    /// Compression algorithm used to store the file
    pub method: CompressionMethod,

    /// When the file was last modified
    pub modified: NaiveDateTime,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// Compressed size of the file in bytes
    pub compressed_size: u64,

    /// Uncompressed size of the file in bytes
    pub size: u64,

    /// Unix mode bits, including the file type (see [`MODE_DIR`])
    pub mode: u32,

    /// General purpose flags
    pub flags: u16,

    /// Extra fields besides the ones we manage (Zip64, timestamps)
    pub extra: Vec<u8>,

    /// The offset to the local file header, as stored in the archive
    pub(crate) header_offset: u64,
}

impl ZipHeader {
    /// A header for a new entry:
    /// a deflated file, or a directory if `name` ends with a slash.
    pub fn new<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        let (method, mode) = if name.ends_with('/') {
            (CompressionMethod::Store, MODE_DIR | 0o755)
        } else {
            (CompressionMethod::Deflate, MODE_FILE | 0o644)
        };
        Self {
            name,
            comment: String::new(),
            method,
            modified: fs::now(),
            crc32: 0,
            compressed_size: 0,
            size: 0,
            mode,
            flags: 0,
            extra: Vec::new(),
            header_offset: 0,
        }
    }

    /// Describes a file from its stat, stored as `name`.
    pub fn from_file_info<S: Into<String>>(name: S, info: &FileInfo) -> Self {
        let mut name = name.into();
        if info.is_dir() && !name.ends_with('/') {
            name.push('/');
        }
        Self {
            mode: info.mode,
            modified: info.modified,
            ..Self::new(name)
        }
    }

    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & spec::FLAG_ENCRYPTED != 0
    }

    /// The entry as a [`FileInfo`], named by its base name
    pub fn file_info(&self) -> FileInfo {
        let trimmed = self.name.trim_end_matches('/');
        let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
        FileInfo {
            name: base.to_owned(),
            size: self.size,
            mode: self.mode,
            modified: self.modified,
        }
    }
}

/// Wraps a reader of compressed bytes with one that decompresses them.
pub type ZipDecompressor = Arc<dyn for<'r> Fn(Box<dyn Read + 'r>) -> Box<dyn Read + 'r>>;

/// Makes a [`ZipDecompressor`] from a function or closure.
pub fn zip_decompressor<F>(f: F) -> ZipDecompressor
where
    F: for<'r> Fn(Box<dyn Read + 'r>) -> Box<dyn Read + 'r> + 'static,
{
    Arc::new(f)
}

/// Compresses an entry's bytes as they're written.
pub trait ZipCompressor {
    /// Compresses `input`, appending whatever output is ready to `out`.
    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()>;

    /// Appends everything still held back to `out`. Called once, at the end of the entry.
    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()>;
}

/// Makes a new compressor for each entry.
pub type ZipCompressorFactory = Arc<dyn Fn() -> Box<dyn ZipCompressor>>;

/// Makes a [`ZipCompressorFactory`] from a function or closure.
pub fn zip_compressor<F>(f: F) -> ZipCompressorFactory
where
    F: Fn() -> Box<dyn ZipCompressor> + 'static,
{
    Arc::new(f)
}

/// Stores bytes as they are.
pub struct StoreCompressor;

impl ZipCompressor for StoreCompressor {
    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> io::Result<()> {
        Ok(())
    }
}

/// DEFLATEs bytes with flate2.
pub struct DeflateCompressor {
    encoder: DeflateEncoder<Vec<u8>>,
}

impl DeflateCompressor {
    pub fn new(level: Compression) -> Self {
        Self {
            encoder: DeflateEncoder::new(Vec::new(), level),
        }
    }
}

impl ZipCompressor for DeflateCompressor {
    fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.encoder.write_all(input)?;
        out.append(self.encoder.get_mut());
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        self.encoder.try_finish()?;
        out.append(self.encoder.get_mut());
        Ok(())
    }
}

/// Where the archive's bytes come from
enum SourceData {
    /// `len` bytes of the file at the bottom of the pipeline, starting at `base`
    Seekable { base: u64, len: u64 },
    Memory(Vec<u8>),
}

/// The archive's bytes, shared by the archive and every entry opened from it
struct ZipSource<'f> {
    /// The pipeline under the archive, closed with it
    chain: Box<dyn ReadLayer + 'f>,
    data: SourceData,
    closed: bool,
}

/// Reads from the bottom layer of a pipeline at `pos`.
fn read_at_bottom(layer: &mut dyn ReadLayer, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
    if let Some(inner) = layer.inner_layer() {
        return read_at_bottom(inner, pos, buf);
    }
    match layer.as_seek() {
        Some(seek) => {
            seek.seek(SeekFrom::Start(pos))?;
        }
        None => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "zip source isn't seekable",
            ))
        }
    }
    layer.read(buf)
}

impl ZipSource<'_> {
    fn len(&self) -> u64 {
        match &self.data {
            SourceData::Seekable { len, .. } => *len,
            SourceData::Memory(data) => data.len() as u64,
        }
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> FileResult<usize> {
        if self.closed {
            return Err(FileError::ReaderClosed);
        }
        let len = self.len();
        if pos >= len || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(len - pos).unwrap_or(usize::MAX));
        match &self.data {
            SourceData::Memory(data) => {
                let start = usize(pos)?;
                buf[..max].copy_from_slice(&data[start..start + max]);
                Ok(max)
            }
            SourceData::Seekable { base, .. } => {
                Ok(read_at_bottom(&mut *self.chain, base + pos, &mut buf[..max])?)
            }
        }
    }

    fn read_exact_at(&mut self, mut pos: u64, mut buf: &mut [u8]) -> FileResult<()> {
        while !buf.is_empty() {
            match self.read_at(pos, buf)? {
                0 => return Err(FileError::InvalidArchive("Unexpected end of zip archive")),
                n => {
                    pos += n as u64;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }

    fn read_vec_at(&mut self, pos: u64, len: u64) -> FileResult<Vec<u8>> {
        let mut buf = vec![0; usize(len)?];
        self.read_exact_at(pos, &mut buf)?;
        Ok(buf)
    }
}

/// Reads a range of the archive's bytes
struct SourceReader<'f> {
    source: Rc<RefCell<ZipSource<'f>>>,
    pos: u64,
    end: u64,
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = usize::try_from(self.end - self.pos).unwrap_or(usize::MAX);
        let max = buf.len().min(left);
        if max == 0 {
            return Ok(0);
        }
        let n = self.source.borrow_mut().read_at(self.pos, &mut buf[..max])?;
        if n == 0 {
            return Err(FileError::InvalidArchive("Zip entry runs past the end of the archive").into());
        }
        self.pos += n as u64;
        Ok(n)
    }
}

/// A ZIP archive being read
pub(crate) struct ZipArchive<'f> {
    source: Rc<RefCell<ZipSource<'f>>>,
    /// Entries from the ZIP's central directory, in the order stored
    entries: Vec<ZipHeader>,
    comment: String,
    /// Where offsets stored in the archive actually land in the source.
    /// Negative when we're reading from partway into a file whose
    /// offsets count from its start; positive with unknown bytes prepended.
    archive_offset: i64,
    decompressors: HashMap<u16, ZipDecompressor>,
}

impl<'f> ZipArchive<'f> {
    /// An archive read in place from `len` bytes of the file
    /// at the bottom of `chain`, starting at `base`.
    /// Call [`load()`](Self::load) before anything else.
    pub fn seekable(
        chain: Box<dyn ReadLayer + 'f>,
        base: u64,
        len: u64,
        decompressors: HashMap<u16, ZipDecompressor>,
    ) -> Self {
        Self::new(chain, SourceData::Seekable { base, len }, decompressors)
    }

    /// An archive read into memory from `chain`.
    /// Call [`load()`](Self::load) before anything else.
    pub fn in_memory(
        chain: Box<dyn ReadLayer + 'f>,
        decompressors: HashMap<u16, ZipDecompressor>,
    ) -> Self {
        Self::new(chain, SourceData::Memory(Vec::new()), decompressors)
    }

    fn new(
        chain: Box<dyn ReadLayer + 'f>,
        data: SourceData,
        decompressors: HashMap<u16, ZipDecompressor>,
    ) -> Self {
        Self {
            source: Rc::new(RefCell::new(ZipSource {
                chain,
                data,
                closed: false,
            })),
            entries: Vec::new(),
            comment: String::new(),
            archive_offset: 0,
            decompressors,
        }
    }

    /// Reads the central directory.
    pub fn load(&mut self) -> FileResult<()> {
        let mut source = self.source.borrow_mut();
        let source = &mut *source;
        if let SourceData::Memory(data) = &mut source.data {
            source.chain.read_to_end(data)?;
            debug!("Read {} bytes of zip archive into memory", data.len());
        }
        let len = source.len();

        let tail_len = len.min(spec::EOCDR_SEARCH_SPAN as u64);
        let tail_start = len - tail_len;
        let tail = source.read_vec_at(tail_start, tail_len)?;
        let eocdr_in_tail = spec::find_eocdr(&tail)?;
        let eocdr_posit = tail_start + eocdr_in_tail as u64;
        let eocdr = spec::EndOfCentralDirectory::parse(&tail[eocdr_in_tail..])?;
        trace!("{:?}", eocdr);

        if eocdr.disk_number != eocdr.disk_with_central_directory {
            return Err(FileError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
                eocdr.disk_number, eocdr.disk_with_central_directory
            )));
        }
        if eocdr.entries != eocdr.entries_on_this_disk {
            return Err(FileError::UnsupportedArchive(format!(
                "No support for multi-disk archives: entries ({}) != entries this disk ({})",
                eocdr.entries, eocdr.entries_on_this_disk
            )));
        }

        // The comment isn't covered by the UTF-8 flag; take UTF-8 if it is.
        self.comment = spec::decode_text(eocdr.file_comment, spec::FLAG_UTF8)
            .or_else(|_| spec::decode_text(eocdr.file_comment, 0))?;

        let nominal_central_directory_offset: u64;
        let central_directory_size: u64;
        let entry_count: u64;

        let locator_size = spec::Zip64EndOfCentralDirectoryLocator::size_in_file() as u64;
        let locator = match eocdr_posit.checked_sub(locator_size) {
            Some(posit) => spec::Zip64EndOfCentralDirectoryLocator::parse(
                &source.read_vec_at(posit, locator_size)?,
            ),
            None => None,
        };

        // Zip files can be prepended by arbitrary junk,
        // (or we're reading from partway into one)
        // so all the given positions might be off.
        // Calculate the offset.
        if let Some(zip64_eocdr_locator) = locator {
            trace!("{:?}", zip64_eocdr_locator);

            if eocdr.disk_number as u32 != zip64_eocdr_locator.disk_with_central_directory {
                return Err(FileError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: disk ({}) != disk with zip64 central directory ({})",
                    eocdr.disk_number, zip64_eocdr_locator.disk_with_central_directory
                )));
            }
            if zip64_eocdr_locator.disks != 1 {
                return Err(FileError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
                    zip64_eocdr_locator.disks
                )));
            }

            // It's almost always right before the locator,
            // but it can carry extensible data. Search back a ways.
            let search_end = eocdr_posit - locator_size;
            let search_start = search_end.saturating_sub(u64::from(u16::MAX));
            let search_space = source.read_vec_at(search_start, search_end - search_start)?;
            let zip64_eocdr_in_space = spec::find_zip64_eocdr(&search_space)?;
            let zip64_eocdr =
                spec::Zip64EndOfCentralDirectory::parse(&search_space[zip64_eocdr_in_space..])?;
            trace!("{:?}", zip64_eocdr);

            let zip64_eocdr_posit = search_start + zip64_eocdr_in_space as u64;
            self.archive_offset =
                zip64_eocdr_posit as i64 - zip64_eocdr_locator.zip64_eocdr_offset as i64;
            nominal_central_directory_offset = zip64_eocdr.central_directory_offset;
            central_directory_size = zip64_eocdr.central_directory_size;
            entry_count = zip64_eocdr.entries;
        } else {
            // The offset is the actual position versus the stored one.
            central_directory_size = u64::from(eocdr.central_directory_size);
            let actual_cdr_posit = eocdr_posit.checked_sub(central_directory_size).ok_or(
                FileError::InvalidArchive("Invalid central directory size or offset"),
            )?;
            nominal_central_directory_offset = u64::from(eocdr.central_directory_offset);
            self.archive_offset = actual_cdr_posit as i64 - nominal_central_directory_offset as i64;
            entry_count = u64::from(eocdr.entries);
        }
        trace!(
            "{} entries at nominal offset {} (archive offset {})",
            entry_count,
            nominal_central_directory_offset,
            self.archive_offset
        );

        let central_directory_posit = self
            .actual_offset(nominal_central_directory_offset)
            .filter(|p| p + central_directory_size <= eocdr_posit)
            .ok_or(FileError::InvalidArchive(
                "Invalid central directory size or offset",
            ))?;
        let central_directory =
            source.read_vec_at(central_directory_posit, central_directory_size)?;
        let mut remaining = central_directory.as_slice();

        let plausible = central_directory_size
            / spec::CentralDirectoryEntry::fixed_size_in_file() as u64;
        let mut entries = Vec::with_capacity(usize(entry_count.min(plausible))?);
        for _ in 0..entry_count {
            let dir_entry = spec::CentralDirectoryEntry::parse_and_consume(&mut remaining)?;
            trace!("{:?}", dir_entry);

            let header = ZipHeader::from_cde(&dir_entry)?;
            debug!("{:?}", header);
            if header.name.starts_with('/') || header.name.split('/').any(|c| c == "..") {
                warn!("Zip entry {} escapes the archive root", header.name);
            }
            entries.push(header);
        }
        self.entries = entries;
        Ok(())
    }

    fn actual_offset(&self, nominal: u64) -> Option<u64> {
        u64::try_from(nominal as i64 + self.archive_offset).ok()
    }

    pub fn entries(&self) -> &[ZipHeader] {
        &self.entries
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn closed(&self) -> bool {
        self.source.borrow().closed
    }

    /// Looks up an entry by name.
    /// Directories can be found with or without their trailing slash.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .or_else(|| {
                let trimmed = name.trim_end_matches('/');
                self.entries
                    .iter()
                    .position(|e| e.is_dir() && e.name.trim_end_matches('/') == trimmed)
            })
    }

    /// Opens the entry at `index` of [`entries()`](Self::entries).
    pub fn open(&self, index: usize) -> FileResult<ZipFile<'f>> {
        let header = self
            .entries
            .get(index)
            .cloned()
            .ok_or(FileError::InvalidArchive("No such zip entry"))?;

        let local_posit = self
            .actual_offset(header.header_offset)
            .ok_or(FileError::InvalidArchive("Invalid local file header offset"))?;
        let data_start = {
            let mut source = self.source.borrow_mut();
            let fixed_size = spec::LocalFileHeader::fixed_size_in_file();
            let mut local_bytes = source.read_vec_at(local_posit, fixed_size as u64)?;
            let variable_size = spec::LocalFileHeader::variable_size(&local_bytes)?;
            local_bytes.resize(fixed_size + variable_size, 0);
            source.read_exact_at(
                local_posit + fixed_size as u64,
                &mut local_bytes[fixed_size..],
            )?;

            let mut local_slice = local_bytes.as_slice();
            let local_header = spec::LocalFileHeader::parse_and_consume(&mut local_slice)?;
            trace!("{:?}", local_header);
            let local = ZipHeader::from_local_header(&local_header, header.header_offset)?;
            if cfg!(feature = "check-local-metadata") && !header.matches_local(&local) {
                return Err(FileError::InvalidArchive(
                    "Central directory entry doesn't match local file header",
                ));
            }
            local_posit + local_bytes.len() as u64
        };
        debug!("Opening {}", header.name);

        if header.is_encrypted() {
            return Err(FileError::UnsupportedArchive(format!(
                "Can't read encrypted file {}",
                header.name
            )));
        }

        let reader = if header.is_dir() {
            None
        } else {
            let window = SourceReader {
                source: self.source.clone(),
                pos: data_start,
                end: data_start + header.compressed_size,
            };
            Some(self.make_reader(&header, window)?)
        };

        Ok(ZipFile {
            source: self.source.clone(),
            header,
            data_start,
            reader,
        })
    }

    /// Returns a reader for an entry's contents,
    /// given its compression method and expected CRC.
    fn make_reader(
        &self,
        header: &ZipHeader,
        window: SourceReader<'f>,
    ) -> FileResult<Box<dyn Read + 'f>> {
        if let Some(decompress) = self.decompressors.get(&header.method.as_u16()) {
            return Ok(Box::new(Crc32Reader::new(
                decompress(Box::new(window)),
                header.crc32,
            )));
        }
        match header.method {
            CompressionMethod::Store => Ok(Box::new(Crc32Reader::new(window, header.crc32))),
            CompressionMethod::Deflate => Ok(Box::new(Crc32Reader::new(
                DeflateDecoder::new(window),
                header.crc32,
            ))),
            CompressionMethod::Other(id) => Err(FileError::UnsupportedArchive(format!(
                "No decompressor for method {} (used by {})",
                id, header.name
            ))),
        }
    }
}

/// Plain reads see nothing: entries are opened by name instead.
impl Read for ZipArchive<'_> {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl ReadLayer for ZipArchive<'_> {
    fn describe(&self) -> &'static str {
        "zip"
    }

    /// Closes the pipeline beneath the archive too,
    /// since entries share it.
    fn close_layer(&mut self) -> io::Result<()> {
        let mut source = self.source.borrow_mut();
        source.closed = true;
        let mut errors = Vec::new();
        closer::close_read_layers(&mut *source.chain, &mut errors);
        match FileError::combine(errors) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
        None
    }
}

/// An entry opened from a zip archive
pub struct ZipFile<'f> {
    source: Rc<RefCell<ZipSource<'f>>>,
    header: ZipHeader,
    /// Where the entry's (compressed) data starts in the source
    data_start: u64,
    /// Decompresses and checks the data; directories have none.
    reader: Option<Box<dyn Read + 'f>>,
}

impl<'f> ZipFile<'f> {
    pub fn header(&self) -> &ZipHeader {
        &self.header
    }

    /// Reads the entry's data as stored, without decompressing it
    /// or checking its CRC.
    pub fn open_raw(&self) -> Box<dyn Read + 'f> {
        Box::new(SourceReader {
            source: self.source.clone(),
            pos: self.data_start,
            end: self.data_start + self.header.compressed_size,
        })
    }
}

impl fmt::Debug for ZipFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipFile")
            .field("header", &self.header)
            .field("data_start", &self.data_start)
            .finish()
    }
}

impl Read for ZipFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.reader {
            Some(reader) => reader.read(buf),
            None if buf.is_empty() => Ok(0),
            None => Err(FileError::IsDir.into()),
        }
    }
}

impl ReadFile for ZipFile<'_> {
    fn stat(&self) -> io::Result<FileInfo> {
        Ok(self.header.file_info())
    }
}

/// Where a zip writer is between calls
enum EntryState {
    /// No entry is open; writes fail.
    Between,
    /// A directory entry is open; writes fail.
    Directory,
    Regular(EntryWriter),
}

struct EntryWriter {
    header: ZipHeader,
    /// `None` for raw entries, whose bytes come compressed already
    compressor: Option<Box<dyn ZipCompressor>>,
    hasher: crc32fast::Hasher,
    size: u64,
    compressed: u64,
    chunk: Vec<u8>,
}

impl EntryWriter {
    /// Writes `buf` to the entry, returning how many bytes went to `inner`.
    fn write(&mut self, inner: &mut dyn WriteLayer, buf: &[u8]) -> io::Result<u64> {
        match &mut self.compressor {
            None => {
                inner.write_all(buf)?;
                self.compressed += buf.len() as u64;
                Ok(buf.len() as u64)
            }
            Some(compressor) => {
                self.hasher.update(buf);
                self.size += buf.len() as u64;
                self.chunk.clear();
                compressor.compress(buf, &mut self.chunk)?;
                inner.write_all(&self.chunk)?;
                self.compressed += self.chunk.len() as u64;
                Ok(self.chunk.len() as u64)
            }
        }
    }
}

/// Options for a [`ZipWriter`]
pub(crate) struct ZipWriterOptions {
    pub offset: u64,
    pub comment: String,
    pub level: Compression,
    pub compressors: HashMap<u16, ZipCompressorFactory>,
}

/// Writes a ZIP archive, entry by entry.
pub(crate) struct ZipWriter<'f> {
    inner: Box<dyn WriteLayer + 'f>,
    /// The offset of the next byte we write, as stored in the archive
    offset: u64,
    /// Finished entries, for the central directory
    entries: Vec<ZipHeader>,
    state: EntryState,
    comment: String,
    level: Compression,
    compressors: HashMap<u16, ZipCompressorFactory>,
}

fn check_field_length(what: &str, len: usize) -> FileResult<()> {
    if len > u16::MAX as usize {
        return Err(FileError::UnsupportedArchive(format!(
            "Zip {} is {} bytes; the limit is {}",
            what,
            len,
            u16::MAX
        )));
    }
    Ok(())
}

impl<'f> ZipWriter<'f> {
    pub fn new(inner: Box<dyn WriteLayer + 'f>, options: ZipWriterOptions) -> Self {
        Self {
            inner,
            offset: options.offset,
            entries: Vec::new(),
            state: EntryState::Between,
            comment: options.comment,
            level: options.level,
            compressors: options.compressors,
        }
    }

    /// Fails unless a regular entry is open.
    pub fn check_writable(&self) -> FileResult<()> {
        match self.state {
            EntryState::Between => Err(FileError::ZipWriteBeforeCreate),
            EntryState::Directory => Err(FileError::IsDir),
            EntryState::Regular(_) => Ok(()),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> FileResult<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn compressor_for(&self, method: CompressionMethod) -> FileResult<Box<dyn ZipCompressor>> {
        if let Some(factory) = self.compressors.get(&method.as_u16()) {
            return Ok(factory());
        }
        match method {
            CompressionMethod::Store => Ok(Box::new(StoreCompressor)),
            CompressionMethod::Deflate => Ok(Box::new(DeflateCompressor::new(self.level))),
            CompressionMethod::Other(id) => Err(FileError::UnsupportedArchive(format!(
                "No compressor registered for method {}",
                id
            ))),
        }
    }

    /// Fills in what every new entry needs, before its local header.
    fn prepare(&mut self, header: &mut ZipHeader) -> FileResult<()> {
        self.finish_entry()?;
        check_field_length("entry name", header.name.len())?;
        check_field_length("entry comment", header.comment.len())?;
        // Leave room for the timestamp and Zip64 fields.
        check_field_length("extra field", header.extra.len() + 64)?;

        header.header_offset = self.offset;
        if header.name.is_ascii() && header.comment.is_ascii() {
            header.flags &= !spec::FLAG_UTF8;
        } else {
            header.flags |= spec::FLAG_UTF8;
        }
        if header.mode & MODE_TYPE_MASK == 0 {
            header.mode |= if header.is_dir() { MODE_DIR } else { MODE_FILE };
        }
        if header.mode & 0o7777 == 0 {
            header.mode |= if header.is_dir() { 0o755 } else { 0o644 };
        }
        Ok(())
    }

    /// Starts a new entry; following writes are compressed into it.
    /// A directory (a name ending in a slash) takes no writes.
    pub fn create(&mut self, mut header: ZipHeader) -> FileResult<()> {
        self.prepare(&mut header)?;
        if header.is_dir() {
            header.method = CompressionMethod::Store;
            header.flags &= !spec::FLAG_DATA_DESCRIPTOR;
            header.crc32 = 0;
            header.size = 0;
            header.compressed_size = 0;
            self.write_local_header(&header, true)?;
            debug!("Created directory {}", header.name);
            self.entries.push(header);
            self.state = EntryState::Directory;
            return Ok(());
        }

        let compressor = self.compressor_for(header.method)?;
        header.flags |= spec::FLAG_DATA_DESCRIPTOR;
        header.crc32 = 0;
        header.size = 0;
        header.compressed_size = 0;
        self.write_local_header(&header, false)?;
        debug!("Created {}", header.name);
        self.state = EntryState::Regular(EntryWriter {
            header,
            compressor: Some(compressor),
            hasher: crc32fast::Hasher::new(),
            size: 0,
            compressed: 0,
            chunk: Vec::new(),
        });
        Ok(())
    }

    /// Starts a new entry whose data is written already compressed.
    /// The header's CRC and sizes must describe that data.
    pub fn create_raw(&mut self, mut header: ZipHeader) -> FileResult<()> {
        self.prepare(&mut header)?;
        header.flags &= !spec::FLAG_DATA_DESCRIPTOR;
        self.write_local_header(&header, true)?;
        if header.is_dir() {
            debug!("Created raw directory {}", header.name);
            self.entries.push(header);
            self.state = EntryState::Directory;
            return Ok(());
        }
        debug!("Created raw {}", header.name);
        self.state = EntryState::Regular(EntryWriter {
            header,
            compressor: None,
            hasher: crc32fast::Hasher::new(),
            size: 0,
            compressed: 0,
            chunk: Vec::new(),
        });
        Ok(())
    }

    /// Copies an entry from another archive without recompressing it.
    pub fn copy(&mut self, file: &ZipFile) -> FileResult<()> {
        self.create_raw(file.header().clone())?;
        io::copy(&mut file.open_raw(), self)?;
        self.finish_entry()
    }

    fn write_local_header(&mut self, header: &ZipHeader, sizes_known: bool) -> FileResult<()> {
        let (time, date) = spec::to_msdos(&header.modified);
        let marker = spec::ZIP64_MARKER;
        let mut zip64 = Vec::new();
        let (crc32, compressed_size, uncompressed_size) = if !sizes_known {
            // A streamed entry might pass 4 GiB, so its sizes always get
            // Zip64 room here (and 8 bytes apiece in its data descriptor).
            zip64.push(0);
            zip64.push(0);
            (0, marker, marker)
        } else if header.size >= u64::from(marker) || header.compressed_size >= u64::from(marker)
        {
            zip64.push(header.size);
            zip64.push(header.compressed_size);
            (header.crc32, marker, marker)
        } else {
            (
                header.crc32,
                header.compressed_size as u32,
                header.size as u32,
            )
        };
        let extra = spec::build_extra_field(&header.extra, &header.modified, &zip64);
        let local = spec::LocalFileHeader {
            minimum_extract_version: if zip64.is_empty() {
                spec::VERSION_20
            } else {
                spec::VERSION_45
            },
            flags: header.flags,
            compression_method: header.method.as_u16(),
            last_modified_time: time,
            last_modified_date: date,
            crc32,
            compressed_size,
            uncompressed_size,
            path: header.name.as_bytes(),
            extra_field: &extra,
        };
        trace!("{:?}", local);
        let mut out = Vec::new();
        local.write(&mut out);
        self.emit(&out)
    }

    /// Finishes the current entry, if any. Writes fail until the next one.
    pub fn finish_entry(&mut self) -> FileResult<()> {
        let entry = match std::mem::replace(&mut self.state, EntryState::Between) {
            EntryState::Regular(entry) => entry,
            EntryState::Between | EntryState::Directory => return Ok(()),
        };
        let EntryWriter {
            mut header,
            compressor,
            hasher,
            size,
            mut compressed,
            mut chunk,
        } = entry;

        match compressor {
            Some(mut compressor) => {
                chunk.clear();
                compressor.finish(&mut chunk)?;
                self.emit(&chunk)?;
                compressed += chunk.len() as u64;

                header.crc32 = hasher.finalize();
                header.size = size;
                header.compressed_size = compressed;
                let mut descriptor = Vec::new();
                spec::write_zip64_data_descriptor(&mut descriptor, header.crc32, compressed, size);
                self.emit(&descriptor)?;
            }
            None => {
                if compressed != header.compressed_size {
                    return Err(FileError::InvalidArchive(
                        "Raw zip entry's size doesn't match its header",
                    ));
                }
            }
        }
        debug!(
            "Finished {} ({} bytes, {} compressed)",
            header.name, header.size, header.compressed_size
        );
        self.entries.push(header);
        Ok(())
    }

    /// Writes the central directory and the records that find it.
    fn write_central_directory(&mut self) -> FileResult<()> {
        let marker = u64::from(spec::ZIP64_MARKER);
        let central_directory_offset = self.offset;
        let mut out = Vec::new();
        for header in &self.entries {
            let mut zip64 = Vec::new();
            let mut narrow = |value: u64| {
                if value >= marker {
                    zip64.push(value);
                    spec::ZIP64_MARKER
                } else {
                    value as u32
                }
            };
            // Zip64 values go in this order.
            let uncompressed_size = narrow(header.size);
            let compressed_size = narrow(header.compressed_size);
            let header_offset = narrow(header.header_offset);

            let (time, date) = spec::to_msdos(&header.modified);
            let extra = spec::build_extra_field(&header.extra, &header.modified, &zip64);
            let cde = spec::CentralDirectoryEntry {
                source_version: spec::CREATOR_VERSION,
                minimum_extract_version: if zip64.is_empty() {
                    spec::VERSION_20
                } else {
                    spec::VERSION_45
                },
                flags: header.flags,
                compression_method: header.method.as_u16(),
                last_modified_time: time,
                last_modified_date: date,
                crc32: header.crc32,
                compressed_size,
                uncompressed_size,
                disk_number: 0,
                internal_file_attributes: 0,
                external_file_attributes: spec::attributes_from_mode(header.mode),
                header_offset,
                path: header.name.as_bytes(),
                extra_field: &extra,
                file_comment: header.comment.as_bytes(),
            };
            trace!("{:?}", cde);
            cde.write(&mut out);
        }
        let central_directory_size = out.len() as u64;
        let entries = self.entries.len() as u64;

        let needs_zip64 = entries >= u64::from(u16::MAX)
            || central_directory_size >= marker
            || central_directory_offset >= marker;
        if needs_zip64 {
            let zip64_eocdr_offset = central_directory_offset + central_directory_size;
            spec::Zip64EndOfCentralDirectory {
                source_version: spec::CREATOR_VERSION,
                minimum_extract_version: spec::VERSION_45,
                disk_number: 0,
                disk_with_central_directory: 0,
                entries_on_this_disk: entries,
                entries,
                central_directory_size,
                central_directory_offset,
                extensible_data: &[],
            }
            .write(&mut out);
            spec::Zip64EndOfCentralDirectoryLocator {
                disk_with_central_directory: 0,
                zip64_eocdr_offset,
                disks: 1,
            }
            .write(&mut out);
        }

        let short_entries = entries.min(u64::from(u16::MAX)) as u16;
        let eocdr = spec::EndOfCentralDirectory {
            disk_number: 0,
            disk_with_central_directory: 0,
            entries_on_this_disk: short_entries,
            entries: short_entries,
            central_directory_size: central_directory_size.min(marker) as u32,
            central_directory_offset: central_directory_offset.min(marker) as u32,
            file_comment: self.comment.as_bytes(),
        };
        trace!("{:?}", eocdr);
        eocdr.write(&mut out);
        self.emit(&out)
    }
}

impl Write for ZipWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            EntryState::Between => Err(FileError::ZipWriteBeforeCreate.into()),
            EntryState::Directory => Err(FileError::IsDir.into()),
            EntryState::Regular(entry) => {
                let written = entry.write(&mut *self.inner, buf)?;
                self.offset += written;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteLayer for ZipWriter<'_> {
    fn describe(&self) -> &'static str {
        "zip"
    }

    fn close_layer(&mut self) -> io::Result<()> {
        self.finish_entry()?;
        self.write_central_directory()?;
        self.inner.flush()
    }

    fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer> {
        Some(&mut *self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Cursor, Seek};

    /// The bottom of a test read pipeline
    struct Mem(Cursor<Vec<u8>>);

    impl Read for Mem {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl ReadLayer for Mem {
        fn describe(&self) -> &'static str {
            "mem"
        }

        fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
            None
        }

        fn as_seek(&mut self) -> Option<&mut dyn Seek> {
            Some(&mut self.0)
        }
    }

    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WriteLayer for Sink {
        fn describe(&self) -> &'static str {
            "sink"
        }

        fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer> {
            None
        }
    }

    fn writer(sink: &Sink, offset: u64, comment: &str) -> ZipWriter<'static> {
        ZipWriter::new(
            Box::new(sink.clone()),
            ZipWriterOptions {
                offset,
                comment: comment.to_owned(),
                level: Compression::default(),
                compressors: HashMap::new(),
            },
        )
    }

    fn sample_archive() -> Vec<u8> {
        let sink = Sink::default();
        let mut zip = writer(&sink, 0, "sample");
        zip.create(ZipHeader::new("docs/")).unwrap();
        zip.create(ZipHeader::new("docs/deflated.txt")).unwrap();
        zip.write_all(&b"squeeze me ".repeat(100)).unwrap();
        let mut stored = ZipHeader::new("stored.bin");
        stored.method = CompressionMethod::Store;
        zip.create(stored).unwrap();
        zip.write_all(&[1, 2, 3, 4]).unwrap();
        zip.close_layer().unwrap();
        let bytes = sink.0.borrow().clone();
        bytes
    }

    fn read_all(archive: &ZipArchive, name: &str) -> Vec<u8> {
        let index = archive.find(name).unwrap();
        let mut file = archive.open(index).unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        contents
    }

    fn in_memory(bytes: Vec<u8>) -> ZipArchive<'static> {
        let mut archive =
            ZipArchive::in_memory(Box::new(Mem(Cursor::new(bytes))), HashMap::new());
        archive.load().unwrap();
        archive
    }

    #[test]
    fn round_trip_in_memory() {
        let archive = in_memory(sample_archive());
        let names: Vec<_> = archive.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["docs/", "docs/deflated.txt", "stored.bin"]);
        assert_eq!(archive.comment(), "sample");

        let deflated = &archive.entries()[1];
        assert_eq!(deflated.method, CompressionMethod::Deflate);
        assert_eq!(deflated.size, 1100);
        assert!(deflated.compressed_size < deflated.size);

        assert_eq!(read_all(&archive, "docs/deflated.txt"), b"squeeze me ".repeat(100));
        assert_eq!(read_all(&archive, "stored.bin"), [1, 2, 3, 4]);

        let mut dir = archive.open(archive.find("docs").unwrap()).unwrap();
        assert!(dir.header().is_dir());
        assert!(dir.stat().unwrap().is_dir());
        let err: FileError = dir.read(&mut [0; 8]).unwrap_err().into();
        assert!(matches!(err, FileError::IsDir));
    }

    #[test]
    fn seekable_window_with_prefix() {
        let prefix = vec![0xAB; 1000];
        let sink = Sink::default();
        let mut zip = writer(&sink, prefix.len() as u64, "offset");
        zip.create(ZipHeader::new("a.txt")).unwrap();
        zip.write_all(b"alpha").unwrap();
        zip.close_layer().unwrap();

        let mut file = prefix.clone();
        file.extend_from_slice(&sink.0.borrow());
        let len = file.len() as u64;

        // Reading the whole file: stored offsets are right as-is.
        let mut whole =
            ZipArchive::seekable(Box::new(Mem(Cursor::new(file.clone()))), 0, len, HashMap::new());
        whole.load().unwrap();
        assert_eq!(whole.archive_offset, 0);
        assert_eq!(read_all(&whole, "a.txt"), b"alpha");

        // Reading from past the prefix: they're all 1000 bytes ahead.
        let mut window = ZipArchive::seekable(
            Box::new(Mem(Cursor::new(file))),
            1000,
            len - 1000,
            HashMap::new(),
        );
        window.load().unwrap();
        assert_eq!(window.archive_offset, -1000);
        assert_eq!(window.comment(), "offset");
        assert_eq!(read_all(&window, "a.txt"), b"alpha");
    }

    #[test]
    fn unknown_prepended_bytes() {
        let mut file = b"#!/bin/sh\nexit 0\n".to_vec();
        let prefix_len = file.len() as i64;
        file.extend_from_slice(&sample_archive());
        let archive = in_memory(file);
        assert_eq!(archive.archive_offset, prefix_len);
        assert_eq!(read_all(&archive, "stored.bin"), [1, 2, 3, 4]);
    }

    #[test]
    fn corrupt_data_fails_the_crc() {
        let mut bytes = sample_archive();
        let archive = in_memory(bytes.clone());
        let index = archive.find("stored.bin").unwrap();
        let data_start = archive.open(index).unwrap().data_start as usize;
        bytes[data_start] ^= 0xFF;

        let archive = in_memory(bytes);
        let mut file = archive.open(index).unwrap();
        let mut contents = Vec::new();
        let err: FileError = file.read_to_end(&mut contents).unwrap_err().into();
        assert!(matches!(err, FileError::ChecksumMismatch { .. }));
    }

    #[test]
    fn writer_states() {
        let sink = Sink::default();
        let mut zip = writer(&sink, 0, "");
        let err: FileError = zip.write(b"early").unwrap_err().into();
        assert!(matches!(err, FileError::ZipWriteBeforeCreate));

        zip.create(ZipHeader::new("d/")).unwrap();
        let err: FileError = zip.write(b"into a dir").unwrap_err().into();
        assert!(matches!(err, FileError::IsDir));

        zip.create(ZipHeader::new("f")).unwrap();
        zip.write_all(b"fine").unwrap();
        zip.finish_entry().unwrap();
        let err: FileError = zip.write(b"late").unwrap_err().into();
        assert!(matches!(err, FileError::ZipWriteBeforeCreate));

        let mut unknown = ZipHeader::new("g");
        unknown.method = CompressionMethod::Other(99);
        assert!(matches!(
            zip.create(unknown),
            Err(FileError::UnsupportedArchive(_))
        ));
        zip.close_layer().unwrap();
    }

    #[test]
    fn raw_copy() {
        let source = in_memory(sample_archive());
        let sink = Sink::default();
        let mut zip = writer(&sink, 0, "");
        for index in 0..source.entries().len() {
            zip.copy(&source.open(index).unwrap()).unwrap();
        }
        zip.close_layer().unwrap();

        let copied = in_memory(sink.0.borrow().clone());
        assert_eq!(copied.entries().len(), 3);
        assert_eq!(read_all(&copied, "docs/deflated.txt"), b"squeeze me ".repeat(100));
        assert_eq!(copied.entries()[1].crc32, source.entries()[1].crc32);
    }

    #[test]
    fn raw_size_mismatch() {
        let sink = Sink::default();
        let mut zip = writer(&sink, 0, "");
        let mut header = ZipHeader::new("raw");
        header.method = CompressionMethod::Store;
        header.compressed_size = 10;
        header.size = 10;
        zip.create_raw(header).unwrap();
        zip.write_all(b"short").unwrap();
        assert!(matches!(
            zip.finish_entry(),
            Err(FileError::InvalidArchive(_))
        ));
    }

    #[test]
    fn raw_directories_take_no_writes() {
        let sink = Sink::default();
        let mut zip = writer(&sink, 0, "");
        zip.create_raw(ZipHeader::new("d/")).unwrap();
        let err: FileError = zip.write(b"x").unwrap_err().into();
        assert!(matches!(err, FileError::IsDir));
        assert!(matches!(zip.check_writable(), Err(FileError::IsDir)));
        zip.close_layer().unwrap();

        let archive = in_memory(sink.0.borrow().clone());
        let dir = &archive.entries()[0];
        assert!(dir.is_dir());
        assert_eq!((dir.size, dir.compressed_size), (0, 0));
    }

    #[test]
    fn streamed_entries_leave_room_for_zip64() {
        let sink = Sink::default();
        let mut zip = writer(&sink, 0, "");
        zip.create(ZipHeader::new("big")).unwrap();
        zip.write_all(b"not actually big").unwrap();
        zip.close_layer().unwrap();
        let bytes = sink.0.borrow().clone();

        let mut rest = &bytes[..];
        let local = spec::LocalFileHeader::parse_and_consume(&mut rest).unwrap();
        assert_eq!(local.minimum_extract_version, spec::VERSION_45);
        assert_eq!(local.compressed_size, spec::ZIP64_MARKER);
        assert_eq!(local.uncompressed_size, spec::ZIP64_MARKER);
        let parsed = ZipHeader::from_local_header(&local, 0).unwrap();
        assert_eq!((parsed.size, parsed.compressed_size), (0, 0));

        // The descriptor carries 8-byte sizes, right up to the central directory.
        let archive = in_memory(bytes.clone());
        let entry = archive.open(0).unwrap();
        let end = (entry.data_start + entry.header().compressed_size) as usize;
        assert_eq!(&bytes[end..end + 4], b"PK\x07\x08");
        let le64 = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        assert_eq!(le64(end + 8), entry.header().compressed_size);
        assert_eq!(le64(end + 16), 16);
        assert_eq!(&bytes[end + 24..end + 28], b"PK\x01\x02");
        assert_eq!(read_all(&archive, "big"), b"not actually big");
    }

    /// Stores bytes XORed with a key: enough to prove the plumbing.
    struct Xor;

    impl ZipCompressor for Xor {
        fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
            out.extend(input.iter().map(|b| b ^ 0x5A));
            Ok(())
        }

        fn finish(&mut self, _out: &mut Vec<u8>) -> io::Result<()> {
            Ok(())
        }
    }

    struct Unxor<'r>(Box<dyn Read + 'r>);

    impl Read for Unxor<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.0.read(buf)?;
            buf[..n].iter_mut().for_each(|b| *b ^= 0x5A);
            Ok(n)
        }
    }

    fn unxor<'r>(compressed: Box<dyn Read + 'r>) -> Box<dyn Read + 'r> {
        Box::new(Unxor(compressed))
    }

    #[test]
    fn registered_methods() {
        let sink = Sink::default();
        let mut compressors = HashMap::new();
        compressors.insert(
            77,
            zip_compressor(|| Box::new(Xor) as Box<dyn ZipCompressor>),
        );
        let mut zip = ZipWriter::new(
            Box::new(sink.clone()),
            ZipWriterOptions {
                offset: 0,
                comment: String::new(),
                level: Compression::default(),
                compressors,
            },
        );
        let mut header = ZipHeader::new("xored");
        header.method = CompressionMethod::Other(77);
        zip.create(header).unwrap();
        zip.write_all(b"secret").unwrap();
        zip.close_layer().unwrap();
        let bytes = sink.0.borrow().clone();

        // Without a decompressor, the entry can be listed but not opened.
        let archive = in_memory(bytes.clone());
        assert!(matches!(
            archive.open(0),
            Err(FileError::UnsupportedArchive(_))
        ));

        let mut decompressors = HashMap::new();
        decompressors.insert(77, zip_decompressor(unxor));
        let mut archive = ZipArchive::in_memory(Box::new(Mem(Cursor::new(bytes))), decompressors);
        archive.load().unwrap();
        assert_eq!(read_all(&archive, "xored"), b"secret");
    }

    #[test]
    fn closing_closes_entries() {
        let mut archive = in_memory(sample_archive());
        let mut file = archive.open(archive.find("stored.bin").unwrap()).unwrap();
        archive.close_layer().unwrap();
        assert!(archive.closed());
        let err: FileError = file.read(&mut [0; 4]).unwrap_err().into();
        assert!(matches!(err, FileError::ReaderClosed));
    }

    #[test]
    fn not_a_zip() {
        let mut archive = ZipArchive::in_memory(
            Box::new(Mem(Cursor::new(b"plain old text".to_vec()))),
            HashMap::new(),
        );
        assert!(matches!(archive.load(), Err(FileError::InvalidArchive(_))));
    }
}
