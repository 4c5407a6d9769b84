//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`zip`] module.
//! Each record is parsed from and written to byte slices;
//! the caller decides where those bytes come from.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [_Zip Files: History, Explanation and Implementation_]
//! is also a fantastic resource and a great read.
//!
//! [`zip`]: ../zip/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT
//! [_Zip Files: History, Explanation and Implementation_]: https://www.hanshq.net/zip.html

use std::borrow::Cow;
use std::convert::TryInto;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use codepage_437::*;
use memchr::memmem;

use crate::arch::usize;
use crate::fs::{MODE_DIR, MODE_FILE, MODE_TYPE_MASK};
use crate::result::*;
use crate::zip::{CompressionMethod, ZipHeader};

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Data descriptor magic number
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];

/// Bit 0: If set, indicates that the file is encrypted
pub const FLAG_ENCRYPTED: u16 = 1;
/// Bit 3: CRC-32 and sizes follow the data, in a data descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// Bit 11: Language encoding flag (EFS)
pub const FLAG_UTF8: u16 = 1 << 11;

/// "Version made by": Unix, spec version 6.3
pub const CREATOR_VERSION: u16 = (3 << 8) | 63;
/// Version needed to extract plain (deflated or stored) entries
pub const VERSION_20: u16 = 20;
/// Version needed to extract entries with Zip64 fields
pub const VERSION_45: u16 = 45;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const EXTENDED_TIMESTAMP_ID: u16 = 0x5455;

/// Marks a 32-bit field whose real value is in a Zip64 record
pub const ZIP64_MARKER: u32 = u32::MAX;

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::Store,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Other(v),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            CompressionMethod::Store => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Other(v) => v,
        }
    }
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum System {
    Dos,
    Unix,
    Unknown,
}

impl System {
    fn from_source_version(source_version: u16) -> Self {
        // 4.4.2.1 The upper byte indicates the compatibility of the file
        // attribute information.  If the external file attributes
        // are compatible with MS-DOS and can be read by PKZIP for
        // DOS version 2.04g then this value will be zero.  If these
        // attributes are not compatible, then this value will
        // identify the host system on which the attributes are
        // compatible.
        //
        // 4.4.2.2 The current mappings are:
        //
        //  0 - MS-DOS and OS/2 (FAT / VFAT / FAT32 file systems)
        //  3 - UNIX                     10 - Windows NTFS
        // 19 - OS X (Darwin)            (and many more)
        match source_version >> 8 {
            0 | 10 | 14 => System::Dos,
            3 | 19 => System::Unix,
            _ => System::Unknown,
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Splits `len` bytes off the front of `input`,
/// failing instead of panicking when there aren't enough.
fn take<'a>(input: &mut &'a [u8], len: usize, what: &'static str) -> FileResult<&'a [u8]> {
    if input.len() < len {
        return Err(FileError::InvalidArchive(what));
    }
    let (taken, rest) = input.split_at(len);
    *input = rest;
    Ok(taken)
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> FileResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        // .ZIP file comment       (variable size)
        let mut fixed = take(
            &mut eocdr,
            Self::size_in_file(),
            "Truncated End Of Central Directory Record",
        )?;
        // Assert the magic instead of checking for it
        // because the search should have found it.
        assert_eq!(fixed[..4], EOCDR_MAGIC);
        fixed = &fixed[4..];
        let disk_number = read_u16(&mut fixed);
        let disk_with_central_directory = read_u16(&mut fixed);
        let entries_on_this_disk = read_u16(&mut fixed);
        let entries = read_u16(&mut fixed);
        let central_directory_size = read_u32(&mut fixed);
        let central_directory_offset = read_u32(&mut fixed);
        let comment_length = usize(read_u16(&mut fixed))?;
        let file_comment = take(
            &mut eocdr,
            comment_length,
            "Zip comment runs past the end of the archive",
        )?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&EOCDR_MAGIC);
        put_u16(out, self.disk_number);
        put_u16(out, self.disk_with_central_directory);
        put_u16(out, self.entries_on_this_disk);
        put_u16(out, self.entries);
        put_u32(out, self.central_directory_size);
        put_u32(out, self.central_directory_offset);
        put_u16(out, self.file_comment.len() as u16);
        out.extend_from_slice(self.file_comment);
    }

    pub const fn size_in_file() -> usize {
        22
    }
}

/// The most bytes from the end of an archive its EOCDR could start at.
pub const EOCDR_SEARCH_SPAN: usize = EndOfCentralDirectory::size_in_file() + u16::MAX as usize;

/// Searches backward through `tail` (the end of an archive)
/// to find the End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable size means we can't jump to a known offset.
/// Comments can contain the magic number too,
/// so only accept a record whose comment fits in what's left.
pub fn find_eocdr(tail: &[u8]) -> FileResult<usize> {
    for posit in memmem::rfind_iter(tail, &EOCDR_MAGIC) {
        let end_of_fixed = posit + EndOfCentralDirectory::size_in_file();
        if end_of_fixed > tail.len() {
            continue;
        }
        let mut comment_length = &tail[end_of_fixed - 2..end_of_fixed];
        if end_of_fixed + usize(read_u16(&mut comment_length))? <= tail.len() {
            return Ok(posit);
        }
    }
    Err(FileError::InvalidArchive(
        "Couldn't find End Of Central Directory Record",
    ))
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn parse(mut mapping: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        if mapping.len() < Self::size_in_file() || mapping[..4] != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        mapping = &mapping[4..];
        let disk_with_central_directory = read_u32(&mut mapping);
        let zip64_eocdr_offset = read_u64(&mut mapping);
        let disks = read_u32(&mut mapping);

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&ZIP64_EOCDR_LOCATOR_MAGIC);
        put_u32(out, self.disk_with_central_directory);
        put_u64(out, self.zip64_eocdr_offset);
        put_u32(out, self.disks);
    }

    pub const fn size_in_file() -> usize {
        20
    }
}

/// Data from the Zip64 end of central directory record
///
/// This should immediately precede the Zip64 end of central directory locator
/// and provides 64-bit versions of the EOCDR's fields.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
    pub extensible_data: &'a [u8],
}

impl<'a> Zip64EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> FileResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        let mut fixed = take(
            &mut eocdr,
            Self::fixed_size_in_file(),
            "Truncated Zip64 End Of Central Directory Record",
        )?;
        // Assert the magic instead of checking for it
        // because the search should have found it.
        assert_eq!(fixed[..4], ZIP64_EOCDR_MAGIC);
        fixed = &fixed[4..];
        let eocdr_size = read_u64(&mut fixed);
        let source_version = read_u16(&mut fixed);
        let minimum_extract_version = read_u16(&mut fixed);
        let disk_number = read_u32(&mut fixed);
        let disk_with_central_directory = read_u32(&mut fixed);
        let entries_on_this_disk = read_u64(&mut fixed);
        let entries = read_u64(&mut fixed);
        let central_directory_size = read_u64(&mut fixed);
        let central_directory_offset = read_u64(&mut fixed);

        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        //
        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        let extensible_data_length = usize(eocdr_size)?
            .checked_add(12)
            .and_then(|s| s.checked_sub(Self::fixed_size_in_file()))
            .ok_or(FileError::InvalidArchive(
                "Invalid extensible data length in Zip64 End Of Central Directory Record",
            ))?;
        let extensible_data = take(
            &mut eocdr,
            extensible_data_length,
            "Invalid extensible data length in Zip64 End Of Central Directory Record",
        )?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            disk_number,
            disk_with_central_directory,
            entries,
            entries_on_this_disk,
            central_directory_size,
            central_directory_offset,
            extensible_data,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&ZIP64_EOCDR_MAGIC);
        put_u64(
            out,
            (Self::fixed_size_in_file() + self.extensible_data.len() - 12) as u64,
        );
        put_u16(out, self.source_version);
        put_u16(out, self.minimum_extract_version);
        put_u32(out, self.disk_number);
        put_u32(out, self.disk_with_central_directory);
        put_u64(out, self.entries_on_this_disk);
        put_u64(out, self.entries);
        put_u64(out, self.central_directory_size);
        put_u64(out, self.central_directory_offset);
        out.extend_from_slice(self.extensible_data);
    }

    pub const fn fixed_size_in_file() -> usize {
        56
    }
}

/// Finds the Zip64 end of central directory record in the given slice,
/// searching backward from its end.
///
/// The record normally sits right before the locator,
/// but ZIP archives can have arbitrary junk up front
/// that throws off the locator's offset.
pub fn find_zip64_eocdr(mapping: &[u8]) -> FileResult<usize> {
    memmem::rfind(mapping, &ZIP64_EOCDR_MAGIC).ok_or(FileError::InvalidArchive(
        "Couldn't find zip64 End Of Central Directory Record",
    ))
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    pub fn parse_and_consume(entry: &mut &'a [u8]) -> FileResult<Self> {
        // 4.3.12  Central directory structure:
        //
        // [central directory header 1]
        // .
        // .
        // .
        // [central directory header n]
        // [digital signature]
        //
        // File header:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        const TRUNCATED: &str = "Truncated central directory entry";
        let mut fixed = take(entry, Self::fixed_size_in_file(), TRUNCATED)?;
        if fixed[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(FileError::InvalidArchive("Invalid central directory entry"));
        }
        fixed = &fixed[4..];
        let source_version = read_u16(&mut fixed);
        let minimum_extract_version = read_u16(&mut fixed);
        let flags = read_u16(&mut fixed);
        let compression_method = read_u16(&mut fixed);
        let last_modified_time = read_u16(&mut fixed);
        let last_modified_date = read_u16(&mut fixed);
        let crc32 = read_u32(&mut fixed);
        let compressed_size = read_u32(&mut fixed);
        let uncompressed_size = read_u32(&mut fixed);
        let path_length = usize(read_u16(&mut fixed))?;
        let extra_field_length = usize(read_u16(&mut fixed))?;
        let file_comment_length = usize(read_u16(&mut fixed))?;
        let disk_number = read_u16(&mut fixed);
        let internal_file_attributes = read_u16(&mut fixed);
        let external_file_attributes = read_u32(&mut fixed);
        let header_offset = read_u32(&mut fixed);
        let path = take(entry, path_length, TRUNCATED)?;
        let extra_field = take(entry, extra_field_length, TRUNCATED)?;
        let file_comment = take(entry, file_comment_length, TRUNCATED)?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        put_u16(out, self.source_version);
        put_u16(out, self.minimum_extract_version);
        put_u16(out, self.flags);
        put_u16(out, self.compression_method);
        put_u16(out, self.last_modified_time);
        put_u16(out, self.last_modified_date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.path.len() as u16);
        put_u16(out, self.extra_field.len() as u16);
        put_u16(out, self.file_comment.len() as u16);
        put_u16(out, self.disk_number);
        put_u16(out, self.internal_file_attributes);
        put_u32(out, self.external_file_attributes);
        put_u32(out, self.header_offset);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
        out.extend_from_slice(self.file_comment);
    }

    pub const fn fixed_size_in_file() -> usize {
        46
    }
}

/// Decodes a name or comment: UTF-8 if the flags say so, CP437 otherwise.
pub(crate) fn decode_text(bytes: &[u8], flags: u16) -> FileResult<String> {
    if flags & FLAG_UTF8 != 0 {
        Ok(std::str::from_utf8(bytes)?.to_owned())
    } else {
        let text: Cow<str> = Cow::borrow_from_cp437(bytes, &CP437_CONTROL);
        Ok(text.into_owned())
    }
}

/// MS-DOS "directory" attribute
const DOS_DIRECTORY: u32 = 0x10;
/// MS-DOS "read-only" attribute
const DOS_READ_ONLY: u32 = 0x01;

/// Works out Unix mode bits from an entry's external attributes.
fn mode_from_attributes(source_version: u16, external: u32, name: &str) -> u32 {
    let mode = match System::from_source_version(source_version) {
        System::Unix => external >> 16,
        System::Dos => {
            let perm = if external & DOS_READ_ONLY != 0 {
                0o444
            } else {
                0o666
            };
            if external & DOS_DIRECTORY != 0 || name.ends_with('/') {
                MODE_DIR | perm | 0o111
            } else {
                MODE_FILE | perm
            }
        }
        System::Unknown => 0,
    };
    // Fall back to the name when the attributes are no help.
    if mode & MODE_TYPE_MASK != 0 {
        mode
    } else if name.ends_with('/') {
        MODE_DIR | 0o755
    } else {
        MODE_FILE | if mode & 0o777 != 0 { mode & 0o7777 } else { 0o644 }
    }
}

/// External attributes for an entry we're writing: Unix mode up top,
/// plus the MS-DOS directory bit so that DOS-minded readers agree.
pub fn attributes_from_mode(mode: u32) -> u32 {
    let mut external = mode << 16;
    if mode & MODE_TYPE_MASK == MODE_DIR {
        external |= DOS_DIRECTORY;
    }
    if mode & 0o200 == 0 {
        external |= DOS_READ_ONLY;
    }
    external
}

impl ZipHeader {
    /// Extracts a `ZipHeader` from a central directory entry
    pub(crate) fn from_cde(cde: &CentralDirectoryEntry) -> FileResult<Self> {
        let name = decode_text(cde.path, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(FileError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                name, cde.disk_number,
            )));
        }

        let mut header = Self {
            mode: mode_from_attributes(cde.source_version, cde.external_file_attributes, &name),
            comment: decode_text(cde.file_comment, cde.flags)?,
            method: CompressionMethod::from_u16(cde.compression_method),
            modified: parse_msdos(cde.last_modified_time, cde.last_modified_date),
            crc32: cde.crc32,
            compressed_size: u64::from(cde.compressed_size),
            size: u64::from(cde.uncompressed_size),
            flags: cde.flags,
            extra: cde.extra_field.to_vec(),
            header_offset: u64::from(cde.header_offset),
            name,
        };

        parse_extra_field(&mut header, cde.extra_field)?;

        Ok(header)
    }

    /// Extracts what a local file header knows about an entry.
    ///
    /// Since the local header doesn't contain the offset
    /// (we're at it already if we're reading the thing),
    /// take the CDE-provided offset as an argument.
    pub(crate) fn from_local_header(
        local: &LocalFileHeader,
        header_offset: u64,
    ) -> FileResult<Self> {
        let mut header = Self {
            name: decode_text(local.path, local.flags)?,
            comment: String::new(),
            method: CompressionMethod::from_u16(local.compression_method),
            modified: parse_msdos(local.last_modified_time, local.last_modified_date),
            crc32: local.crc32,
            compressed_size: u64::from(local.compressed_size),
            size: u64::from(local.uncompressed_size),
            mode: 0,
            flags: local.flags,
            extra: local.extra_field.to_vec(),
            header_offset,
        };

        parse_extra_field(&mut header, local.extra_field)?;

        Ok(header)
    }

    /// Returns true if a local file header agrees with this
    /// (central directory) header on everything they both store.
    ///
    /// With a data descriptor, the local header's CRC and sizes are
    /// placeholders, so they aren't compared.
    pub(crate) fn matches_local(&self, local: &ZipHeader) -> bool {
        if self.name != local.name || self.method != local.method {
            return false;
        }
        if local.flags & FLAG_DATA_DESCRIPTOR != 0 {
            return true;
        }
        self.crc32 == local.crc32
            && self.size == local.size
            && self.compressed_size == local.compressed_size
    }
}

fn parse_msdos(time: u16, date: u16) -> NaiveDateTime {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    // Plenty of archivers leave zeroes here.
    NaiveDate::from_ymd_opt(years, months, days)
        .and_then(|d| d.and_hms_opt(hours, minutes, seconds))
        .unwrap_or_default()
}

/// Packs a timestamp into MS-DOS (time, date) fields,
/// clamped to the years they can hold (1980-2107).
pub fn to_msdos(when: &NaiveDateTime) -> (u16, u16) {
    if when.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let year = (when.year() - 1980).min(127) as u16;
    let date = (year << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    let time = ((when.hour() as u16) << 11)
        | ((when.minute() as u16) << 5)
        | (when.second() as u16 / 2);
    (time, date)
}

/// Parses the "extra fields" found in central directory entries
/// and local file headers.
///
/// We look for Zip64 info (64-bit values for files > 2^32 in size)
/// and extended timestamps (which beat MS-DOS's two-second local time).
fn parse_extra_field(header: &mut ZipHeader, mut extra_field: &[u8]) -> FileResult<()> {
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:

    //     header1+data1 + header2+data2 . . .

    // Each header MUST consist of:

    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    const MISSING: FileError = FileError::InvalidArchive("Zip64 extra field is missing a value");

    while extra_field.len() >= 4 {
        let kind = read_u16(&mut extra_field);
        let field_len = usize(read_u16(&mut extra_field))?;
        let mut field = take(
            &mut extra_field,
            field_len,
            "Extra field runs past the end of its record",
        )?;

        match kind {
            // Zip64 extended information extra field
            ZIP64_EXTRA_ID => {
                // Values only appear for fields that overflowed, in this order.
                for value in [
                    &mut header.size,
                    &mut header.compressed_size,
                    &mut header.header_offset,
                ] {
                    if *value == u64::from(ZIP64_MARKER) {
                        if field.len() < 8 {
                            return Err(MISSING);
                        }
                        *value = read_u64(&mut field);
                    }
                }
            }
            // Extended timestamp: a flags byte, then (if bit 0 is set)
            // the modification time as seconds since the Unix epoch.
            EXTENDED_TIMESTAMP_ID if field.len() >= 5 && field[0] & 1 != 0 => {
                field = &field[1..];
                let secs = read_u32(&mut field) as i32;
                if let Some(t) = DateTime::from_timestamp(i64::from(secs), 0) {
                    header.modified = t.naive_utc();
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Builds the extra field for an entry we're writing:
/// the caller's fields (minus any stale Zip64 or timestamp fields),
/// then an extended timestamp, then Zip64 values for whatever overflowed.
pub fn build_extra_field(user_extra: &[u8], modified: &NaiveDateTime, zip64: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut rest = user_extra;
    while rest.len() >= 4 {
        let mut peek = rest;
        let kind = read_u16(&mut peek);
        let len = read_u16(&mut peek) as usize;
        if peek.len() < len {
            break;
        }
        if kind != ZIP64_EXTRA_ID && kind != EXTENDED_TIMESTAMP_ID {
            out.extend_from_slice(&rest[..4 + len]);
        }
        rest = &peek[len..];
    }

    let secs = modified.and_utc().timestamp();
    if let Ok(secs) = u32::try_from(secs) {
        put_u16(&mut out, EXTENDED_TIMESTAMP_ID);
        put_u16(&mut out, 5);
        out.push(1);
        put_u32(&mut out, secs);
    }

    if !zip64.is_empty() {
        put_u16(&mut out, ZIP64_EXTRA_ID);
        put_u16(&mut out, (zip64.len() * 8) as u16);
        for value in zip64 {
            put_u64(&mut out, *value);
        }
    }
    out
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// These headers alllow for "streaming" decompression without
/// the use of the central directory,
/// but we don't make use of this feature.
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    pub fn parse_and_consume(header: &mut &'a [u8]) -> FileResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        const TRUNCATED: &str = "Truncated local file header";
        let mut fixed = take(header, Self::fixed_size_in_file(), TRUNCATED)?;
        if fixed[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(FileError::InvalidArchive("Invalid local file header"));
        }
        fixed = &fixed[4..];
        let minimum_extract_version = read_u16(&mut fixed);
        let flags = read_u16(&mut fixed);
        let compression_method = read_u16(&mut fixed);
        let last_modified_time = read_u16(&mut fixed);
        let last_modified_date = read_u16(&mut fixed);
        let crc32 = read_u32(&mut fixed);
        let compressed_size = read_u32(&mut fixed);
        let uncompressed_size = read_u32(&mut fixed);
        let path_length = usize(read_u16(&mut fixed))?;
        let extra_field_length = usize(read_u16(&mut fixed))?;
        let path = take(header, path_length, TRUNCATED)?;
        let extra_field = take(header, extra_field_length, TRUNCATED)?;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }

    /// Reads the name and extra field lengths from a header's fixed part,
    /// so the caller knows how much more to read.
    pub fn variable_size(fixed: &[u8]) -> FileResult<usize> {
        if fixed.len() < Self::fixed_size_in_file() || fixed[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(FileError::InvalidArchive("Invalid local file header"));
        }
        let mut lengths = &fixed[26..30];
        let path_length = usize(read_u16(&mut lengths))?;
        let extra_field_length = usize(read_u16(&mut lengths))?;
        Ok(path_length + extra_field_length)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        put_u16(out, self.minimum_extract_version);
        put_u16(out, self.flags);
        put_u16(out, self.compression_method);
        put_u16(out, self.last_modified_time);
        put_u16(out, self.last_modified_date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.path.len() as u16);
        put_u16(out, self.extra_field.len() as u16);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
    }

    pub const fn fixed_size_in_file() -> usize {
        30
    }
}

/// Writes a data descriptor, which follows an entry's data
/// when the local header couldn't know its CRC or sizes.
/// That header carried a Zip64 extra field, so the sizes take 8 bytes.
pub fn write_zip64_data_descriptor(out: &mut Vec<u8>, crc32: u32, compressed: u64, size: u64) {
    // 4.3.9.1 This descriptor MUST exist if bit 3 of the general
    // purpose bit flag is set (see below).
    //
    // 4.3.9.2 When extracting, if the zip64 extended information extra
    // field is present for the file the compressed and uncompressed
    // sizes will be 8 byte values.
    out.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
    put_u32(out, crc32);
    put_u64(out, compressed);
    put_u64(out, size);
}
