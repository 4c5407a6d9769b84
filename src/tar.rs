//! Tar framing: a streaming reader and writer over 512-byte blocks.
//!
//! The [`tar`] crate provides the header block codec;
//! the framing around it (member payloads, padding, extended headers,
//! the end-of-archive marker) lives here so that members can be read
//! and written in place, through the rest of the pipeline.
//!
//! Supported extensions when reading:
//! - POSIX.1-2001 (PAX) local and global records for
//!   `path`, `linkpath`, `size`, `uid`, `gid`, `uname`, `gname`, and `mtime`.
//! - GNU long names and long link names (`L` and `K` members).
//!
//! When writing, headers are ustar, and a PAX record is added
//! for whatever doesn't fit.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use chrono::{DateTime, NaiveDateTime};
use log::*;

use crate::arch::usize;
use crate::closer::{ReadLayer, WriteLayer};
use crate::fs::{self, FileInfo};
use crate::result::*;

const BLOCK_SIZE: u64 = 512;

/// The largest value an 11-digit octal field can hold
const MAX_OCTAL_11: u64 = 0o777_7777_7777;
/// The largest value a 7-digit octal field can hold
const MAX_OCTAL_7: u64 = 0o777_7777;

const NAME_SIZE: usize = 100;
const PREFIX_SIZE: usize = 155;

/// PAX and GNU metadata members are read into memory; cap them.
const MAX_METADATA_SIZE: u64 = 1 << 20;

/// The kind of a tar member, from its type flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarEntryType {
    Regular,
    Link,
    Symlink,
    Char,
    Block,
    Directory,
    Fifo,
    Other(u8),
}

impl TarEntryType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'0' | b'\0' | b'7' => TarEntryType::Regular,
            b'1' => TarEntryType::Link,
            b'2' => TarEntryType::Symlink,
            b'3' => TarEntryType::Char,
            b'4' => TarEntryType::Block,
            b'5' => TarEntryType::Directory,
            b'6' => TarEntryType::Fifo,
            other => TarEntryType::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TarEntryType::Regular => b'0',
            TarEntryType::Link => b'1',
            TarEntryType::Symlink => b'2',
            TarEntryType::Char => b'3',
            TarEntryType::Block => b'4',
            TarEntryType::Directory => b'5',
            TarEntryType::Fifo => b'6',
            TarEntryType::Other(b) => b,
        }
    }

    /// Members of these types have no payload, whatever their size says.
    fn is_header_only(self) -> bool {
        matches!(
            self,
            TarEntryType::Link
                | TarEntryType::Symlink
                | TarEntryType::Char
                | TarEntryType::Block
                | TarEntryType::Directory
                | TarEntryType::Fifo
        )
    }
}

/// Metadata of a single tar member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    /// Slash-separated path of the member
    pub name: String,

    pub kind: TarEntryType,

    /// Payload size in bytes
    pub size: u64,

    /// Permission bits
    pub mode: u32,

    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,

    pub modified: NaiveDateTime,

    /// Target of a hard or symbolic link
    pub link_name: String,
}

impl TarHeader {
    /// A header for a regular file of `size` bytes
    pub fn file<S: Into<String>>(name: S, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: TarEntryType::Regular,
            size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
            modified: fs::now(),
            link_name: String::new(),
        }
    }

    /// A header for a directory. Its name gets a trailing slash.
    pub fn dir<S: Into<String>>(name: S) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            kind: TarEntryType::Directory,
            mode: 0o755,
            ..Self::file(name, 0)
        }
    }

    /// Describes a file from its stat, stored as `name`.
    pub fn from_file_info<S: Into<String>>(name: S, info: &FileInfo) -> Self {
        let mut header = if info.is_dir() {
            Self::dir(name)
        } else {
            Self::file(name, info.size)
        };
        header.mode = info.perm();
        header.modified = info.modified;
        header
    }

    pub fn is_dir(&self) -> bool {
        self.kind == TarEntryType::Directory
    }

    /// Returns true if the name stays beneath the archive root:
    /// it's not empty, not absolute, and no `..` climbs above where it started.
    pub fn is_local(&self) -> bool {
        is_local(&self.name)
    }
}

fn is_local(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.contains('\\') {
        return false;
    }
    // C:foo and friends
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return false;
    }
    let mut depth = 0i64;
    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

fn block_padding(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

fn to_datetime(secs: i64) -> NaiveDateTime {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.naive_utc())
        .unwrap_or_default()
}

fn header_checksum(block: &[u8]) -> (u32, i64) {
    let mut unsigned = 0u32;
    let mut signed = 0i64;
    for (i, &b) in block.iter().enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += u32::from(b);
        signed += i64::from(b as i8);
    }
    (unsigned, signed)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parses PAX records: `"<length> <key>=<value>\n"`, where the length
/// counts the whole record, itself included.
fn parse_pax_records(mut data: &[u8]) -> FileResult<BTreeMap<String, String>> {
    const BAD_RECORD: FileError = FileError::InvalidArchive("Malformed PAX record");

    let mut records = BTreeMap::new();
    while !data.is_empty() {
        // Some writers pad the record block with NULs.
        if data[0] == 0 {
            break;
        }
        let space = memchr::memchr(b' ', data).ok_or(BAD_RECORD)?;
        let length: usize = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|l| l.parse().ok())
            .ok_or(BAD_RECORD)?;
        if length <= space + 1 || length > data.len() || data[length - 1] != b'\n' {
            return Err(BAD_RECORD);
        }
        let record = &data[space + 1..length - 1];
        let equals = memchr::memchr(b'=', record).ok_or(BAD_RECORD)?;
        let key = lossy(&record[..equals]);
        let value = lossy(&record[equals + 1..]);
        trace!("PAX record {}={}", key, value);
        records.insert(key, value);
        data = &data[length..];
    }
    Ok(records)
}

fn format_pax_record(key: &str, value: &str) -> String {
    // " " + "=" + "\n"
    let base = key.len() + value.len() + 3;
    let mut total = base + 1;
    loop {
        let with_digits = base + total.to_string().len();
        if with_digits == total {
            break;
        }
        total = with_digits;
    }
    format!("{} {}={}\n", total, key, value)
}

fn apply_pax(header: &mut TarHeader, records: &BTreeMap<String, String>) -> FileResult<()> {
    const BAD_VALUE: FileError = FileError::InvalidArchive("Malformed PAX value");

    for (key, value) in records {
        match key.as_str() {
            "path" => header.name = value.clone(),
            "linkpath" => header.link_name = value.clone(),
            "uname" => header.uname = value.clone(),
            "gname" => header.gname = value.clone(),
            "size" => header.size = value.parse().map_err(|_| BAD_VALUE)?,
            "uid" => header.uid = value.parse().map_err(|_| BAD_VALUE)?,
            "gid" => header.gid = value.parse().map_err(|_| BAD_VALUE)?,
            "mtime" => {
                // Seconds, possibly with a fractional part we don't keep
                let whole = value.split('.').next().unwrap_or_default();
                header.modified = to_datetime(whole.parse().map_err(|_| BAD_VALUE)?);
            }
            other => trace!("Ignoring PAX record {}", other),
        }
    }
    Ok(())
}

fn decode_header(raw: &::tar::Header) -> FileResult<TarHeader> {
    let kind = TarEntryType::from_byte(raw.entry_type().as_byte());
    Ok(TarHeader {
        name: lossy(&raw.path_bytes()),
        kind,
        size: raw.size()?,
        mode: raw.mode()? & 0o7777,
        uid: raw.uid()?,
        gid: raw.gid()?,
        uname: raw.username_bytes().map(lossy).unwrap_or_default(),
        gname: raw.groupname_bytes().map(lossy).unwrap_or_default(),
        modified: to_datetime(raw.mtime()? as i64),
        link_name: raw
            .link_name_bytes()
            .map(|l| lossy(&l))
            .unwrap_or_default(),
    })
}

/// Splits a long name into a ustar prefix and name, at a slash.
fn split_ustar_path(name: &str) -> Option<(&str, &str)> {
    let bytes = name.as_bytes();
    let mut length = bytes.len();
    if length <= NAME_SIZE || !name.is_ascii() {
        return None;
    } else if length > PREFIX_SIZE + 1 {
        length = PREFIX_SIZE + 1;
    } else if bytes[length - 1] == b'/' {
        length -= 1;
    }
    let i = name[..length].rfind('/')?;
    let suffix_len = bytes.len() - i - 1;
    if i == 0 || suffix_len > NAME_SIZE || suffix_len == 0 || i > PREFIX_SIZE {
        return None;
    }
    Some((&name[..i], &name[i + 1..]))
}

fn ustar_fields(raw: &mut ::tar::Header) -> FileResult<&mut ::tar::UstarHeader> {
    raw.as_ustar_mut()
        .ok_or(FileError::InvalidArchive("Header isn't ustar"))
}

/// Encodes `header` as one ustar block,
/// preceded by a PAX member if anything didn't fit.
fn encode_header(header: &TarHeader) -> FileResult<Vec<u8>> {
    let mut pax = BTreeMap::new();
    let mut raw = ::tar::Header::new_ustar();

    let name = header.name.as_bytes();
    if name.len() <= NAME_SIZE {
        ustar_fields(&mut raw)?.name[..name.len()].copy_from_slice(name);
    } else if let Some((prefix, rest)) = split_ustar_path(&header.name) {
        let fields = ustar_fields(&mut raw)?;
        fields.prefix[..prefix.len()].copy_from_slice(prefix.as_bytes());
        fields.name[..rest.len()].copy_from_slice(rest.as_bytes());
    } else {
        pax.insert("path", header.name.clone());
        ustar_fields(&mut raw)?.name.copy_from_slice(&name[..NAME_SIZE]);
    }

    let link = header.link_name.as_bytes();
    if link.len() <= NAME_SIZE {
        ustar_fields(&mut raw)?.linkname[..link.len()].copy_from_slice(link);
    } else {
        pax.insert("linkpath", header.link_name.clone());
    }

    if header.size > MAX_OCTAL_11 {
        pax.insert("size", header.size.to_string());
        raw.set_size(0);
    } else {
        raw.set_size(header.size);
    }

    let mtime = header.modified.and_utc().timestamp();
    match u64::try_from(mtime) {
        Ok(m) if m <= MAX_OCTAL_11 => raw.set_mtime(m),
        _ => {
            pax.insert("mtime", mtime.to_string());
            raw.set_mtime(0);
        }
    }

    if header.uid > MAX_OCTAL_7 {
        pax.insert("uid", header.uid.to_string());
        raw.set_uid(0);
    } else {
        raw.set_uid(header.uid);
    }
    if header.gid > MAX_OCTAL_7 {
        pax.insert("gid", header.gid.to_string());
        raw.set_gid(0);
    } else {
        raw.set_gid(header.gid);
    }

    if raw.set_username(&header.uname).is_err() {
        pax.insert("uname", header.uname.clone());
    }
    if raw.set_groupname(&header.gname).is_err() {
        pax.insert("gname", header.gname.clone());
    }

    raw.set_mode(header.mode & 0o7777);
    raw.set_entry_type(::tar::EntryType::new(header.kind.as_byte()));
    raw.set_cksum();

    let mut out = Vec::with_capacity(BLOCK_SIZE as usize * 3);
    if !pax.is_empty() {
        let records: String = pax
            .iter()
            .map(|(key, value)| format_pax_record(key, value))
            .collect();
        trace!("Writing PAX records for {}: {:?}", header.name, pax);

        let mut pax_header = ::tar::Header::new_ustar();
        let base = header.name.rsplit('/').next().unwrap_or_default();
        let pax_name = format!("PaxHeaders.0/{}", base);
        let pax_name = &pax_name.as_bytes()[..pax_name.len().min(NAME_SIZE)];
        ustar_fields(&mut pax_header)?.name[..pax_name.len()].copy_from_slice(pax_name);
        pax_header.set_size(records.len() as u64);
        pax_header.set_mode(0o644);
        pax_header.set_mtime(0);
        pax_header.set_entry_type(::tar::EntryType::new(b'x'));
        pax_header.set_cksum();

        out.extend_from_slice(pax_header.as_bytes());
        out.extend_from_slice(records.as_bytes());
        out.resize(out.len() + block_padding(records.len() as u64) as usize, 0);
    }
    out.extend_from_slice(raw.as_bytes());
    Ok(out)
}

/// Reads members out of a tar stream, one after another.
pub(crate) struct TarReader<'f> {
    inner: Box<dyn ReadLayer + 'f>,
    /// Unread payload bytes of the current member
    remaining: u64,
    /// Padding after the current member's payload
    padding: u64,
    in_dir: bool,
    globals: BTreeMap<String, String>,
    done: bool,
}

impl<'f> TarReader<'f> {
    pub fn new(inner: Box<dyn ReadLayer + 'f>) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            in_dir: false,
            globals: BTreeMap::new(),
            done: false,
        }
    }

    /// Skips whatever's left of the current member
    /// and reads the next header, or `None` at the end of the archive.
    pub fn next_header(&mut self) -> FileResult<Option<TarHeader>> {
        if self.done {
            return Ok(None);
        }
        self.skip(self.remaining + self.padding)?;
        self.remaining = 0;
        self.padding = 0;
        self.in_dir = false;

        let mut locals = BTreeMap::new();
        let mut long_name = None;
        let mut long_link = None;
        loop {
            let block = match self.read_block()? {
                Some(b) => b,
                None => {
                    debug!("Tar stream ended without an end-of-archive marker");
                    self.done = true;
                    return Ok(None);
                }
            };
            if block.iter().all(|&b| b == 0) {
                // Two zero blocks mark the end, but plenty of writers stop at one.
                let _ = self.read_block();
                trace!("End of tar archive");
                self.done = true;
                return Ok(None);
            }

            let raw = ::tar::Header::from_byte_slice(&block);
            let stored = raw.cksum()?;
            let (unsigned, signed) = header_checksum(&block);
            if stored != unsigned && i64::from(stored) != signed {
                return Err(FileError::InvalidArchive("Tar header checksum mismatch"));
            }

            let flag = raw.entry_type().as_byte();
            if matches!(flag, b'x' | b'g' | b'L' | b'K') {
                let size = raw.size()?;
                let data = self.read_metadata(size)?;
                match flag {
                    b'x' => locals.extend(parse_pax_records(&data)?),
                    b'g' => self.globals.extend(parse_pax_records(&data)?),
                    b'L' => long_name = Some(trim_nuls(&data)),
                    _ => long_link = Some(trim_nuls(&data)),
                }
                continue;
            }

            let mut header = decode_header(raw)?;
            apply_pax(&mut header, &self.globals)?;
            apply_pax(&mut header, &locals)?;
            if let Some(name) = long_name {
                header.name = name;
            }
            if let Some(link) = long_link {
                header.link_name = link;
            }
            trace!("{:?}", header);

            let payload = if header.kind.is_header_only() {
                0
            } else {
                header.size
            };
            self.remaining = payload;
            self.padding = block_padding(payload);
            self.in_dir = header.is_dir();
            return Ok(Some(header));
        }
    }

    /// Reads one block, or `None` on a clean EOF.
    fn read_block(&mut self) -> FileResult<Option<[u8; 512]>> {
        let mut block = [0u8; 512];
        let mut filled = 0;
        while filled < block.len() {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            512 => Ok(Some(block)),
            _ => Err(FileError::InvalidArchive("Truncated tar header")),
        }
    }

    fn read_metadata(&mut self, size: u64) -> FileResult<Vec<u8>> {
        if size > MAX_METADATA_SIZE {
            return Err(FileError::InvalidArchive("Oversized tar extended header"));
        }
        let mut data = vec![0; usize(size)?];
        self.inner.read_exact(&mut data)?;
        self.skip(block_padding(size))?;
        Ok(data)
    }

    fn skip(&mut self, n: u64) -> FileResult<()> {
        if n == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        if skipped != n {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

fn trim_nuls(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    lossy(&data[..end])
}

impl Read for TarReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.in_dir {
            return Err(FileError::IsDir.into());
        }
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl ReadLayer for TarReader<'_> {
    fn describe(&self) -> &'static str {
        "tar"
    }

    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
        Some(&mut *self.inner)
    }
}

/// Writes members into a tar stream, one after another.
pub(crate) struct TarWriter<'f> {
    inner: Box<dyn WriteLayer + 'f>,
    /// Payload bytes the current member still expects
    remaining: u64,
    padding: u64,
    in_dir: bool,
}

impl<'f> TarWriter<'f> {
    pub fn new(inner: Box<dyn WriteLayer + 'f>) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            in_dir: false,
        }
    }

    /// Finishes the current member and starts a new one.
    pub fn write_header(&mut self, header: &TarHeader) -> FileResult<()> {
        self.finish_member()?;
        trace!("{:?}", header);
        let encoded = encode_header(header)?;
        self.inner.write_all(&encoded)?;

        let payload = if header.kind.is_header_only() {
            0
        } else {
            header.size
        };
        self.remaining = payload;
        self.padding = block_padding(payload);
        self.in_dir = header.is_dir();
        Ok(())
    }

    /// Fails if the current member is a directory.
    pub fn check_writable(&self) -> FileResult<()> {
        if self.in_dir {
            Err(FileError::IsDir)
        } else {
            Ok(())
        }
    }

    fn finish_member(&mut self) -> FileResult<()> {
        if self.remaining > 0 {
            return Err(FileError::TarMissedBytes(self.remaining));
        }
        let padding = [0u8; 512];
        self.inner.write_all(&padding[..self.padding as usize])?;
        self.padding = 0;
        Ok(())
    }
}

impl Write for TarWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.in_dir {
            return Err(FileError::IsDir.into());
        }
        if self.remaining == 0 {
            return Err(FileError::TarWriteTooLong.into());
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.write(&buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteLayer for TarWriter<'_> {
    fn describe(&self) -> &'static str {
        "tar"
    }

    fn close_layer(&mut self) -> io::Result<()> {
        self.finish_member()?;
        self.inner.write_all(&[0u8; 1024])?;
        self.inner.flush()
    }

    fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer> {
        Some(&mut *self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// The bottom of a test pipeline: bytes in memory
    struct Bytes(io::Cursor<Vec<u8>>);

    impl Read for Bytes {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl ReadLayer for Bytes {
        fn describe(&self) -> &'static str {
            "bytes"
        }

        fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
            None
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

    fn reader(data: Vec<u8>) -> TarReader<'static> {
        TarReader::new(Box::new(Bytes(io::Cursor::new(data))))
    }

    fn write_archive(members: &[(TarHeader, &[u8])]) -> Vec<u8> {
        let sink = Sink::default();
        let mut writer = TarWriter::new(Box::new(sink.clone()));
        for (header, body) in members {
            writer.write_header(header).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.close_layer().unwrap();
        let out = sink.0.borrow().clone();
        out
    }

    #[test]
    fn round_trip_members() {
        let long_name = format!("{}/{}", "deep".repeat(40), "file.txt");
        let members = [
            (TarHeader::dir("dir"), &b""[..]),
            (TarHeader::file("dir/a.txt", 1), &b"A"[..]),
            (TarHeader::file("dir/b.txt", 2), &b"BB"[..]),
            (TarHeader::file(long_name.clone(), 3), &b"CCC"[..]),
        ];
        let archive = write_archive(&members);
        assert_eq!(archive.len() % 512, 0);

        let mut reader = reader(archive);
        let mut names = Vec::new();
        while let Some(header) = reader.next_header().unwrap() {
            let mut body = Vec::new();
            if header.is_dir() {
                let mut buf = [0u8; 4];
                let err: FileError = reader.read(&mut buf).unwrap_err().into();
                assert!(matches!(err, FileError::IsDir));
            } else {
                reader.read_to_end(&mut body).unwrap();
            }
            names.push((header.name, body));
        }
        assert_eq!(
            names,
            [
                ("dir/".to_owned(), b"".to_vec()),
                ("dir/a.txt".to_owned(), b"A".to_vec()),
                ("dir/b.txt".to_owned(), b"BB".to_vec()),
                (long_name, b"CCC".to_vec()),
            ]
        );
        // Stays at the end.
        assert!(reader.next_header().unwrap().is_none());
    }

    #[test]
    fn unread_payload_is_skipped() {
        let archive = write_archive(&[
            (TarHeader::file("one", 700), &[1u8; 700][..]),
            (TarHeader::file("two", 3), &b"two"[..]),
        ]);
        let mut reader = reader(archive);
        assert_eq!(reader.next_header().unwrap().unwrap().name, "one");
        let mut partial = [0u8; 10];
        reader.read_exact(&mut partial).unwrap();
        let two = reader.next_header().unwrap().unwrap();
        assert_eq!(two.name, "two");
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "two");
    }

    #[test]
    fn non_ascii_long_name_uses_pax() {
        let name = "ünïcödé/".repeat(20) + "end";
        let archive = write_archive(&[(TarHeader::file(name.clone(), 0), &b""[..])]);
        let header = reader(archive).next_header().unwrap().unwrap();
        assert_eq!(header.name, name);
    }

    #[test]
    fn write_too_long() {
        let mut writer = TarWriter::new(Box::new(Sink::default()));
        writer.write_header(&TarHeader::file("f", 2)).unwrap();
        assert_eq!(writer.write(b"abc").unwrap(), 2);
        let err: FileError = writer.write(b"c").unwrap_err().into();
        assert!(matches!(err, FileError::TarWriteTooLong));
    }

    #[test]
    fn missed_bytes() {
        let mut writer = TarWriter::new(Box::new(Sink::default()));
        writer.write_header(&TarHeader::file("f", 5)).unwrap();
        writer.write_all(b"ab").unwrap();
        assert!(matches!(
            writer.write_header(&TarHeader::file("g", 0)),
            Err(FileError::TarMissedBytes(3))
        ));
        let err: FileError = writer.close_layer().unwrap_err().into();
        assert!(matches!(err, FileError::TarMissedBytes(3)));
    }

    #[test]
    fn writes_to_directories_fail() {
        let mut writer = TarWriter::new(Box::new(Sink::default()));
        writer.write_header(&TarHeader::dir("d")).unwrap();
        let err: FileError = writer.write(b"x").unwrap_err().into();
        assert!(matches!(err, FileError::IsDir));
    }

    #[test]
    fn corrupt_checksum() {
        let mut archive = write_archive(&[(TarHeader::file("f", 1), &b"1"[..])]);
        archive[0] ^= 0x40;
        assert!(matches!(
            reader(archive).next_header(),
            Err(FileError::InvalidArchive(_))
        ));
    }

    #[test]
    fn pax_records() {
        let record = format_pax_record("path", "a/b");
        assert_eq!(record, "12 path=a/b\n");
        // Crossing into more length digits
        let long = "x".repeat(95);
        let record = format_pax_record("path", &long);
        assert_eq!(record.len(), 105);
        assert!(record.starts_with("105 "));

        let parsed = parse_pax_records(format!("{}{}", record, "16 uname=gopher\n").as_bytes())
            .unwrap();
        assert_eq!(parsed["path"], long);
        assert_eq!(parsed["uname"], "gopher");

        assert!(parse_pax_records(b"99 path=short\n").is_err());
    }

    #[test]
    fn local_names() {
        assert!(is_local("a/b/c"));
        assert!(is_local("a/../b"));
        assert!(is_local("./a"));
        assert!(!is_local(""));
        assert!(!is_local("/etc/passwd"));
        assert!(!is_local("../up"));
        assert!(!is_local("a/../../up"));
        assert!(!is_local("C:evil"));
    }

    #[test]
    fn ustar_split() {
        let name = format!("{}/{}", "p".repeat(120), "n".repeat(90));
        let (prefix, rest) = split_ustar_path(&name).unwrap();
        assert_eq!(prefix.len(), 120);
        assert_eq!(rest.len(), 90);
        assert!(split_ustar_path("short").is_none());
        assert!(split_ustar_path(&"x".repeat(150)).is_none());
    }
}
