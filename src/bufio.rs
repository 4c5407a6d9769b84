//! Resettable buffered reading and writing.
//!
//! `std::io::BufReader` can't push bytes back, peek further than one
//! `fill_buf()`, or forget its buffer without being rebuilt,
//! all of which the reader needs when it moves between archive members.
//! These keep one fixed-size buffer and a sticky error:
//! once the stream underneath fails, every later call reports that failure.

use std::io::{self, Read, Write};

use memchr::memchr;

use crate::result::*;

pub const DEFAULT_BUF_SIZE: usize = 4096;
const MIN_BUF_SIZE: usize = 16;

/// Bytes in the longest UTF-8 sequence
const UTF_MAX: usize = 4;

/// Picks a buffer size: zero means the default, and there's a small floor.
pub(crate) fn buffer_size(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_BUF_SIZE,
        n => n.max(MIN_BUF_SIZE),
    }
}

/// Expected length of a UTF-8 sequence from its first byte,
/// or zero if it can't start one.
fn utf8_width(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 0,
    }
}

/// Returns true if `p` starts with enough bytes to decode a rune
/// (or to know that it's invalid).
fn full_rune(p: &[u8]) -> bool {
    let Some(&first) = p.first() else {
        return false;
    };
    let width = utf8_width(first);
    if width == 0 || p.len() >= width {
        return true;
    }
    // A bad continuation byte already makes it decodable (as an error).
    p[1..].iter().any(|b| !(0x80..=0xBF).contains(b))
}

/// Decodes the first rune of `p`.
/// Invalid or truncated sequences become U+FFFD with a width of one byte.
pub(crate) fn decode_rune(p: &[u8]) -> (char, usize) {
    let first = p[0];
    if first < 0x80 {
        return (first as char, 1);
    }
    let width = utf8_width(first);
    if width == 0 || p.len() < width {
        return (char::REPLACEMENT_CHARACTER, 1);
    }
    match std::str::from_utf8(&p[..width])
        .ok()
        .and_then(|s| s.chars().next())
    {
        Some(c) => (c, width),
        None => (char::REPLACEMENT_CHARACTER, 1),
    }
}

/// How `read_slice()` stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceEnd {
    /// Found the delimiter (it's included)
    Delimiter,
    /// The buffer filled up first
    Full,
    /// Hit EOF (or a sticky error, which the next call reports)
    End,
}

pub(crate) struct BufReader<R> {
    inner: R,
    buf: Box<[u8]>,
    /// Read position
    r: usize,
    /// Write position
    w: usize,
    err: Option<FileError>,
    /// Set when the latest `fill()` saw EOF
    eof: bool,
    last_byte: Option<u8>,
    last_rune_size: Option<usize>,
}

impl<R: Read> BufReader<R> {
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; buffer_size(capacity)].into_boxed_slice(),
            r: 0,
            w: 0,
            err: None,
            eof: false,
            last_byte: None,
            last_rune_size: None,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn buffered(&self) -> usize {
        self.w - self.r
    }

    /// Throws away buffered bytes and any recorded error,
    /// so that reading starts fresh from the stream's current position.
    pub fn reset(&mut self) {
        self.r = 0;
        self.w = 0;
        self.err = None;
        self.eof = false;
        self.last_byte = None;
        self.last_rune_size = None;
    }

    /// Records an error that all later calls will return,
    /// even if bytes remain in the buffer.
    pub fn poison(&mut self, err: FileError) {
        self.r = 0;
        self.w = 0;
        self.err = Some(err);
    }

    fn sticky(&self) -> Option<FileError> {
        self.err.as_ref().map(FileError::duplicate)
    }

    /// Reads a new chunk into the buffer, sliding existing data to the front.
    fn fill(&mut self) {
        self.eof = false;
        if self.r > 0 {
            self.buf.copy_within(self.r..self.w, 0);
            self.w -= self.r;
            self.r = 0;
        }
        if self.w >= self.buf.len() {
            return;
        }
        loop {
            match self.inner.read(&mut self.buf[self.w..]) {
                Ok(0) => {
                    self.eof = true;
                    return;
                }
                Ok(n) => {
                    self.w += n;
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.err = Some(e.into());
                    return;
                }
            }
        }
    }

    fn record_last(&mut self, end: usize) {
        if end > 0 {
            self.last_byte = Some(self.buf[end - 1]);
        }
        self.last_rune_size = None;
    }

    pub fn read(&mut self, p: &mut [u8]) -> FileResult<usize> {
        if let Some(err) = self.sticky() {
            if self.buffered() == 0 {
                return Err(err);
            }
        }
        if p.is_empty() {
            return Ok(0);
        }
        if self.r == self.w {
            if p.len() >= self.buf.len() {
                // Large read, empty buffer: skip the copy.
                let n = loop {
                    match self.inner.read(p) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let err: FileError = e.into();
                            self.err = Some(err.duplicate());
                            return Err(err);
                        }
                    }
                };
                if n > 0 {
                    self.last_byte = Some(p[n - 1]);
                    self.last_rune_size = None;
                }
                return Ok(n);
            }
            self.r = 0;
            self.w = 0;
            self.fill();
            if self.r == self.w {
                return match self.sticky() {
                    Some(err) => Err(err),
                    None => Ok(0),
                };
            }
        }
        let n = p.len().min(self.w - self.r);
        p[..n].copy_from_slice(&self.buf[self.r..self.r + n]);
        self.r += n;
        self.record_last(self.r);
        Ok(n)
    }

    pub fn read_byte(&mut self) -> FileResult<Option<u8>> {
        self.last_rune_size = None;
        while self.r == self.w {
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            self.fill();
            if self.r == self.w && self.eof {
                return Ok(None);
            }
        }
        let c = self.buf[self.r];
        self.r += 1;
        self.last_byte = Some(c);
        Ok(Some(c))
    }

    pub fn unread_byte(&mut self) -> FileResult<()> {
        let last = match self.last_byte {
            Some(b) if !(self.r == 0 && self.w > 0) => b,
            _ => return Err(FileError::InvalidUnreadByte),
        };
        if self.r > 0 {
            self.r -= 1;
        } else {
            // The buffer is empty; put the byte back at the front.
            self.w = 1;
        }
        self.buf[self.r] = last;
        self.last_byte = None;
        self.last_rune_size = None;
        Ok(())
    }

    /// Reads a single UTF-8 encoded character and its size in bytes.
    pub fn read_rune(&mut self) -> FileResult<Option<(char, usize)>> {
        while self.r + UTF_MAX > self.w
            && !full_rune(&self.buf[self.r..self.w])
            && self.err.is_none()
            && self.w - self.r < self.buf.len()
        {
            self.fill();
            if self.eof {
                break;
            }
        }
        self.last_rune_size = None;
        if self.r == self.w {
            return match self.sticky() {
                Some(err) => Err(err),
                None => Ok(None),
            };
        }
        let (c, size) = decode_rune(&self.buf[self.r..self.w]);
        self.r += size;
        self.last_byte = Some(self.buf[self.r - 1]);
        self.last_rune_size = Some(size);
        Ok(Some((c, size)))
    }

    pub fn unread_rune(&mut self) -> FileResult<()> {
        match self.last_rune_size {
            Some(size) if self.r >= size => {
                self.r -= size;
                self.last_byte = None;
                self.last_rune_size = None;
                Ok(())
            }
            _ => Err(FileError::InvalidUnreadRune),
        }
    }

    /// Returns the next `n` bytes without advancing.
    ///
    /// The slice is shorter than `n` only at EOF.
    /// Asking for more than the buffer holds is [`FileError::BufferFull`],
    /// which isn't recorded as the sticky error.
    pub fn peek(&mut self, n: usize) -> FileResult<&[u8]> {
        self.last_byte = None;
        self.last_rune_size = None;
        if n > self.buf.len() {
            return Err(FileError::BufferFull);
        }
        while self.w - self.r < n && self.err.is_none() {
            self.fill();
            if self.eof {
                break;
            }
        }
        let available = self.w - self.r;
        if available < n {
            if let Some(err) = self.sticky() {
                return Err(err);
            }
        }
        Ok(&self.buf[self.r..self.r + available.min(n)])
    }

    /// Skips the next `n` bytes, returning how many were skipped.
    /// That's fewer than `n` only at EOF.
    pub fn discard(&mut self, n: usize) -> FileResult<usize> {
        self.last_byte = None;
        self.last_rune_size = None;
        let mut remaining = n;
        loop {
            let skip = self.buffered().min(remaining);
            self.r += skip;
            remaining -= skip;
            if remaining == 0 {
                return Ok(n);
            }
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            self.fill();
            if self.r == self.w && self.eof {
                return Ok(n - remaining);
            }
        }
    }

    /// Reads until `delim`, returning the range of the buffer that was consumed.
    pub fn read_slice(&mut self, delim: u8) -> FileResult<(usize, usize, SliceEnd)> {
        self.eof = false;
        let mut searched = 0;
        loop {
            if let Some(i) = memchr(delim, &self.buf[self.r + searched..self.w]) {
                let (start, end) = (self.r, self.r + searched + i + 1);
                self.r = end;
                self.record_last(end);
                return Ok((start, end, SliceEnd::Delimiter));
            }

            if self.err.is_some() || self.eof {
                let (start, end) = (self.r, self.w);
                if start == end {
                    if let Some(err) = self.sticky() {
                        return Err(err);
                    }
                }
                self.r = end;
                self.record_last(end);
                return Ok((start, end, SliceEnd::End));
            }

            if self.buffered() >= self.buf.len() {
                let (start, end) = (self.r, self.w);
                self.r = end;
                self.record_last(end);
                return Ok((start, end, SliceEnd::Full));
            }

            searched = self.w - self.r;
            self.fill();
        }
    }

    /// Returns a line without its `\n` or `\r\n`,
    /// and whether it continues past the buffer (in which case
    /// the rest comes from the following calls).
    ///
    /// Data and an error are never returned together:
    /// an error hit after some bytes of a line is reported by the next call.
    pub fn read_line(&mut self) -> FileResult<Option<(&[u8], bool)>> {
        let (start, mut end, how) = self.read_slice(b'\n')?;
        match how {
            SliceEnd::Full => {
                // Handle "\r\n" straddling the buffer.
                if self.buf[end - 1] == b'\r' {
                    self.r -= 1;
                    end -= 1;
                }
                Ok(Some((&self.buf[start..end], true)))
            }
            SliceEnd::End if start == end => Ok(None),
            SliceEnd::End | SliceEnd::Delimiter => {
                if self.buf[end - 1] == b'\n' {
                    end -= 1;
                    if end > start && self.buf[end - 1] == b'\r' {
                        end -= 1;
                    }
                }
                Ok(Some((&self.buf[start..end], false)))
            }
        }
    }

    /// Copies everything left to `w`, buffered bytes first.
    pub fn write_to<W: Write + ?Sized>(&mut self, w: &mut W) -> FileResult<u64> {
        self.last_byte = None;
        self.last_rune_size = None;
        let mut total = 0;
        loop {
            if self.r < self.w {
                w.write_all(&self.buf[self.r..self.w])?;
                total += (self.w - self.r) as u64;
                self.r = self.w;
            }
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            self.fill();
            if self.r == self.w && self.eof {
                return Ok(total);
            }
        }
    }

    pub fn fill_buf(&mut self) -> FileResult<&[u8]> {
        if self.r == self.w {
            if let Some(err) = self.sticky() {
                return Err(err);
            }
            self.fill();
            if self.r == self.w {
                if let Some(err) = self.sticky() {
                    return Err(err);
                }
            }
        }
        Ok(&self.buf[self.r..self.w])
    }

    pub fn consume(&mut self, amount: usize) {
        self.r = (self.r + amount).min(self.w);
        self.record_last(self.r);
    }
}

pub(crate) struct BufWriter<W> {
    inner: W,
    buf: Box<[u8]>,
    n: usize,
    err: Option<FileError>,
}

impl<W: Write> BufWriter<W> {
    pub fn with_capacity(capacity: usize, inner: W) -> Self {
        Self {
            inner,
            buf: vec![0; buffer_size(capacity)].into_boxed_slice(),
            n: 0,
            err: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn buffered(&self) -> usize {
        self.n
    }

    pub fn available(&self) -> usize {
        self.buf.len() - self.n
    }

    fn sticky(&self) -> Option<FileError> {
        self.err.as_ref().map(FileError::duplicate)
    }

    /// Records an error that all later calls will return.
    pub fn poison(&mut self, err: FileError) {
        self.n = 0;
        self.err = Some(err);
    }

    pub fn flush(&mut self) -> FileResult<()> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        let mut written = 0;
        while written < self.n {
            match self.inner.write(&self.buf[written..self.n]) {
                Ok(0) => {
                    self.fail(written, io::Error::from(io::ErrorKind::WriteZero).into());
                    return Err(self.sticky().unwrap_or(FileError::WriterClosed));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(written, e.into());
                    return Err(self.sticky().unwrap_or(FileError::WriterClosed));
                }
            }
        }
        self.n = 0;
        Ok(())
    }

    /// Keeps the unwritten part of the buffer and records the error.
    fn fail(&mut self, written: usize, err: FileError) {
        self.buf.copy_within(written..self.n, 0);
        self.n -= written;
        self.err = Some(err);
    }

    /// Writes all of `p`, returning its length.
    ///
    /// If anything below fails partway, the error is returned
    /// (and by every later call), whatever part of `p` got through.
    pub fn write(&mut self, mut p: &[u8]) -> FileResult<usize> {
        let mut total = 0;
        while p.len() > self.available() && self.err.is_none() {
            let n = if self.n == 0 {
                // Large write, empty buffer: write directly.
                match self.inner.write(p) {
                    Ok(0) => {
                        self.err = Some(io::Error::from(io::ErrorKind::WriteZero).into());
                        0
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                    Err(e) => {
                        self.err = Some(e.into());
                        0
                    }
                }
            } else {
                let n = self.available();
                self.buf[self.n..].copy_from_slice(&p[..n]);
                self.n += n;
                // The error (if any) is now sticky.
                let _ = self.flush();
                n
            };
            total += n;
            p = &p[n..];
        }
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        let n = p.len();
        self.buf[self.n..self.n + n].copy_from_slice(p);
        self.n += n;
        Ok(total + n)
    }

    pub fn write_byte(&mut self, c: u8) -> FileResult<()> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        if self.available() == 0 {
            self.flush()?;
        }
        self.buf[self.n] = c;
        self.n += 1;
        Ok(())
    }

    pub fn write_rune(&mut self, c: char) -> FileResult<usize> {
        let mut encoded = [0; UTF_MAX];
        let encoded = c.encode_utf8(&mut encoded);
        self.write(encoded.as_bytes())
    }

    /// Reads everything from `r` into the buffer, flushing as it fills.
    pub fn read_from<R: Read + ?Sized>(&mut self, r: &mut R) -> FileResult<u64> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        let mut total = 0;
        loop {
            if self.available() == 0 {
                self.flush()?;
            }
            match r.read(&mut self.buf[self.n..]) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    self.n += n;
                    total += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Hands out at most `chunk` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    /// Fails after handing out its data.
    struct Broken<'a>(&'a [u8]);

    impl Read for Broken<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "broken pipe dream"));
            }
            let n = buf.len().min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn bytes_and_unread() {
        let mut reader = BufReader::with_capacity(16, &b"ab"[..]);
        assert!(matches!(
            reader.unread_byte(),
            Err(FileError::InvalidUnreadByte)
        ));
        assert_eq!(reader.read_byte().unwrap(), Some(b'a'));
        reader.unread_byte().unwrap();
        assert!(matches!(
            reader.unread_byte(),
            Err(FileError::InvalidUnreadByte)
        ));
        assert_eq!(reader.read_byte().unwrap(), Some(b'a'));
        assert_eq!(reader.read_byte().unwrap(), Some(b'b'));
        assert_eq!(reader.read_byte().unwrap(), None);
        assert_eq!(reader.read_byte().unwrap(), None);
    }

    #[test]
    fn runes() {
        let text = "h\u{e9}\u{4f60}\u{1f600}";
        let mut data = text.as_bytes().to_vec();
        data.push(0xff);
        let mut reader = BufReader::with_capacity(
            16,
            Trickle {
                data: &data,
                chunk: 1,
            },
        );
        let mut sizes = Vec::new();
        while let Some((c, size)) = reader.read_rune().unwrap() {
            sizes.push((c, size));
        }
        assert_eq!(
            sizes,
            [
                ('h', 1),
                ('\u{e9}', 2),
                ('\u{4f60}', 3),
                ('\u{1f600}', 4),
                (char::REPLACEMENT_CHARACTER, 1)
            ]
        );
    }

    #[test]
    fn unread_rune() {
        let mut reader = BufReader::with_capacity(16, "\u{4f60}x".as_bytes());
        assert_eq!(reader.read_rune().unwrap(), Some(('\u{4f60}', 3)));
        reader.unread_rune().unwrap();
        assert!(matches!(
            reader.unread_rune(),
            Err(FileError::InvalidUnreadRune)
        ));
        assert_eq!(reader.read_rune().unwrap(), Some(('\u{4f60}', 3)));
        // Peeking forgets the last rune.
        reader.peek(1).unwrap();
        assert!(matches!(
            reader.unread_rune(),
            Err(FileError::InvalidUnreadRune)
        ));
    }

    #[test]
    fn lines() {
        let data = b"one\r\ntwo\n\nthree";
        let mut reader = BufReader::with_capacity(16, &data[..]);
        let mut lines = Vec::new();
        while let Some((line, more)) = reader.read_line().unwrap() {
            assert!(!more);
            lines.push(String::from_utf8(line.to_vec()).unwrap());
        }
        assert_eq!(lines, ["one", "two", "", "three"]);
    }

    #[test]
    fn long_lines_come_in_pieces() {
        let data = [b'x'; 40];
        let mut reader = BufReader::with_capacity(16, &data[..]);
        let mut pieces = Vec::new();
        while let Some((line, more)) = reader.read_line().unwrap() {
            pieces.push((line.len(), more));
        }
        assert_eq!(pieces, [(16, true), (16, true), (8, false)]);
    }

    #[test]
    fn crlf_straddling_the_buffer() {
        let mut data = vec![b'x'; 15];
        data.extend_from_slice(b"\r\nnext");
        let mut reader = BufReader::with_capacity(16, &data[..]);
        let (line, more) = reader.read_line().unwrap().unwrap();
        assert_eq!((line.len(), more), (15, true));
        let (line, more) = reader.read_line().unwrap().unwrap();
        assert_eq!((line, more), (&b""[..], false));
        let (line, more) = reader.read_line().unwrap().unwrap();
        assert_eq!((line, more), (&b"next"[..], false));
    }

    #[test]
    fn peek_past_the_buffer() {
        let mut reader = BufReader::with_capacity(16, &[7u8; 64][..]);
        assert!(matches!(reader.peek(17), Err(FileError::BufferFull)));
        // Not sticky:
        assert_eq!(reader.peek(16).unwrap(), &[7; 16]);
        assert_eq!(reader.read_byte().unwrap(), Some(7));
    }

    #[test]
    fn peek_at_eof_is_short() {
        let mut reader = BufReader::with_capacity(16, &b"abc"[..]);
        assert_eq!(reader.peek(5).unwrap(), b"abc");
        assert_eq!(reader.discard(5).unwrap(), 3);
    }

    #[test]
    fn errors_are_sticky() {
        let mut reader = BufReader::with_capacity(16, Broken(b"hi"));
        let mut buf = [0; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert!(matches!(reader.read(&mut buf), Err(FileError::Io(_))));
        assert!(matches!(reader.read_byte(), Err(FileError::Io(_))));
        assert!(matches!(reader.read_line(), Err(FileError::Io(_))));
        reader.reset();
        // Broken keeps failing, but reset() cleared the record of it.
        assert!(reader.err.is_none());
    }

    #[test]
    fn line_then_error() {
        let mut reader = BufReader::with_capacity(16, Broken(b"partial"));
        let (line, more) = reader.read_line().unwrap().unwrap();
        assert_eq!((line, more), (&b"partial"[..], false));
        assert!(reader.read_line().is_err());
    }

    #[test]
    fn write_to_drains_everything() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut reader = BufReader::with_capacity(16, &data[..]);
        assert_eq!(reader.read_byte().unwrap(), Some(0));
        let mut sink = Vec::new();
        assert_eq!(reader.write_to(&mut sink).unwrap(), 99);
        assert_eq!(sink, &data[1..]);
    }

    #[test]
    fn writer_buffers() {
        let mut writer = BufWriter::with_capacity(16, Vec::new());
        assert_eq!(writer.write(b"hello").unwrap(), 5);
        writer.write_byte(b' ').unwrap();
        assert_eq!(writer.write_rune('\u{4f60}').unwrap(), 3);
        assert_eq!(writer.buffered(), 9);
        assert_eq!(writer.available(), 7);
        assert!(writer.get_ref().is_empty());

        // Bigger than the buffer
        assert_eq!(writer.write(&[b'z'; 40]).unwrap(), 40);
        writer.flush().unwrap();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.get_ref().len(), 49);
        assert!(writer.get_ref().starts_with("hello \u{4f60}".as_bytes()));
    }

    #[test]
    fn writer_read_from() {
        let data = [3u8; 50];
        let mut writer = BufWriter::with_capacity(16, Vec::new());
        assert_eq!(writer.read_from(&mut &data[..]).unwrap(), 50);
        writer.flush().unwrap();
        assert_eq!(writer.get_ref(), &data);
    }

    #[test]
    fn writer_errors_are_sticky() {
        let mut storage = [0u8; 4];
        let mut writer = BufWriter::with_capacity(16, &mut storage[..]);
        assert!(writer.write(b"way too long for that").is_err());
        assert!(writer.flush().is_err());
        assert!(writer.write_byte(b'x').is_err());
        assert!(writer.flush().is_err());
        drop(writer);
        assert_eq!(&storage, b"way ");
    }
}
