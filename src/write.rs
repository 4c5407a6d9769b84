//! Writing files through a pipeline.
//!
//! A [`Writer`] mirrors a [`Reader`](crate::Reader): the file's name picks
//! the pipeline, so writing to `logs.txt.gz` gzips,
//! `backup.tar` takes members through [`tar_write_header()`](Writer::tar_write_header),
//! and `bundle.zip` takes entries through [`zip_create()`](Writer::zip_create).
//!
//! ```no_run
//! # use fileio::*;
//! let file = OsFile::create("bundle.zip")?;
//! let mut writer = Writer::create(file, WriteOptions::default(), true)?;
//! writer.zip_create("hello.txt")?;
//! writer.println("Hello, world!")?;
//! writer.close()?;
//! # Ok::<(), FileError>(())
//! ```

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io::{self, Read, Write};

use log::*;
use thiserror::Error;

use crate::bufio::BufWriter;
use crate::closer::{self, Closer};
use crate::fs::{self, FileSystem, ReadFile, WriteFile, MODE_TYPE_MASK};
use crate::pipeline::{self, WriteStack};
use crate::result::*;
use crate::tar::TarHeader;
use crate::zip::{ZipCompressorFactory, ZipFile, ZipHeader, ZipWriter};

/// How to open a file for writing
#[derive(Clone)]
pub struct WriteOptions {
    /// Minimum buffer size; zero picks a default.
    pub buf_size: usize,

    /// Ignore the file's extensions: no compression or archive framing.
    pub raw: bool,

    /// DEFLATE level for gzip and zip, from -2 (fastest) to 9 (smallest).
    /// -1 is the default.
    pub deflate_level: i32,

    /// Where the zip archive starts in the file,
    /// if something else is written ahead of it.
    pub zip_offset: u64,

    /// Stored at the end of the zip's central directory. At most 65,535 bytes.
    pub zip_comment: String,

    /// Compressors for zip methods besides Store and Deflate, by method ID
    pub zip_compressors: HashMap<u16, ZipCompressorFactory>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            buf_size: 0,
            raw: false,
            deflate_level: -1,
            zip_offset: 0,
            zip_comment: String::new(),
            zip_compressors: HashMap::new(),
        }
    }
}

/// What the `must_*` methods panic with.
///
/// Catch it with [`std::panic::catch_unwind`] and downcast the payload
/// to get the error back.
#[derive(Debug, Error)]
#[error("write failed: {0}")]
pub struct WritePanic(pub FileError);

fn or_panic<T>(result: FileResult<T>) -> T {
    match result {
        Ok(t) => t,
        Err(e) => std::panic::panic_any(WritePanic(e)),
    }
}

/// A buffered writer into a file's pipeline
pub struct Writer<'f> {
    buf: BufWriter<WriteStack<'f>>,
    closer: Closer,
}

impl<'f> Writer<'f> {
    /// Opens `file` for writing.
    ///
    /// If `close_file` is set, the writer closes the file when it's closed
    /// (or if opening fails).
    ///
    /// # Panics
    ///
    /// If `options.deflate_level` is outside -2..=9
    /// or `options.zip_comment` is longer than 65,535 bytes.
    pub fn create<F: WriteFile + 'f>(
        file: F,
        options: WriteOptions,
        close_file: bool,
    ) -> FileResult<Self> {
        assert!(
            (-2..=9).contains(&options.deflate_level),
            "DEFLATE level {} isn't in -2..=9",
            options.deflate_level
        );
        assert!(
            options.zip_comment.len() <= u16::MAX as usize,
            "Zip comment is {} bytes; the limit is 65,535",
            options.zip_comment.len()
        );
        let stack = pipeline::build_write(Box::new(file), close_file, &options)?;
        Ok(Self {
            buf: BufWriter::with_capacity(options.buf_size, stack),
            closer: Closer::default(),
        })
    }

    /// Fails if writes can't go anywhere right now.
    fn check_writable(&self) -> FileResult<()> {
        if self.closer.closed() {
            return Err(FileError::WriterClosed);
        }
        match self.buf.get_ref() {
            WriteStack::Zip(zip) => zip.check_writable(),
            WriteStack::Tar(tar) => tar.check_writable(),
            WriteStack::Stream(_) => Ok(()),
        }
    }

    /// Writes all of `p` to the buffer, returning its length.
    pub fn write(&mut self, p: &[u8]) -> FileResult<usize> {
        self.check_writable()?;
        self.buf.write(p)
    }

    pub fn write_byte(&mut self, c: u8) -> FileResult<()> {
        self.check_writable()?;
        self.buf.write_byte(c)
    }

    /// Writes a character as UTF-8, returning how many bytes that took.
    pub fn write_rune(&mut self, c: char) -> FileResult<usize> {
        self.check_writable()?;
        self.buf.write_rune(c)
    }

    pub fn write_str(&mut self, s: &str) -> FileResult<usize> {
        self.write(s.as_bytes())
    }

    /// Copies everything from `r`, returning how many bytes were copied.
    pub fn read_from<R: Read + ?Sized>(&mut self, r: &mut R) -> FileResult<u64> {
        self.check_writable()?;
        self.buf.read_from(r)
    }

    /// Writes formatted text: `writer.printf(format_args!("{} of {}", i, n))`
    pub fn printf(&mut self, args: fmt::Arguments) -> FileResult<usize> {
        match args.as_str() {
            Some(s) => self.write_str(s),
            None => self.write_str(&args.to_string()),
        }
    }

    pub fn print<D: Display>(&mut self, value: D) -> FileResult<usize> {
        self.printf(format_args!("{}", value))
    }

    pub fn println<D: Display>(&mut self, value: D) -> FileResult<usize> {
        self.printf(format_args!("{}\n", value))
    }

    /// Writes buffered bytes down the pipeline.
    /// With nothing buffered, this succeeds, even after closing.
    pub fn flush(&mut self) -> FileResult<()> {
        if self.buf.buffered() == 0 {
            return Ok(());
        }
        if self.closer.closed() {
            return Err(FileError::WriterClosed);
        }
        self.buf.flush()
    }

    /// Bytes waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.buf.buffered()
    }

    /// Room left in the buffer
    pub fn available(&self) -> usize {
        self.buf.available()
    }

    /// The size of the buffer
    pub fn size(&self) -> usize {
        self.buf.size()
    }

    /// Flushes, then closes every layer of the pipeline
    /// (writing archive directories and compression trailers)
    /// and the file, if we own it. Closing again does nothing.
    pub fn close(&mut self) -> FileResult<()> {
        let buf = &mut self.buf;
        let result = self.closer.close(|errors| {
            if let Err(e) = buf.flush() {
                errors.push(e.context("flushing"));
            }
            closer::close_write_layers(buf.get_mut().top_mut(), errors);
        });
        self.buf.poison(FileError::WriterClosed);
        trace!("Closed writer");
        result
    }

    pub fn closed(&self) -> bool {
        self.closer.closed()
    }

    pub fn must_write(&mut self, p: &[u8]) -> usize {
        or_panic(self.write(p))
    }

    pub fn must_write_byte(&mut self, c: u8) {
        or_panic(self.write_byte(c))
    }

    pub fn must_write_rune(&mut self, c: char) -> usize {
        or_panic(self.write_rune(c))
    }

    pub fn must_write_str(&mut self, s: &str) -> usize {
        or_panic(self.write_str(s))
    }

    pub fn must_read_from<R: Read + ?Sized>(&mut self, r: &mut R) -> u64 {
        or_panic(self.read_from(r))
    }

    pub fn must_printf(&mut self, args: fmt::Arguments) -> usize {
        or_panic(self.printf(args))
    }

    pub fn must_print<D: Display>(&mut self, value: D) -> usize {
        or_panic(self.print(value))
    }

    pub fn must_println<D: Display>(&mut self, value: D) -> usize {
        or_panic(self.println(value))
    }

    pub fn must_flush(&mut self) {
        or_panic(self.flush())
    }

    pub fn tar_enabled(&self) -> bool {
        matches!(self.buf.get_ref(), WriteStack::Tar(_))
    }

    /// Starts a new tar member. Exactly `header.size` bytes should follow
    /// (none for directories).
    pub fn tar_write_header(&mut self, header: &TarHeader) -> FileResult<()> {
        if !self.tar_enabled() {
            return Err(FileError::NotTar);
        }
        if self.closer.closed() {
            return Err(FileError::WriterClosed);
        }
        self.flush()?;
        match self.buf.get_mut() {
            WriteStack::Tar(tar) => tar.write_header(header),
            _ => Err(FileError::NotTar),
        }
    }

    /// Writes every directory and regular file of `fsys` as a tar member.
    /// Anything else (symlinks, devices...) is skipped.
    pub fn tar_add_fs(&mut self, fsys: &dyn FileSystem) -> FileResult<()> {
        if !self.tar_enabled() {
            return Err(FileError::NotTar);
        }
        fs::walk_fs(fsys, ".", &mut |name: &str, info: &fs::FileInfo| {
            if info.is_dir() {
                return self.tar_write_header(&TarHeader::from_file_info(name, info));
            }
            if !info.is_file() {
                warn!("Skipping {} (mode {:o})", name, info.mode & MODE_TYPE_MASK);
                return Ok(());
            }
            let mut file = fsys.open(name).with_context(|| format!("opening {}", name))?;
            let copied = self
                .tar_write_header(&TarHeader::from_file_info(name, info))
                .and_then(|()| self.read_from(&mut *file).map(drop));
            close_copied(copied, &mut *file, name)
        })
    }

    pub fn zip_enabled(&self) -> bool {
        matches!(self.buf.get_ref(), WriteStack::Zip(_))
    }

    /// Flushes what's buffered into the current entry
    /// and returns the zip writer.
    fn zip(&mut self) -> FileResult<&mut ZipWriter<'f>> {
        if !self.zip_enabled() {
            return Err(FileError::NotZip);
        }
        if self.closer.closed() {
            return Err(FileError::WriterClosed);
        }
        self.flush()?;
        match self.buf.get_mut() {
            WriteStack::Zip(zip) => Ok(zip),
            _ => Err(FileError::NotZip),
        }
    }

    /// Starts a new deflated entry (or a directory, if `name` ends in a slash)
    /// modified now.
    pub fn zip_create(&mut self, name: &str) -> FileResult<()> {
        self.zip_create_header(ZipHeader::new(name))
    }

    /// Starts a new entry described by `header`.
    /// Its CRC and sizes are filled in as it's written.
    pub fn zip_create_header(&mut self, header: ZipHeader) -> FileResult<()> {
        self.zip()?.create(header)
    }

    /// Starts a new entry whose (already compressed) bytes are written as-is.
    /// `header` must carry their CRC and sizes.
    pub fn zip_create_raw(&mut self, header: ZipHeader) -> FileResult<()> {
        self.zip()?.create_raw(header)
    }

    /// Copies an entry from another archive without recompressing it.
    /// Writes fail until the next entry is created.
    pub fn zip_copy(&mut self, file: &ZipFile) -> FileResult<()> {
        self.zip()?.copy(file)
    }

    /// Adds every directory and regular file of `fsys` as a zip entry.
    /// Writes fail afterwards until the next entry is created.
    pub fn zip_add_fs(&mut self, fsys: &dyn FileSystem) -> FileResult<()> {
        self.zip()?;
        fs::walk_fs(fsys, ".", &mut |name: &str, info: &fs::FileInfo| {
            if info.is_dir() {
                return self.zip_create_header(ZipHeader::from_file_info(name, info));
            }
            if !info.is_file() {
                warn!("Skipping {} (mode {:o})", name, info.mode & MODE_TYPE_MASK);
                return Ok(());
            }
            let mut file = fsys.open(name).with_context(|| format!("opening {}", name))?;
            let copied = self
                .zip_create_header(ZipHeader::from_file_info(name, info))
                .and_then(|()| self.read_from(&mut *file).map(drop));
            close_copied(copied, &mut *file, name)
        })?;
        self.zip()?.finish_entry()
    }
}

/// Closes a file that was copied into an archive,
/// keeping the close error alongside any copy error.
fn close_copied<F: ReadFile + ?Sized>(
    copied: FileResult<()>,
    file: &mut F,
    name: &str,
) -> FileResult<()> {
    let closed = file.close().context(format!("closing {}", name));
    match (copied, closed) {
        (Ok(()), closed) => closed,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => Err(FileError::Multiple(vec![e, close])),
    }
}

impl Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Writer::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(Writer::flush(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::{MemFile, MemFs};
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    #[test]
    fn formatting() {
        let mut file = MemFile::empty("out.txt");
        let mut writer = Writer::create(&mut file, WriteOptions::default(), false).unwrap();
        writer.print(42).unwrap();
        writer.write_byte(b' ').unwrap();
        writer.write_rune('π').unwrap();
        writer.printf(format_args!(" {}-{}", "a", 1)).unwrap();
        writer.println("").unwrap();
        assert_eq!(writer.buffered(), 10);
        writer.close().unwrap();
        drop(writer);
        assert_eq!(file.contents(), "42 π a-1\n".as_bytes());
    }

    #[test]
    fn flush_after_close() {
        let mut writer =
            Writer::create(MemFile::empty("out.txt"), WriteOptions::default(), true).unwrap();
        writer.write_str("pending").unwrap();
        writer.close().unwrap();
        assert!(writer.closed());
        assert_eq!(writer.buffered(), 0);
        writer.flush().unwrap();
        assert!(matches!(writer.write(b"x"), Err(FileError::WriterClosed)));
        assert!(matches!(writer.write_byte(b'x'), Err(FileError::WriterClosed)));
        writer.close().unwrap();
    }

    #[test]
    fn must_methods_panic_with_the_error() {
        let mut writer =
            Writer::create(MemFile::empty("out.zip"), WriteOptions::default(), true).unwrap();
        let payload = catch_unwind(AssertUnwindSafe(|| writer.must_write(b"early"))).unwrap_err();
        let panic = payload.downcast_ref::<WritePanic>().unwrap();
        assert!(matches!(panic.0, FileError::ZipWriteBeforeCreate));

        writer.zip_create("fine.txt").unwrap();
        assert_eq!(writer.must_write_str("ok"), 2);
        writer.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "DEFLATE level")]
    fn bad_deflate_level() {
        let options = WriteOptions {
            deflate_level: 10,
            ..Default::default()
        };
        let _ = Writer::create(MemFile::empty("out.gz"), options, true);
    }

    #[test]
    fn zip_states() {
        let mut writer =
            Writer::create(MemFile::empty("out.zip"), WriteOptions::default(), true).unwrap();
        assert!(writer.zip_enabled());
        assert!(matches!(
            writer.tar_write_header(&TarHeader::file("x", 0)),
            Err(FileError::NotTar)
        ));
        assert!(matches!(
            writer.write(b"x"),
            Err(FileError::ZipWriteBeforeCreate)
        ));
        writer.zip_create("dir/").unwrap();
        assert!(matches!(writer.write(b"x"), Err(FileError::IsDir)));
        writer.zip_create("dir/file").unwrap();
        writer.write_str("contents").unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.zip_create("late"),
            Err(FileError::WriterClosed)
        ));
    }

    #[test]
    fn raw_zip_directories() {
        let mut writer =
            Writer::create(MemFile::empty("out.zip"), WriteOptions::default(), true).unwrap();
        writer.zip_create_raw(ZipHeader::new("d/")).unwrap();
        assert!(matches!(writer.write(b"x"), Err(FileError::IsDir)));
        assert_eq!(writer.buffered(), 0);
        writer.close().unwrap();
    }

    #[test]
    fn short_writes_fail() {
        let mut writer =
            Writer::create(MemFile::empty("out.tar"), WriteOptions::default(), true).unwrap();
        writer.tar_write_header(&TarHeader::file("a", 10)).unwrap();
        let err = writer.write(&[b'x'; 10_000]).unwrap_err();
        assert!(matches!(err.root(), FileError::TarWriteTooLong));
        // It sticks.
        assert!(matches!(
            writer.write(b"more").unwrap_err().root(),
            FileError::TarWriteTooLong
        ));
        assert!(writer.close().is_err());

        let mut writer =
            Writer::create(MemFile::empty("out.tar"), WriteOptions::default(), true).unwrap();
        writer.tar_write_header(&TarHeader::file("a", 10)).unwrap();
        let payload =
            catch_unwind(AssertUnwindSafe(|| writer.must_write(&[b'x'; 10_000]))).unwrap_err();
        let panic = payload.downcast_ref::<WritePanic>().unwrap();
        assert!(matches!(panic.0.root(), FileError::TarWriteTooLong));
    }

    /// Opens files from a `MemFs` that fail to close, counting the attempts.
    struct Stubborn {
        tree: MemFs,
        closes: Rc<Cell<u32>>,
    }

    struct StubbornFile<'a> {
        file: Box<dyn ReadFile + 'a>,
        closes: Rc<Cell<u32>>,
    }

    impl Read for StubbornFile<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.file.read(buf)
        }
    }

    impl ReadFile for StubbornFile<'_> {
        fn stat(&self) -> io::Result<fs::FileInfo> {
            self.file.stat()
        }

        fn close(&mut self) -> io::Result<()> {
            self.closes.set(self.closes.get() + 1);
            Err(io::Error::new(io::ErrorKind::Other, "stuck open"))
        }
    }

    impl FileSystem for Stubborn {
        fn open(&self, name: &str) -> io::Result<Box<dyn ReadFile + '_>> {
            Ok(Box::new(StubbornFile {
                file: self.tree.open(name)?,
                closes: self.closes.clone(),
            }))
        }

        fn read_dir(&self, name: &str) -> io::Result<Vec<fs::FileInfo>> {
            self.tree.read_dir(name)
        }
    }

    #[test]
    fn added_files_are_closed() {
        let mut tree = MemFs::new();
        tree.insert_file("dir/a.txt", "A");
        let fsys = Stubborn {
            tree,
            closes: Rc::default(),
        };

        let mut writer =
            Writer::create(MemFile::empty("out.tar"), WriteOptions::default(), true).unwrap();
        let err = writer.tar_add_fs(&fsys).unwrap_err();
        assert!(err.to_string().contains("closing dir/a.txt"), "{}", err);
        assert_eq!(fsys.closes.get(), 1);

        let mut writer =
            Writer::create(MemFile::empty("out.zip"), WriteOptions::default(), true).unwrap();
        let err = writer.zip_add_fs(&fsys).unwrap_err();
        assert!(err.to_string().contains("stuck open"), "{}", err);
        assert_eq!(fsys.closes.get(), 2);
    }

    #[test]
    fn bzip2_is_read_only() {
        let mut file = MemFile::empty("out.bz2");
        let result = Writer::create(&mut file, WriteOptions::default(), false);
        assert!(matches!(result, Err(FileError::UnsupportedArchive(_))));
    }
}
