//! Builds the stack of layers between a file and a reader or writer,
//! working out the stack from the file's name.
//!
//! Read pipelines run `file -> [offset] -> [limit] -> [gzip|bzip2]* -> [tar|zip]`;
//! write pipelines run the other way, minus the windowing.

use std::io::{self, Read, Seek, SeekFrom, Write};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::*;

use crate::closer::{self, ReadLayer, WriteLayer};
use crate::fs::{FileInfo, ReadFile, WriteFile};
use crate::read::ReadOptions;
use crate::result::*;
use crate::tar::{TarReader, TarWriter};
use crate::write::WriteOptions;
use crate::zip::{ZipArchive, ZipWriter, ZipWriterOptions};

/// One transform inferred from a file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Gzip,
    Bzip2,
    Tar,
    Zip,
}

/// Works out the transforms for a file name, nearest the file first.
///
/// `.tgz` reads as `.tar.gz` and `.tbz`/`.tbz2` as `.tar.bz2`.
/// Parsing stops at the first unknown extension, or after `.tar` or `.zip`.
pub(crate) fn parse_extensions(name: &str) -> Vec<Step> {
    let mut name = name.to_lowercase();
    let mut steps = Vec::new();
    loop {
        let Some(dot) = name.rfind('.') else {
            return steps;
        };
        match &name[dot..] {
            ".gz" => steps.push(Step::Gzip),
            ".bz2" => steps.push(Step::Bzip2),
            ".tgz" => {
                name.replace_range(dot.., ".tar.gz");
                continue;
            }
            ".tbz" | ".tbz2" => {
                name.replace_range(dot.., ".tar.bz2");
                continue;
            }
            ".tar" => {
                steps.push(Step::Tar);
                return steps;
            }
            ".zip" => {
                steps.push(Step::Zip);
                return steps;
            }
            _ => return steps,
        }
        name.truncate(dot);
    }
}

/// Maps a DEFLATE level (-2 to 9) to flate2's.
/// -1 is the default; -2 (Huffman-only elsewhere) is the fastest flate2 has.
pub(crate) fn compression_level(level: i32) -> Compression {
    match level {
        -2 => Compression::fast(),
        -1 => Compression::default(),
        n => Compression::new(n.clamp(0, 9) as u32),
    }
}

/// The file at the bottom of a read pipeline
struct ReadFileLayer<'f> {
    file: Box<dyn ReadFile + 'f>,
    /// Close the file with the pipeline?
    owned: bool,
}

impl Read for ReadFileLayer<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ReadLayer for ReadFileLayer<'_> {
    fn describe(&self) -> &'static str {
        "file"
    }

    fn close_layer(&mut self) -> io::Result<()> {
        if self.owned {
            self.file.close()
        } else {
            Ok(())
        }
    }

    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
        None
    }

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        self.file.as_seek()
    }
}

/// Reports EOF after a fixed number of bytes
struct LimitLayer<'f> {
    inner: Box<dyn ReadLayer + 'f>,
    remaining: u64,
}

impl Read for LimitLayer<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl ReadLayer for LimitLayer<'_> {
    fn describe(&self) -> &'static str {
        "limit"
    }

    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
        Some(&mut *self.inner)
    }
}

struct GzipReadLayer<'f> {
    decoder: MultiGzDecoder<Box<dyn ReadLayer + 'f>>,
}

impl Read for GzipReadLayer<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(buf)
    }
}

impl ReadLayer for GzipReadLayer<'_> {
    fn describe(&self) -> &'static str {
        "gzip"
    }

    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
        Some(&mut **self.decoder.get_mut())
    }
}

struct Bzip2ReadLayer<'f> {
    decoder: MultiBzDecoder<Box<dyn ReadLayer + 'f>>,
}

impl Read for Bzip2ReadLayer<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(buf)
    }
}

impl ReadLayer for Bzip2ReadLayer<'_> {
    fn describe(&self) -> &'static str {
        "bzip2"
    }

    fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
        Some(&mut **self.decoder.get_mut())
    }
}

/// The file at the bottom of a write pipeline
struct WriteFileLayer<'f> {
    file: Box<dyn WriteFile + 'f>,
    owned: bool,
}

impl Write for WriteFileLayer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteLayer for WriteFileLayer<'_> {
    fn describe(&self) -> &'static str {
        "file"
    }

    fn close_layer(&mut self) -> io::Result<()> {
        if self.owned {
            self.file.close()
        } else {
            self.file.flush()
        }
    }

    fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer> {
        None
    }
}

struct GzipWriteLayer<'f> {
    encoder: GzEncoder<Box<dyn WriteLayer + 'f>>,
}

impl Write for GzipWriteLayer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl WriteLayer for GzipWriteLayer<'_> {
    fn describe(&self) -> &'static str {
        "gzip"
    }

    /// Writes the gzip trailer.
    fn close_layer(&mut self) -> io::Result<()> {
        self.encoder.try_finish()
    }

    fn inner_layer(&mut self) -> Option<&mut dyn WriteLayer> {
        Some(&mut **self.encoder.get_mut())
    }
}

/// The top of a read pipeline
pub(crate) enum ReadStack<'f> {
    Stream(Box<dyn ReadLayer + 'f>),
    Tar(TarReader<'f>),
    Zip(ZipArchive<'f>),
}

impl ReadStack<'_> {
    pub fn top_mut(&mut self) -> &mut dyn ReadLayer {
        match self {
            ReadStack::Stream(layer) => &mut **layer,
            ReadStack::Tar(tar) => tar,
            ReadStack::Zip(zip) => zip,
        }
    }

    /// Names the layers, top first, for logs.
    pub fn describe(&mut self) -> String {
        let mut names = Vec::new();
        let mut current = Some(self.top_mut());
        while let Some(layer) = current {
            names.push(layer.describe());
            current = layer.inner_layer();
        }
        names.join(" -> ")
    }
}

impl Read for ReadStack<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.top_mut().read(buf)
    }
}

/// The top of a write pipeline
pub(crate) enum WriteStack<'f> {
    Stream(Box<dyn WriteLayer + 'f>),
    Tar(TarWriter<'f>),
    Zip(ZipWriter<'f>),
}

impl WriteStack<'_> {
    pub fn top_mut(&mut self) -> &mut dyn WriteLayer {
        match self {
            WriteStack::Stream(layer) => &mut **layer,
            WriteStack::Tar(tar) => tar,
            WriteStack::Zip(zip) => zip,
        }
    }
}

impl Write for WriteStack<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.top_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.top_mut().flush()
    }
}

/// Closes what's been built so far and returns `err`,
/// along with any errors closing turned up.
fn abandon_read(top: &mut dyn ReadLayer, err: FileError) -> FileError {
    let mut errors = vec![err];
    closer::close_read_layers(top, &mut errors);
    FileError::combine(errors).unwrap_or(FileError::ReaderClosed)
}

fn abandon_write(top: &mut dyn WriteLayer, err: FileError) -> FileError {
    let mut errors = vec![err];
    closer::close_write_layers(top, &mut errors);
    FileError::combine(errors).unwrap_or(FileError::WriterClosed)
}

/// Moves a fresh read pipeline to the start of its window.
///
/// Nothing is read before the offset is checked against the file's size.
fn apply_offset(layer: &mut dyn ReadLayer, offset: i64, size: u64) -> FileResult<u64> {
    if offset.unsigned_abs() > size {
        return Err(FileError::OffsetOutOfRange { offset, size });
    }
    let start = if offset >= 0 {
        offset as u64
    } else {
        size - offset.unsigned_abs()
    };
    if start == 0 {
        return Ok(0);
    }
    if let Some(seek) = layer.as_seek() {
        let target = if offset >= 0 {
            SeekFrom::Start(start)
        } else {
            SeekFrom::End(offset)
        };
        trace!("Seeking to {:?}", target);
        seek.seek(target)?;
        return Ok(start);
    }
    trace!("Discarding {} bytes", start);
    let skipped = io::copy(&mut layer.take(start), &mut io::sink())?;
    if skipped != start {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file ended after {} of {} offset bytes", skipped, start),
        )
        .into());
    }
    Ok(start)
}

/// Builds a read pipeline over `file`.
///
/// If anything fails, the layers built so far are closed
/// (including the file, if it's `owned`).
pub(crate) fn build_read<'f>(
    mut file: Box<dyn ReadFile + 'f>,
    owned: bool,
    options: &ReadOptions,
) -> FileResult<(ReadStack<'f>, FileInfo)> {
    let info = match file.stat() {
        Ok(info) => info,
        Err(e) => {
            let mut errors = vec![FileError::from(e).context("stat")];
            if owned {
                if let Err(close) = file.close() {
                    errors.push(FileError::from(close).context("closing file"));
                }
            }
            return Err(FileError::combine(errors).unwrap_or(FileError::ReaderClosed));
        }
    };
    let seekable = file.as_seek().is_some();
    let mut top: Box<dyn ReadLayer + 'f> = Box::new(ReadFileLayer { file, owned });

    let start = match apply_offset(&mut *top, options.offset, info.size) {
        Ok(start) => start,
        Err(e) => return Err(abandon_read(&mut *top, e)),
    };
    let mut window = info.size - start;
    if options.limit > 0 {
        window = window.min(options.limit);
        top = Box::new(LimitLayer {
            inner: top,
            remaining: options.limit,
        });
    }

    let steps = if options.raw {
        Vec::new()
    } else {
        parse_extensions(&info.name)
    };
    debug!("Reading {} through {:?}", info.name, steps);

    let mut decompressed = false;
    for step in steps {
        match step {
            Step::Gzip => {
                top = Box::new(GzipReadLayer {
                    decoder: MultiGzDecoder::new(top),
                });
                decompressed = true;
            }
            Step::Bzip2 => {
                top = Box::new(Bzip2ReadLayer {
                    decoder: MultiBzDecoder::new(top),
                });
                decompressed = true;
            }
            Step::Tar => return Ok((ReadStack::Tar(TarReader::new(top)), info)),
            Step::Zip => {
                let decompressors = options.zip_decompressors.clone();
                let mut archive = if seekable && !decompressed {
                    ZipArchive::seekable(top, start, window, decompressors)
                } else {
                    ZipArchive::in_memory(top, decompressors)
                };
                if let Err(e) = archive.load() {
                    return Err(abandon_read(&mut archive, e.context("reading zip directory")));
                }
                return Ok((ReadStack::Zip(archive), info));
            }
        }
    }
    Ok((ReadStack::Stream(top), info))
}

/// Builds a write pipeline over `file`.
pub(crate) fn build_write<'f>(
    file: Box<dyn WriteFile + 'f>,
    owned: bool,
    options: &WriteOptions,
) -> FileResult<WriteStack<'f>> {
    let stat = file.stat();
    let mut top: Box<dyn WriteLayer + 'f> = Box::new(WriteFileLayer { file, owned });
    let info = match stat {
        Ok(info) if info.is_dir() => return Err(abandon_write(&mut *top, FileError::IsDir)),
        Ok(info) => info,
        Err(e) => return Err(abandon_write(&mut *top, FileError::from(e).context("stat"))),
    };

    let steps = if options.raw {
        Vec::new()
    } else {
        parse_extensions(&info.name)
    };
    debug!("Writing {} through {:?}", info.name, steps);

    let level = compression_level(options.deflate_level);
    for step in steps {
        match step {
            Step::Gzip => {
                top = Box::new(GzipWriteLayer {
                    encoder: GzEncoder::new(top, level),
                });
            }
            Step::Bzip2 => {
                let e = FileError::UnsupportedArchive(format!(
                    "bzip2 is read-only (writing {})",
                    info.name
                ));
                return Err(abandon_write(&mut *top, e));
            }
            Step::Tar => return Ok(WriteStack::Tar(TarWriter::new(top))),
            Step::Zip => {
                let zip = ZipWriter::new(
                    top,
                    ZipWriterOptions {
                        offset: options.zip_offset,
                        comment: options.zip_comment.clone(),
                        level,
                        compressors: options.zip_compressors.clone(),
                    },
                );
                return Ok(WriteStack::Zip(zip));
            }
        }
    }
    Ok(WriteStack::Stream(top))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extensions() {
        use Step::*;
        assert!(parse_extensions("notes.txt").is_empty());
        assert!(parse_extensions("README").is_empty());
        assert_eq!(parse_extensions("logs.txt.gz"), [Gzip]);
        assert_eq!(parse_extensions("backup.TAR.GZ"), [Gzip, Tar]);
        assert_eq!(parse_extensions("backup.tgz"), [Gzip, Tar]);
        assert_eq!(parse_extensions("backup.tbz2"), [Bzip2, Tar]);
        assert_eq!(parse_extensions("bundle.zip.gz"), [Gzip, Zip]);
        assert_eq!(parse_extensions("twice.gz.gz"), [Gzip, Gzip]);
        // Nothing past the archive layer
        assert_eq!(parse_extensions("odd.gz.tar"), [Tar]);
        assert_eq!(parse_extensions(".gz"), [Gzip]);
    }

    #[test]
    fn levels() {
        assert_eq!(compression_level(-1).level(), Compression::default().level());
        assert_eq!(compression_level(-2).level(), 1);
        assert_eq!(compression_level(0).level(), 0);
        assert_eq!(compression_level(9).level(), 9);
    }

    #[test]
    fn windows_without_seeking() {
        struct Pipe(&'static [u8]);

        impl Read for Pipe {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(buf)
            }
        }

        impl ReadLayer for Pipe {
            fn describe(&self) -> &'static str {
                "pipe"
            }

            fn inner_layer(&mut self) -> Option<&mut dyn ReadLayer> {
                None
            }
        }

        let mut pipe = Pipe(b"0123456789");
        assert_eq!(apply_offset(&mut pipe, -3, 10).unwrap(), 7);
        assert_eq!(pipe.0, b"789");

        let mut pipe = Pipe(b"0123456789");
        assert_eq!(apply_offset(&mut pipe, 10, 10).unwrap(), 10);
        assert!(pipe.0.is_empty());

        let mut pipe = Pipe(b"0123456789");
        assert!(matches!(
            apply_offset(&mut pipe, -11, 10),
            Err(FileError::OffsetOutOfRange { offset: -11, size: 10 })
        ));
        assert_eq!(pipe.0.len(), 10);

        // The file is shorter than it claimed.
        let mut pipe = Pipe(b"0123");
        assert!(apply_offset(&mut pipe, 8, 10).is_err());
    }
}
