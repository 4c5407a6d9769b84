//! Error types and the related `Result<T>`

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::tar::TarHeader;

pub type FileResult<T> = Result<T, FileError>;

#[derive(Debug, Error)]
pub enum FileError {
    /// An error from underlying I/O
    #[error("I/O Error: {0}")]
    Io(io::Error),

    /// A tar-only method was called on a reader or writer without tar framing.
    #[error("Not a tar file")]
    NotTar,

    /// A zip-only method was called on a reader or writer without zip framing.
    #[error("Not a zip file")]
    NotZip,

    /// Payload bytes were read from or written to a directory entry,
    /// or a directory was opened as a sink.
    #[error("Is a directory")]
    IsDir,

    /// Bytes were written to a zip writer before any entry was created.
    #[error("Zip write before create")]
    ZipWriteBeforeCreate,

    #[error("File reader is closed")]
    ReaderClosed,

    #[error("File writer is closed")]
    WriterClosed,

    /// The requested offset lies outside the file.
    #[error("Offset {offset} out of range for a file of {size} bytes")]
    OffsetOutOfRange { offset: i64, size: u64 },

    /// `peek()` asked for more bytes than the buffer holds.
    /// Never sticky.
    #[error("Buffer full")]
    BufferFull,

    #[error("Invalid use of unread_byte")]
    InvalidUnreadByte,

    #[error("Invalid use of unread_rune")]
    InvalidUnreadRune,

    /// A tar member's name escapes the archive root.
    /// The header is kept so callers can still inspect it.
    #[error("Insecure path in tar archive: {}", .0.name)]
    InsecurePath(Box<TarHeader>),

    /// The archive contained invalid data per its format.
    #[error("Invalid archive: {0}")]
    InvalidArchive(&'static str),

    /// The archive (or the requested operation) uses an unsupported feature
    #[error("Unsupported archive: {0}")]
    UnsupportedArchive(String),

    /// Decoding a UTF-8 name or comment failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// A file wasn't found at the provided path
    #[error("No file in the archive with the path {0}")]
    NoSuchFile(Utf8PathBuf),

    /// More bytes were written to a tar member than its header declared.
    #[error("Write too long for the current tar member")]
    TarWriteTooLong,

    /// A tar member was left before all of its declared bytes were written.
    #[error("Missed writing {0} bytes of the current tar member")]
    TarMissedBytes(u64),

    /// A digest didn't match the expected hex string.
    #[error("Checksum mismatch: want {want}, got {got}")]
    ChecksumMismatch { want: String, got: String },

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Size too large for address space")]
    InsufficientAddressSpace,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<FileError>,
    },

    /// Several errors from one operation, in the order they happened.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<FileError>),
}

fn join_errors(errors: &[FileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl FileError {
    /// Prepends some context to the error.
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        FileError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the error underneath any context.
    ///
    /// Sentinels are compared against this:
    /// `matches!(err.root(), FileError::ReaderClosed)`
    pub fn root(&self) -> &FileError {
        let mut current = self;
        while let FileError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Collapses a list of errors into a single one, if there are any.
    pub fn combine(mut errors: Vec<FileError>) -> Option<FileError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(FileError::Multiple(errors)),
        }
    }

    /// Copies the error so it can be reported more than once.
    ///
    /// `io::Error` can't be cloned, so I/O errors keep their kind and message.
    pub(crate) fn duplicate(&self) -> FileError {
        match self {
            FileError::Io(e) => FileError::Io(io::Error::new(e.kind(), e.to_string())),
            FileError::NotTar => FileError::NotTar,
            FileError::NotZip => FileError::NotZip,
            FileError::IsDir => FileError::IsDir,
            FileError::ZipWriteBeforeCreate => FileError::ZipWriteBeforeCreate,
            FileError::ReaderClosed => FileError::ReaderClosed,
            FileError::WriterClosed => FileError::WriterClosed,
            FileError::OffsetOutOfRange { offset, size } => FileError::OffsetOutOfRange {
                offset: *offset,
                size: *size,
            },
            FileError::BufferFull => FileError::BufferFull,
            FileError::InvalidUnreadByte => FileError::InvalidUnreadByte,
            FileError::InvalidUnreadRune => FileError::InvalidUnreadRune,
            FileError::InsecurePath(header) => FileError::InsecurePath(header.clone()),
            FileError::InvalidArchive(msg) => FileError::InvalidArchive(msg),
            FileError::UnsupportedArchive(msg) => FileError::UnsupportedArchive(msg.clone()),
            FileError::Encoding(e) => FileError::Encoding(*e),
            FileError::NoSuchFile(path) => FileError::NoSuchFile(path.clone()),
            FileError::TarWriteTooLong => FileError::TarWriteTooLong,
            FileError::TarMissedBytes(n) => FileError::TarMissedBytes(*n),
            FileError::ChecksumMismatch { want, got } => FileError::ChecksumMismatch {
                want: want.clone(),
                got: got.clone(),
            },
            FileError::InsufficientAddressSpace => FileError::InsufficientAddressSpace,
            FileError::Context { context, source } => FileError::Context {
                context: context.clone(),
                source: Box::new(source.duplicate()),
            },
            FileError::Multiple(errors) => {
                FileError::Multiple(errors.iter().map(FileError::duplicate).collect())
            }
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self.root() {
            FileError::Io(e) => e.kind(),
            FileError::NotTar | FileError::NotZip => io::ErrorKind::Unsupported,
            FileError::UnsupportedArchive(_) => io::ErrorKind::Unsupported,
            FileError::OffsetOutOfRange { .. } => io::ErrorKind::InvalidInput,
            FileError::InvalidUnreadByte | FileError::InvalidUnreadRune => {
                io::ErrorKind::InvalidInput
            }
            FileError::InvalidArchive(_) | FileError::Encoding(_) => io::ErrorKind::InvalidData,
            FileError::ChecksumMismatch { .. } | FileError::InsecurePath(_) => {
                io::ErrorKind::InvalidData
            }
            FileError::NoSuchFile(_) => io::ErrorKind::NotFound,
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for FileError {
    /// Unwraps errors we previously smuggled through an `io::Error`
    /// so that sentinels survive `std::io` plumbing.
    fn from(e: io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<FileError>()) {
            return FileError::Io(e);
        }
        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<FileError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => FileError::Io(io::Error::new(kind, other)),
            None => FileError::Io(kind.into()),
        }
    }
}

impl From<FileError> for io::Error {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Adds context to the error of a `Result`.
pub(crate) trait Context<T> {
    fn context<C: Into<String>>(self, context: C) -> FileResult<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> FileResult<T>;
}

impl<T, E: Into<FileError>> Context<T> for Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> FileResult<T> {
        self.map_err(|e| Into::<FileError>::into(e).context(context))
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> FileResult<T> {
        self.map_err(|e| Into::<FileError>::into(e).context(f()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinels_survive_io_round_trip() {
        let wrapped: io::Error = FileError::ReaderClosed.into();
        assert_eq!(wrapped.kind(), io::ErrorKind::Other);
        let back: FileError = wrapped.into();
        assert!(matches!(back, FileError::ReaderClosed));

        let wrapped: io::Error = FileError::NotTar.context("tar_next").into();
        let back: FileError = wrapped.into();
        assert!(matches!(back.root(), FileError::NotTar));
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let e: FileError = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        match e {
            FileError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected an I/O error, got {:?}", other),
        }
    }

    #[test]
    fn combine() {
        assert!(FileError::combine(vec![]).is_none());
        assert!(matches!(
            FileError::combine(vec![FileError::NotZip]),
            Some(FileError::NotZip)
        ));
        let both = FileError::combine(vec![FileError::NotZip, FileError::IsDir]).unwrap();
        assert_eq!(both.to_string(), "Not a zip file; Is a directory");
    }
}
