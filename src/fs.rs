//! The minimal file and filesystem interfaces the pipeline runs on,
//! plus implementations for the OS and for memory.
//!
//! A readable file is a [`Read`] with a [`stat()`](ReadFile::stat),
//! an optional [`Seek`], and a [`close()`](ReadFile::close).
//! A writable file is the same thing pointed the other way.
//!
//! All of these are implemented for `&mut T` and `Box<T>`,
//! so a caller can hand a reader or writer a borrowed file
//! and keep ownership of it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::*;

/// `S_IFMT`: The file type bits of a mode
pub const MODE_TYPE_MASK: u32 = 0o170000;
/// `S_IFDIR`: The mode bits of a directory
pub const MODE_DIR: u32 = 0o040000;
/// `S_IFREG`: The mode bits of a regular file
pub const MODE_FILE: u32 = 0o100000;
/// `S_IFLNK`: The mode bits of a symbolic link
pub const MODE_SYMLINK: u32 = 0o120000;

/// What `stat()` reports about a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The base name of the file
    pub name: String,

    /// Size of the file in bytes
    pub size: u64,

    /// Unix mode: file type bits (see [`MODE_DIR`]) plus permissions
    pub mode: u32,

    /// The last time the file was modified
    pub modified: NaiveDateTime,
}

impl FileInfo {
    pub fn new_file<S: Into<String>>(name: S, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: MODE_FILE | 0o644,
            modified: now(),
        }
    }

    pub fn new_dir<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode: MODE_DIR | 0o755,
            modified: now(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIR
    }

    /// Returns true for regular files.
    /// A mode without type bits counts as a regular file.
    pub fn is_file(&self) -> bool {
        let kind = self.mode & MODE_TYPE_MASK;
        kind == MODE_FILE || kind == 0
    }

    /// Permission bits
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }
}

pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn from_system_time(time: SystemTime) -> NaiveDateTime {
    DateTime::<Utc>::from(time).naive_utc()
}

/// A file we can read from
pub trait ReadFile: Read {
    fn stat(&self) -> io::Result<FileInfo>;

    /// Releases the file.
    /// Only called when the reader was given ownership of it.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Returns the file as a [`Seek`] if it supports seeking.
    ///
    /// Without one, offsets are applied by discarding bytes
    /// and zip archives are read into memory.
    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        None
    }
}

/// A file we can write to
pub trait WriteFile: Write {
    fn stat(&self) -> io::Result<FileInfo>;

    /// Releases the file.
    /// Only called when the writer was given ownership of it.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Something that hands out readable files by name.
///
/// Names are slash-separated and relative to the root of the filesystem;
/// the root itself is `"."`.
pub trait FileSystem {
    fn open(&self, name: &str) -> io::Result<Box<dyn ReadFile + '_>>;

    /// Lists the entries of a directory.
    /// `FileInfo::name` holds each entry's base name.
    fn read_dir(&self, name: &str) -> io::Result<Vec<FileInfo>>;
}

impl<T: ReadFile + ?Sized> ReadFile for &mut T {
    fn stat(&self) -> io::Result<FileInfo> {
        (**self).stat()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        (**self).as_seek()
    }
}

impl<T: ReadFile + ?Sized> ReadFile for Box<T> {
    fn stat(&self) -> io::Result<FileInfo> {
        (**self).stat()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        (**self).as_seek()
    }
}

impl<T: WriteFile + ?Sized> WriteFile for &mut T {
    fn stat(&self) -> io::Result<FileInfo> {
        (**self).stat()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<T: WriteFile + ?Sized> WriteFile for Box<T> {
    fn stat(&self) -> io::Result<FileInfo> {
        (**self).stat()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<T: FileSystem + ?Sized> FileSystem for &T {
    fn open(&self, name: &str) -> io::Result<Box<dyn ReadFile + '_>> {
        (**self).open(name)
    }

    fn read_dir(&self, name: &str) -> io::Result<Vec<FileInfo>> {
        (**self).read_dir(name)
    }
}

fn closed_file() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "file already closed")
}

/// A file on disk
pub struct OsFile {
    path: Utf8PathBuf,
    file: Option<fs::File>,
}

impl OsFile {
    pub fn open<P: AsRef<Utf8Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = fs::File::open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Creates (or truncates) a file for writing.
    pub fn create<P: AsRef<Utf8Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = fs::File::create(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut fs::File> {
        self.file.as_mut().ok_or_else(closed_file)
    }
}

fn info_from_metadata(name: &str, metadata: &fs::Metadata) -> FileInfo {
    let file_type = if metadata.is_dir() {
        MODE_DIR
    } else if metadata.file_type().is_symlink() {
        MODE_SYMLINK
    } else {
        MODE_FILE
    };
    #[cfg(unix)]
    let perm = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let perm = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    FileInfo {
        name: name.to_owned(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        mode: file_type | perm,
        modified: metadata
            .modified()
            .map(from_system_time)
            .unwrap_or_else(|_| now()),
    }
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

impl ReadFile for OsFile {
    fn stat(&self) -> io::Result<FileInfo> {
        let file = self.file.as_ref().ok_or_else(closed_file)?;
        let name = self.path.file_name().unwrap_or(self.path.as_str());
        Ok(info_from_metadata(name, &file.metadata()?))
    }

    fn close(&mut self) -> io::Result<()> {
        trace!("Closing {}", self.path);
        self.file.take();
        Ok(())
    }

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        Some(self)
    }
}

impl WriteFile for OsFile {
    fn stat(&self) -> io::Result<FileInfo> {
        ReadFile::stat(self)
    }

    fn close(&mut self) -> io::Result<()> {
        trace!("Closing {}", self.path);
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

/// A file held in memory.
///
/// It's both readable and writable (and seekable),
/// so it can capture a writer's output and then be read back.
#[derive(Debug, Clone)]
pub struct MemFile {
    name: String,
    data: Cursor<Vec<u8>>,
    modified: NaiveDateTime,
}

impl MemFile {
    pub fn new<S: Into<String>>(name: S, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Cursor::new(data),
            modified: now(),
        }
    }

    /// An empty file, ready to be written to.
    pub fn empty<S: Into<String>>(name: S) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contents(&self) -> &[u8] {
        self.data.get_ref()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner()
    }

    /// Moves the read/write position back to the start.
    pub fn rewind(&mut self) {
        self.data.set_position(0);
    }
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

impl ReadFile for MemFile {
    fn stat(&self) -> io::Result<FileInfo> {
        Ok(FileInfo {
            name: self.name.clone(),
            size: self.data.get_ref().len() as u64,
            mode: MODE_FILE | 0o644,
            modified: self.modified,
        })
    }

    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        Some(self)
    }
}

impl WriteFile for MemFile {
    fn stat(&self) -> io::Result<FileInfo> {
        ReadFile::stat(self)
    }
}

/// Joins a directory and a base name the way [`FileSystem`] names them.
pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir == "." || dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Visits every entry under `root` (excluding `root` itself),
/// depth-first and sorted by name, passing each entry's full name.
pub fn walk_fs<F, E>(fsys: &dyn FileSystem, root: &str, visit: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &FileInfo) -> Result<(), E>,
    E: From<io::Error>,
{
    let mut entries = fsys.read_dir(root)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in entries {
        let path = join(root, &entry.name);
        visit(&path, &entry)?;
        if entry.is_dir() {
            walk_fs(fsys, &path, visit)?;
        }
    }
    Ok(())
}

/// A directory tree on disk
pub struct DirFs {
    root: Utf8PathBuf,
}

impl DirFs {
    pub fn new<P: AsRef<Utf8Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_owned(),
        }
    }

    fn resolve(&self, name: &str) -> io::Result<Utf8PathBuf> {
        let name = Utf8Path::new(name);
        if name.is_absolute()
            || name
                .components()
                .any(|c| matches!(c, camino::Utf8Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid name {name}"),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl FileSystem for DirFs {
    fn open(&self, name: &str) -> io::Result<Box<dyn ReadFile + '_>> {
        Ok(Box::new(OsFile::open(self.resolve(name)?)?))
    }

    fn read_dir(&self, name: &str) -> io::Result<Vec<FileInfo>> {
        let mut infos = Vec::new();
        for entry in fs::read_dir(self.resolve(name)?)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_str().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 file name")
            })?;
            infos.push(info_from_metadata(file_name, &entry.metadata()?));
        }
        Ok(infos)
    }
}

#[derive(Debug, Clone)]
enum MemNode {
    File(Vec<u8>),
    Dir,
}

/// An in-memory tree of files.
///
/// Parent directories are created as files are inserted.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    nodes: BTreeMap<String, MemNode>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file<S: Into<Vec<u8>>>(&mut self, name: &str, contents: S) {
        let name = name.trim_matches('/');
        self.insert_parents(name);
        self.nodes
            .insert(name.to_owned(), MemNode::File(contents.into()));
    }

    pub fn insert_dir(&mut self, name: &str) {
        let name = name.trim_matches('/');
        self.insert_parents(name);
        self.nodes.insert(name.to_owned(), MemNode::Dir);
    }

    fn insert_parents(&mut self, name: &str) {
        let mut end = 0;
        while let Some(slash) = name[end..].find('/') {
            end += slash;
            self.nodes
                .entry(name[..end].to_owned())
                .or_insert(MemNode::Dir);
            end += 1;
        }
    }

    fn not_found(name: &str) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{name} not found"))
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

impl FileSystem for MemFs {
    fn open(&self, name: &str) -> io::Result<Box<dyn ReadFile + '_>> {
        match self.nodes.get(name.trim_matches('/')) {
            Some(MemNode::File(contents)) => {
                Ok(Box::new(MemFile::new(base_name(name), contents.clone())))
            }
            Some(MemNode::Dir) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{name} is a directory"),
            )),
            None => Err(Self::not_found(name)),
        }
    }

    fn read_dir(&self, name: &str) -> io::Result<Vec<FileInfo>> {
        let name = name.trim_matches('/');
        let prefix = if name == "." || name.is_empty() {
            String::new()
        } else {
            match self.nodes.get(name) {
                Some(MemNode::Dir) => format!("{name}/"),
                Some(MemNode::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("{name} is not a directory"),
                    ))
                }
                None => return Err(Self::not_found(name)),
            }
        };
        Ok(self
            .nodes
            .iter()
            .filter_map(|(path, node)| {
                let child = path.strip_prefix(prefix.as_str())?;
                if child.is_empty() || child.contains('/') {
                    return None;
                }
                Some(match node {
                    MemNode::File(contents) => FileInfo::new_file(child, contents.len() as u64),
                    MemNode::Dir => FileInfo::new_dir(child),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mem_fs_listing() {
        let mut fsys = MemFs::new();
        fsys.insert_file("b/c.txt", "see");
        fsys.insert_file("a.txt", "ay");
        fsys.insert_dir("b/d");

        let top = fsys.read_dir(".").unwrap();
        let names: Vec<_> = top.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b"]);
        assert!(top[1].is_dir());

        let mut walked = Vec::new();
        walk_fs::<_, io::Error>(&fsys, ".", &mut |path, info| {
            walked.push((path.to_owned(), info.is_dir()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            walked,
            [
                ("a.txt".to_owned(), false),
                ("b".to_owned(), true),
                ("b/c.txt".to_owned(), false),
                ("b/d".to_owned(), true),
            ]
        );
    }

    #[test]
    fn mem_fs_open() {
        let mut fsys = MemFs::new();
        fsys.insert_file("dir/hello.txt", "hello");

        let mut file = fsys.open("dir/hello.txt").unwrap();
        let info = file.stat().unwrap();
        assert_eq!(info.name, "hello.txt");
        assert_eq!(info.size, 5);
        assert!(info.is_file());

        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello");

        assert!(fsys.open("dir").is_err());
        assert_eq!(
            fsys.open("nope").err().map(|e| e.kind()),
            Some(io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn mode_bits() {
        let dir = FileInfo::new_dir("d");
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert_eq!(dir.perm(), 0o755);

        let bare = FileInfo {
            mode: 0o600,
            ..FileInfo::new_file("f", 1)
        };
        assert!(bare.is_file());
    }
}
