//! Named, seekable byte streams.
//!
//! The handle table never touches the file system directly; it asks a
//! [`StreamProvider`] to open resources by name and reads from the returned
//! `Read + Seek` stream.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

pub trait StreamProvider {
    type Stream: Read + Seek;

    /// Opens the resource called `name`. A missing resource is
    /// `io::ErrorKind::NotFound`.
    fn open(&mut self, name: &str) -> io::Result<Self::Stream>;
}

/// Resources stored as plain files in one directory.
///
/// Names are matched exactly first, then upper-cased, then lower-cased, since
/// index records store names in whatever case the authoring tools used.
#[derive(Debug, Clone)]
pub struct DirProvider {
    root: PathBuf,
}

impl DirProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        [name.to_string(), name.to_ascii_uppercase(), name.to_ascii_lowercase()]
            .into_iter()
            .map(|candidate| self.root.join(candidate))
            .find(|path| path.is_file())
    }
}

impl StreamProvider for DirProvider {
    type Stream = BufReader<File>;

    fn open(&mut self, name: &str) -> io::Result<Self::Stream> {
        let path = self.locate(name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found under {}", name, self.root.display()),
            )
        })?;
        log::debug!("vfs: opening {}", path.display());
        Ok(BufReader::new(File::open(path)?))
    }
}

/// In-memory resources. Counts every open and every byte read, and can be
/// told to fail the next few opens of a name.
#[derive(Debug, Default)]
pub struct MemProvider {
    files: HashMap<String, Arc<[u8]>>,
    opens: HashMap<String, usize>,
    failures: HashMap<String, u32>,
    bytes_read: Rc<Cell<u64>>,
}

impl MemProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), Arc::from(bytes.into()));
    }

    pub fn with_file(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    /// Makes the next `count` opens of `name` fail with an I/O error.
    pub fn fail_next_opens(&mut self, name: impl Into<String>, count: u32) {
        self.failures.insert(name.into(), count);
    }

    /// Successful opens of `name` so far.
    pub fn opens_of(&self, name: &str) -> usize {
        self.opens.get(name).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.opens.values().sum()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }
}

impl StreamProvider for MemProvider {
    type Stream = MemStream;

    fn open(&mut self, name: &str) -> io::Result<Self::Stream> {
        if let Some(left) = self.failures.get_mut(name).filter(|left| **left > 0) {
            *left -= 1;
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("injected failure opening {}", name),
            ));
        }
        let data = self
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", name)))?;
        *self.opens.entry(name.to_string()).or_default() += 1;
        Ok(MemStream {
            inner: Cursor::new(data),
            bytes_read: Rc::clone(&self.bytes_read),
        })
    }
}

/// Stream handed out by [`MemProvider`].
#[derive(Debug)]
pub struct MemStream {
    inner: Cursor<Arc<[u8]>>,
    bytes_read: Rc<Cell<u64>>,
}

impl Read for MemStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read.set(self.bytes_read.get() + n as u64);
        Ok(n)
    }
}

impl Seek for MemStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}
