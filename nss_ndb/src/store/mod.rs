//! Ordered key/value files behind the lookup indexes.
//!
//! Two engine generations share one interface. [`Sorted`](Generation::Sorted)
//! is a flat file of key-ordered entries read through a memory map, and
//! [`Transactional`](Generation::Transactional) is a `redb` database. The
//! generation of an existing file is detected from its first bytes, so
//! readers never need to be told which one they are opening.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;

use thiserror::Error;

mod handle;
mod sorted;
mod transactional;

pub use handle::{Direction, Handle};

/// An owned key and value.
pub type Entry = (Vec<u8>, Vec<u8>);

const CREATE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {}", .path.display(), .source)]
    Engine {
        path: PathBuf,
        #[source]
        source: redb::Error,
    },
    #[error("{}: not an ndb database ({reason})", .path.display())]
    BadFormat { path: PathBuf, reason: &'static str },
    #[error("{}: database is open read-only", .path.display())]
    ReadOnly { path: PathBuf },
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn engine<E: Into<redb::Error>>(path: &Path) -> impl FnOnce(E) -> StoreError + '_ {
        move |source| StoreError::Engine {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            StoreError::Io { path, .. }
            | StoreError::Engine { path, .. }
            | StoreError::BadFormat { path, .. }
            | StoreError::ReadOnly { path } => path,
        }
    }

    /// The OS error behind the failure, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            StoreError::Io { source, .. } => source.raw_os_error(),
            StoreError::Engine {
                source: redb::Error::Io(source),
                ..
            } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Generation {
    /// Flat key-ordered file, read through a memory map.
    #[default]
    Sorted,
    /// `redb` database with transactions and range cursors.
    Transactional,
}

impl Generation {
    fn sniff(magic: &[u8]) -> Option<Generation> {
        if magic.starts_with(&sorted::MAGIC) {
            Some(Generation::Sorted)
        } else if magic.starts_with(transactional::MAGIC) {
            Some(Generation::Transactional)
        } else {
            None
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Generation::Sorted => "sorted",
            Generation::Transactional => "redb",
        })
    }
}

impl FromStr for Generation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sorted" | "legacy" => Ok(Generation::Sorted),
            "redb" | "transactional" => Ok(Generation::Transactional),
            other => Err(format!("unknown database engine `{}` (expected sorted or redb)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    /// `generation` only matters when the file is new or empty.
    ReadWrite { create: bool, generation: Generation },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek<'k> {
    First,
    Last,
    /// The first entry whose key sorts strictly after the given one.
    After(&'k [u8]),
    /// The last entry whose key sorts strictly before the given one.
    Before(&'k [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Overwritten,
    /// `unique` was requested and the key already had a value; nothing changed.
    Exists,
}

/// One engine session on one file.
pub trait OrderedStore {
    fn generation(&self) -> Generation;

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&mut self, key: &[u8], value: &[u8], unique: bool) -> Result<PutOutcome, StoreError>;

    fn seek(&mut self, seek: Seek<'_>) -> Result<Option<Entry>, StoreError>;

    /// Makes every write so far durable and visible to new readers.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Gives the session up without touching the file or any shared state.
    /// Used for sessions inherited across `fork`.
    fn abandon(self: Box<Self>) {
        drop(self)
    }
}

/// A store session that notices when it has been carried into a forked
/// child and transparently reopens the file there.
pub struct Store {
    path: PathBuf,
    access: Access,
    engine: Option<Box<dyn OrderedStore>>,
    pid: u32,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("access", &self.access)
            .field("generation", &self.engine.as_ref().map(|e| e.generation()))
            .field("pid", &self.pid)
            .finish()
    }
}

impl Store {
    pub fn open(path: impl Into<PathBuf>, access: Access) -> Result<Store, StoreError> {
        let path = path.into();
        let engine = open_engine(&path, access)?;
        Ok(Store {
            path,
            access,
            engine: Some(engine),
            pid: process::id(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> Option<Generation> {
        self.engine.as_ref().map(|e| e.generation())
    }

    fn engine(&mut self) -> Result<&mut dyn OrderedStore, StoreError> {
        let pid = process::id();
        if pid != self.pid || self.engine.is_none() {
            if let Some(stale) = self.engine.take() {
                notice!("{}: reopening in forked process {}", self.path.display(), pid);
                stale.abandon();
            }
            self.engine = Some(open_engine(&self.path, self.access)?);
            self.pid = pid;
        }
        match self.engine.as_deref_mut() {
            Some(engine) => Ok(engine),
            None => Err(StoreError::BadFormat {
                path: self.path.clone(),
                reason: "engine missing after reopen",
            }),
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.engine()?.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8], unique: bool) -> Result<PutOutcome, StoreError> {
        self.engine()?.put(key, value, unique)
    }

    pub fn seek(&mut self, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
        self.engine()?.seek(seek)
    }

    /// Commits pending writes and ends the session.
    pub fn close(mut self) -> Result<(), StoreError> {
        match self.engine.take() {
            Some(mut engine) if self.pid == process::id() => engine.commit(),
            Some(stale) => {
                stale.abandon();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.pid != process::id() {
            if let Some(stale) = self.engine.take() {
                stale.abandon();
            }
        }
    }
}

fn open_engine(path: &Path, access: Access) -> Result<Box<dyn OrderedStore>, StoreError> {
    let generation = match access {
        Access::ReadOnly => match sniff(path)? {
            Some(generation) => generation,
            None => {
                return Err(StoreError::BadFormat {
                    path: path.to_path_buf(),
                    reason: "empty file",
                })
            }
        },
        Access::ReadWrite { create, generation } => {
            if create {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .mode(CREATE_MODE)
                    .open(path)
                    .map_err(StoreError::io(path))?;
            }
            sniff(path)?.unwrap_or(generation)
        }
    };

    let writable = matches!(access, Access::ReadWrite { .. });
    Ok(match (generation, writable) {
        (Generation::Sorted, false) => Box::new(sorted::Reader::open(path)?),
        (Generation::Sorted, true) => Box::new(sorted::Writer::open(path)?),
        (Generation::Transactional, writable) => Box::new(transactional::RedbStore::open(path, writable)?),
    })
}

/// Reads the magic bytes of an existing file. `None` means the file is empty.
fn sniff(path: &Path) -> Result<Option<Generation>, StoreError> {
    let mut file = File::open(path).map_err(StoreError::io(path))?;
    let mut magic = [0u8; 8];
    let mut len = 0;
    while len < magic.len() {
        match file.read(&mut magic[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::io(path)(e)),
        }
    }
    if len == 0 {
        return Ok(None);
    }
    match Generation::sniff(&magic[..len]) {
        Some(generation) => Ok(Some(generation)),
        None => Err(StoreError::BadFormat {
            path: path.to_path_buf(),
            reason: "unrecognized file magic",
        }),
    }
}
