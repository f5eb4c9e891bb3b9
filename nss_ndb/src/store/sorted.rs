//! The flat sorted-file engine.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! "NDBSORT1" | count: u64 | offsets: [u64; count] | entries
//! entry = key_len: u32 | value_len: u32 | key | value
//! ```
//!
//! Entries are in ascending key order with no duplicate keys, and
//! `offsets[i]` is the absolute file position of entry `i`. Readers share
//! an flock and map the file; a writer holds the lock exclusively and
//! replaces the file wholesale on commit.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::Bound;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;

use super::{Entry, Generation, OrderedStore, PutOutcome, Seek, StoreError, CREATE_MODE};

pub(super) const MAGIC: [u8; 8] = *b"NDBSORT1";
const HEADER_LEN: usize = 16;
const ENTRY_HEADER_LEN: usize = 8;

fn bad(path: &Path, reason: &'static str) -> StoreError {
    StoreError::BadFormat {
        path: path.to_path_buf(),
        reason,
    }
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let raw = bytes.get(at..at.checked_add(8)?)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

/// A validated view of an encoded file.
#[derive(Clone, Copy)]
struct Layout<'m> {
    bytes: &'m [u8],
    count: usize,
}

impl<'m> Layout<'m> {
    fn parse(bytes: &'m [u8], path: &Path) -> Result<Self, StoreError> {
        if bytes.len() < HEADER_LEN || bytes[..MAGIC.len()] != MAGIC {
            return Err(bad(path, "missing sorted file header"));
        }
        let count = read_u64(bytes, MAGIC.len())
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| bad(path, "entry count out of range"))?;
        count
            .checked_mul(8)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| bad(path, "offset table runs past end of file"))?;
        Ok(Layout { bytes, count })
    }

    fn entry(&self, index: usize, path: &Path) -> Result<(&'m [u8], &'m [u8]), StoreError> {
        let bytes = self.bytes;
        let truncated = || bad(path, "entry runs past end of file");
        let offset = read_u64(bytes, HEADER_LEN + index * 8)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(truncated)?;
        let key_len = read_u32(bytes, offset).ok_or_else(truncated)? as usize;
        let value_len = read_u32(bytes, offset + 4).ok_or_else(truncated)? as usize;
        let key_start = offset + ENTRY_HEADER_LEN;
        let value_start = key_start.checked_add(key_len).ok_or_else(truncated)?;
        let value_end = value_start.checked_add(value_len).ok_or_else(truncated)?;
        let key = bytes.get(key_start..value_start).ok_or_else(truncated)?;
        let value = bytes.get(value_start..value_end).ok_or_else(truncated)?;
        Ok((key, value))
    }

    /// Index of the first entry whose key is not less than `key`
    /// (`strict`: greater than `key`).
    fn partition(&self, key: &[u8], strict: bool, path: &Path) -> Result<usize, StoreError> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (candidate, _) = self.entry(mid, path)?;
            let before = if strict { candidate <= key } else { candidate < key };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

/// Read-only session over a memory-mapped file.
pub(super) struct Reader {
    path: PathBuf,
    map: Mmap,
    count: usize,
    // Index of the entry most recently returned by `seek`.
    cursor: Option<usize>,
    // Keeps the shared lock for the life of the session.
    _file: File,
}

impl Reader {
    pub(super) fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(StoreError::io(path))?;
        file.lock_shared().map_err(StoreError::io(path))?;
        // SAFETY: writers never modify a published file in place; they
        // replace it by rename while holding the exclusive lock, and we hold
        // the shared lock on this inode until the map is dropped.
        let map = unsafe { Mmap::map(&file) }.map_err(StoreError::io(path))?;
        let count = Layout::parse(&map, path)?.count;
        Ok(Reader {
            path: path.to_path_buf(),
            map,
            count,
            cursor: None,
            _file: file,
        })
    }

    fn layout(&self) -> Layout<'_> {
        Layout {
            bytes: &self.map,
            count: self.count,
        }
    }

    fn yield_entry(&mut self, index: Option<usize>) -> Result<Option<Entry>, StoreError> {
        let Some(index) = index.filter(|i| *i < self.count) else {
            return Ok(None);
        };
        let (key, value) = self.layout().entry(index, &self.path)?;
        let entry = (key.to_vec(), value.to_vec());
        self.cursor = Some(index);
        Ok(Some(entry))
    }

    fn cursor_at(&self, key: &[u8]) -> Option<usize> {
        let index = self.cursor?;
        match self.layout().entry(index, &self.path) {
            Ok((stored, _)) if stored == key => Some(index),
            _ => None,
        }
    }
}

impl OrderedStore for Reader {
    fn generation(&self) -> Generation {
        Generation::Sorted
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let layout = self.layout();
        let index = layout.partition(key, false, &self.path)?;
        if index < self.count {
            let (stored, value) = layout.entry(index, &self.path)?;
            if stored == key {
                return Ok(Some(value.to_vec()));
            }
        }
        Ok(None)
    }

    fn put(&mut self, _key: &[u8], _value: &[u8], _unique: bool) -> Result<PutOutcome, StoreError> {
        Err(StoreError::ReadOnly {
            path: self.path.clone(),
        })
    }

    fn seek(&mut self, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
        let index = match seek {
            Seek::First => Some(0),
            Seek::Last => self.count.checked_sub(1),
            Seek::After(key) => match self.cursor_at(key) {
                Some(index) => Some(index + 1),
                None => Some(self.layout().partition(key, true, &self.path)?),
            },
            Seek::Before(key) => match self.cursor_at(key) {
                Some(index) => index.checked_sub(1),
                None => self.layout().partition(key, false, &self.path)?.checked_sub(1),
            },
        };
        self.yield_entry(index)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read-write session. Entries are staged in memory and written out as a
/// whole new file on commit.
pub(super) struct Writer {
    path: PathBuf,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    dirty: bool,
    // Holds the exclusive lock until the session ends.
    _file: File,
}

impl Writer {
    pub(super) fn open(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(StoreError::io(path))?;
        file.lock_exclusive().map_err(StoreError::io(path))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(StoreError::io(path))?;
        let mut entries = BTreeMap::new();
        // A new file is published with a header on commit even if nothing is
        // put, so readers never meet a zero-length index.
        let dirty = bytes.is_empty();
        if !dirty {
            let layout = Layout::parse(&bytes, path)?;
            for index in 0..layout.count {
                let (key, value) = layout.entry(index, path)?;
                entries.insert(key.to_vec(), value.to_vec());
            }
        }

        Ok(Writer {
            path: path.to_path_buf(),
            entries,
            dirty,
            _file: file,
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let mut hidden = std::ffi::OsString::from(".");
        hidden.push(name);
        self.path.with_file_name(hidden)
    }

    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        let count = self.entries.len();
        out.write_all(&MAGIC)?;
        out.write_all(&(count as u64).to_le_bytes())?;

        let mut offset = HEADER_LEN + count * 8;
        for (key, value) in &self.entries {
            out.write_all(&(offset as u64).to_le_bytes())?;
            offset += ENTRY_HEADER_LEN + key.len() + value.len();
        }
        for (key, value) in &self.entries {
            out.write_all(&length(key.len())?.to_le_bytes())?;
            out.write_all(&length(value.len())?.to_le_bytes())?;
            out.write_all(key)?;
            out.write_all(value)?;
        }
        out.flush()
    }
}

fn length(len: usize) -> std::io::Result<u32> {
    u32::try_from(len).map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "key or value too large"))
}

impl OrderedStore for Writer {
    fn generation(&self) -> Generation {
        Generation::Sorted
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8], unique: bool) -> Result<PutOutcome, StoreError> {
        if unique && self.entries.contains_key(key) {
            return Ok(PutOutcome::Exists);
        }
        self.dirty = true;
        Ok(match self.entries.insert(key.to_vec(), value.to_vec()) {
            Some(_) => PutOutcome::Overwritten,
            None => PutOutcome::Inserted,
        })
    }

    fn seek(&mut self, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
        let found = match seek {
            Seek::First => self.entries.iter().next(),
            Seek::Last => self.entries.iter().next_back(),
            Seek::After(key) => self
                .entries
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next(),
            Seek::Before(key) => self
                .entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
        };
        Ok(found.map(|(k, v)| (k.clone(), v.clone())))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let temp = self.temp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CREATE_MODE)
            .open(&temp)
            .map_err(StoreError::io(&temp))?;
        let mut out = BufWriter::new(file);
        let written = self
            .write_to(&mut out)
            .and_then(|()| out.get_ref().sync_all())
            .and_then(|()| fs::rename(&temp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(StoreError::io(&self.path)(e));
        }
        self.dirty = false;
        Ok(())
    }
}
