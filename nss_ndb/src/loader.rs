//! Building the index files from text records.
//!
//! Every accepted line is stored verbatim (plus the trailing NUL readers
//! expect) under its name, and for passwd and group input also under its
//! numeric id. Group input additionally feeds the per-user membership
//! index.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::arena::Arena;
use crate::codec::{self, DecodeError, DecodeOptions};
use crate::store::{Access, Generation, PutOutcome, Seek, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordClass {
    /// No class: a single store keyed by the first field.
    #[default]
    Plain,
    Passwd,
    Group,
}

impl FromStr for RecordClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passwd" => Ok(RecordClass::Passwd),
            "group" => Ok(RecordClass::Group),
            other => Err(format!("unknown record type `{}` (expected passwd or group)", other)),
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordClass::Plain => "plain",
            RecordClass::Passwd => "passwd",
            RecordClass::Group => "group",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub class: RecordClass,
    /// Keep the first value for a repeated key instead of overwriting it.
    pub unique: bool,
    /// Every character in this set separates fields.
    pub delimiters: String,
    /// Engine for databases that do not exist yet.
    pub generation: Generation,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            class: RecordClass::Plain,
            unique: false,
            delimiters: ":".to_string(),
            generation: Generation::Sorted,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reading input: {0}")]
    Io(#[source] io::Error),
    #[error("line {line}: missing {field} field")]
    MissingField { line: usize, field: &'static str },
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
    #[error("{}: duplicate key `{key}`, keeping the first value", .path.display())]
    Duplicate { path: PathBuf, key: String },
}

impl LoadError {
    /// Problems with a single line that the load continues past.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            LoadError::MissingField { .. } | LoadError::Malformed { .. } | LoadError::Duplicate { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub lines: usize,
    pub imported: usize,
    pub warnings: usize,
}

/// Index files written for `base` and a record class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub by_name: PathBuf,
    pub by_id: Option<PathBuf>,
    pub by_member: Option<PathBuf>,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

impl IndexPaths {
    pub fn new(base: &Path, class: RecordClass) -> Self {
        match class {
            RecordClass::Plain => IndexPaths {
                by_name: base.to_path_buf(),
                by_id: None,
                by_member: None,
            },
            RecordClass::Passwd => IndexPaths {
                by_name: with_suffix(base, ".byname.db"),
                by_id: Some(with_suffix(base, ".byuid.db")),
                by_member: None,
            },
            RecordClass::Group => IndexPaths {
                by_name: with_suffix(base, ".byname.db"),
                by_id: Some(with_suffix(base, ".bygid.db")),
                by_member: Some(with_suffix(base, ".byuser.db")),
            },
        }
    }
}

pub struct Loader {
    options: LoadOptions,
    by_name: Store,
    by_id: Option<Store>,
    by_member: Option<Store>,
    stats: LoadStats,
}

impl Loader {
    pub fn create(base: &Path, options: LoadOptions) -> Result<Self, LoadError> {
        let paths = IndexPaths::new(base, options.class);
        let access = Access::ReadWrite {
            create: true,
            generation: options.generation,
        };
        let open = |path: &Path| Store::open(path, access);
        let by_name = match open(paths.by_name.as_path()) {
            // A plain database that cannot be used under its own name is
            // written as `<path>.db` instead.
            Err(first) if options.class == RecordClass::Plain => {
                let fallback = with_suffix(base, ".db");
                debug!("{}; trying {}", first, fallback.display());
                open(fallback.as_path())?
            }
            opened => opened?,
        };
        Ok(Loader {
            by_name,
            by_id: paths.by_id.as_deref().map(open).transpose()?,
            by_member: paths.by_member.as_deref().map(open).transpose()?,
            options,
            stats: LoadStats::default(),
        })
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    /// Loads every line of `input`. Per-line problems are passed to `warn`
    /// and counted; anything else stops the load.
    pub fn load<R: BufRead>(&mut self, input: R, mut warn: impl FnMut(&LoadError)) -> Result<LoadStats, LoadError> {
        for (index, line) in input.lines().enumerate() {
            let line = line.map_err(LoadError::Io)?;
            self.load_line(index + 1, &line, &mut warn)?;
        }
        Ok(self.stats)
    }

    pub fn load_line(&mut self, number: usize, line: &str, warn: &mut dyn FnMut(&LoadError)) -> Result<(), LoadError> {
        self.stats.lines += 1;
        let Some(line) = codec::encode_line(line) else {
            return Ok(());
        };
        match self.store_line(number, line, warn) {
            Err(e) if e.is_warning() => {
                self.warning(&e, warn);
                Ok(())
            }
            other => other,
        }
    }

    fn warning(&mut self, e: &LoadError, warn: &mut dyn FnMut(&LoadError)) {
        self.stats.warnings += 1;
        warn(e);
    }

    fn store_line(&mut self, number: usize, line: &str, warn: &mut dyn FnMut(&LoadError)) -> Result<(), LoadError> {
        let delimiters = self.options.delimiters.as_str();
        let mut fields = line.splitn(4, |c: char| delimiters.contains(c));
        let name = fields.next().unwrap_or_default();
        let id = fields.nth(1);
        let members = fields.next();

        let id = match self.options.class {
            RecordClass::Plain => None,
            RecordClass::Passwd | RecordClass::Group => match id.filter(|id| !id.is_empty()) {
                Some(id) => Some(id),
                None => {
                    let field = if self.options.class == RecordClass::Passwd { "uid" } else { "gid" };
                    return Err(LoadError::MissingField { line: number, field });
                }
            },
        };
        if self.options.delimiters == ":" {
            validate(self.options.class, line).map_err(|reason| LoadError::Malformed { line: number, reason })?;
        }

        let value = codec::stored_value(line);
        let unique = self.options.unique;
        if let (Some(store), Some(id)) = (self.by_id.as_mut(), id) {
            if store.put(id.as_bytes(), &value, unique)? == PutOutcome::Exists {
                let e = duplicate(store, id);
                self.warning(&e, warn);
            }
        }
        if self.by_name.put(name.as_bytes(), &value, unique)? == PutOutcome::Exists {
            return Err(duplicate(&self.by_name, name));
        }

        if self.options.class == RecordClass::Group {
            let gid = id
                .and_then(|id| id.trim().parse::<u32>().ok())
                .ok_or(LoadError::Malformed {
                    line: number,
                    reason: "gid is not an unsigned integer",
                })?;
            for member in members.unwrap_or_default().split(',').map(str::trim).filter(|m| !m.is_empty()) {
                self.add_membership(member, gid)?;
            }
        }
        self.stats.imported += 1;
        Ok(())
    }

    /// Appends `gid` to the membership entry of `member` unless it is
    /// already listed.
    fn add_membership(&mut self, member: &str, gid: u32) -> Result<(), LoadError> {
        let Some(store) = self.by_member.as_mut() else {
            return Ok(());
        };
        let key = member.as_bytes();
        let value = match store.get(key)? {
            None => codec::encode_membership(key, [gid]),
            Some(existing) => {
                let mut gids: Vec<u32> = codec::membership_gids(&existing).collect();
                if gids.contains(&gid) {
                    return Ok(());
                }
                gids.push(gid);
                codec::encode_membership(key, gids)
            }
        };
        store.put(key, &value, false)?;
        Ok(())
    }

    /// Commits every index and returns the final counts.
    pub fn finish(self) -> Result<LoadStats, LoadError> {
        let Loader {
            by_name,
            by_id,
            by_member,
            stats,
            ..
        } = self;
        by_name.close()?;
        if let Some(store) = by_id {
            store.close()?;
        }
        if let Some(store) = by_member {
            store.close()?;
        }
        Ok(stats)
    }
}

fn duplicate(store: &Store, key: &str) -> LoadError {
    LoadError::Duplicate {
        path: store.path().to_path_buf(),
        key: key.to_string(),
    }
}

/// Checks a colon-delimited line against its record shape.
fn validate(class: RecordClass, line: &str) -> Result<(), &'static str> {
    let opts = DecodeOptions {
        extended_passwd: true,
        oversize_threshold: usize::MAX,
    };
    if class == RecordClass::Plain {
        return Ok(());
    }
    let mut scratch = vec![0u8; line.len() * 10 + 64];
    let mut arena = Arena::new(&mut scratch);
    let decoded = match class {
        RecordClass::Plain => Ok(()),
        RecordClass::Passwd => codec::decode_passwd(line.as_bytes(), &mut arena, &opts).map(|_| ()),
        RecordClass::Group => codec::decode_group(line.as_bytes(), &mut arena, &opts).map(|_| ()),
    };
    match decoded {
        Ok(()) => Ok(()),
        Err(DecodeError::Malformed(reason)) => Err(reason),
        Err(DecodeError::Arena(_)) => Err("record too large"),
    }
}

/// The file `makendb -p` reads for `path`: the path itself, or the first
/// of its `.db` and `.byname.db` variants that exists.
pub fn dump_path(path: &Path) -> PathBuf {
    [
        path.to_path_buf(),
        with_suffix(path, ".db"),
        with_suffix(path, ".byname.db"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
    .unwrap_or_else(|| path.to_path_buf())
}

/// Writes every value of a store in key order, one per line, optionally
/// prefixed by its key. Returns the number of entries written.
pub fn dump(path: &Path, with_keys: bool, out: &mut dyn Write) -> Result<usize, LoadError> {
    let mut store = Store::open(dump_path(path), Access::ReadOnly)?;
    let mut count = 0;
    let mut next = store.seek(Seek::First)?;
    while let Some((key, value)) = next {
        if with_keys {
            write!(out, "{:<14}\t", String::from_utf8_lossy(&key)).map_err(LoadError::Io)?;
        }
        let value = value.strip_suffix(&[0]).unwrap_or(&value);
        out.write_all(value).and_then(|()| out.write_all(b"\n")).map_err(LoadError::Io)?;
        count += 1;
        next = store.seek(Seek::After(&key))?;
    }
    store.close()?;
    Ok(count)
}
