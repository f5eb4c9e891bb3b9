//! The runtime side: point lookups, enumeration and membership expansion
//! over the five index files.
//!
//! A [`Lookup`] is an explicit context. It owns one enumeration [`Handle`]
//! per record class and the configuration it was built from; callers that
//! need per-thread state keep one `Lookup` per thread.

use std::path::Path;

use thiserror::Error;

use crate::arena::{Arena, ArenaExhausted};
use crate::codec::{self, DecodeError, DecodeOptions, Group, Passwd, MAX_GETENT_SIZE, MAX_GETOBJ_SIZE};
use crate::config::{Config, DbPaths};
use crate::membership::{GroupSink, MembershipReport};
use crate::normalize;
use crate::store::{Access, Handle, Store, StoreError};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("index unavailable: {0}")]
    Unavailable(#[source] StoreError),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    BufferTooSmall(ArenaExhausted),
}

/// A record shape the codec can decode into an arena.
trait Record<'a>: Sized {
    fn decode(raw: &[u8], arena: &mut Arena<'a>, opts: &DecodeOptions) -> Result<Self, DecodeError>;
}

impl<'a> Record<'a> for Passwd<'a> {
    fn decode(raw: &[u8], arena: &mut Arena<'a>, opts: &DecodeOptions) -> Result<Self, DecodeError> {
        codec::decode_passwd(raw, arena, opts)
    }
}

impl<'a> Record<'a> for Group<'a> {
    fn decode(raw: &[u8], arena: &mut Arena<'a>, opts: &DecodeOptions) -> Result<Self, DecodeError> {
        codec::decode_group(raw, arena, opts)
    }
}

fn unavailable(e: StoreError) -> LookupError {
    error!("{}", e);
    LookupError::Unavailable(e)
}

pub struct Lookup {
    paths: DbPaths,
    workgroup: Option<String>,
    realm: Option<String>,
    options: DecodeOptions,
    passwd: Handle,
    group: Handle,
}

impl Lookup {
    pub fn new(config: &Config) -> Self {
        let paths = config.paths();
        Lookup {
            passwd: Handle::new(&paths.passwd_byname),
            group: Handle::new(&paths.group_byname),
            workgroup: config.strip_workgroup.clone(),
            realm: config.strip_realm.clone(),
            options: config.decode_options(),
            paths,
        }
    }

    pub fn paths(&self) -> &DbPaths {
        &self.paths
    }

    fn key<'n>(&self, name: &'n [u8]) -> &'n [u8] {
        normalize::normalize(name, self.workgroup.as_deref(), self.realm.as_deref())
    }

    pub fn getpwnam<'a>(&mut self, name: &[u8], arena: &mut Arena<'a>) -> Result<Passwd<'a>, LookupError> {
        let key = self.key(name);
        let opts = self.options.with_threshold(MAX_GETOBJ_SIZE);
        fetch(&mut self.passwd, &self.paths.passwd_byname, key, arena, &opts)
    }

    pub fn getpwuid<'a>(&mut self, uid: u32, arena: &mut Arena<'a>) -> Result<Passwd<'a>, LookupError> {
        let key = uid.to_string();
        let opts = self.options.with_threshold(MAX_GETOBJ_SIZE);
        fetch(&mut self.passwd, &self.paths.passwd_byuid, key.as_bytes(), arena, &opts)
    }

    pub fn setpwent(&mut self, stay_open: bool) -> Result<(), LookupError> {
        self.passwd.setent(stay_open).map_err(unavailable)
    }

    pub fn getpwent<'a>(&mut self, arena: &mut Arena<'a>) -> Result<Passwd<'a>, LookupError> {
        let opts = self.options.with_threshold(MAX_GETENT_SIZE);
        next_entry(&mut self.passwd, arena, &opts)
    }

    pub fn endpwent(&mut self) {
        self.passwd.endent();
    }

    pub fn getgrnam<'a>(&mut self, name: &[u8], arena: &mut Arena<'a>) -> Result<Group<'a>, LookupError> {
        let key = self.key(name);
        let opts = self.options.with_threshold(MAX_GETOBJ_SIZE);
        fetch(&mut self.group, &self.paths.group_byname, key, arena, &opts)
    }

    pub fn getgrgid<'a>(&mut self, gid: u32, arena: &mut Arena<'a>) -> Result<Group<'a>, LookupError> {
        let key = gid.to_string();
        let opts = self.options.with_threshold(MAX_GETOBJ_SIZE);
        fetch(&mut self.group, &self.paths.group_bygid, key.as_bytes(), arena, &opts)
    }

    pub fn setgrent(&mut self, stay_open: bool) -> Result<(), LookupError> {
        self.group.setent(stay_open).map_err(unavailable)
    }

    pub fn getgrent<'a>(&mut self, arena: &mut Arena<'a>) -> Result<Group<'a>, LookupError> {
        let opts = self.options.with_threshold(MAX_GETENT_SIZE);
        next_entry(&mut self.group, arena, &opts)
    }

    pub fn endgrent(&mut self) {
        self.group.endent();
    }

    /// Offers `primary` and then every gid in the user's membership entry to
    /// `sink`.
    ///
    /// A user without an entry is not an error: the report comes back with
    /// `found == false`. Whatever the outcome, host adapters answer "not
    /// found" so that later sources can add their own groups.
    pub fn group_membership(
        &mut self,
        name: &[u8],
        primary: Option<u32>,
        sink: &mut dyn GroupSink,
    ) -> Result<MembershipReport, LookupError> {
        let key = self.key(name);
        let value = point_get(&self.paths.group_byuser, key)?;

        let mut report = MembershipReport::default();
        if let Some(gid) = primary {
            report.record(sink.add(gid));
        }
        if let Some(value) = value {
            report.found = true;
            for gid in codec::membership_gids(&value) {
                report.record(sink.add(gid));
            }
        }
        debug!(
            "membership of {}: {} added, {} over capacity",
            String::from_utf8_lossy(key),
            report.inserted,
            report.overflowed
        );
        Ok(report)
    }
}

/// Reads one key through a short-lived session.
fn point_get(path: &Path, key: &[u8]) -> Result<Option<Vec<u8>>, LookupError> {
    let mut store = Store::open(path, Access::ReadOnly).map_err(unavailable)?;
    let value = store.get(key);
    if let Err(e) = store.close() {
        warning!("closing {}: {}", path.display(), e);
    }
    value.map_err(unavailable)
}

fn fetch<'a, R: Record<'a>>(
    handle: &mut Handle,
    path: &Path,
    key: &[u8],
    arena: &mut Arena<'a>,
    opts: &DecodeOptions,
) -> Result<R, LookupError> {
    let value = if handle.is_open() && handle.path() == path {
        handle.get(key).map_err(unavailable)?
    } else {
        point_get(path, key)?
    };
    let value = value.ok_or(LookupError::NotFound)?;
    decode(&value, arena, opts, path, key)
}

fn decode<'a, R: Record<'a>>(
    value: &[u8],
    arena: &mut Arena<'a>,
    opts: &DecodeOptions,
    path: &Path,
    key: &[u8],
) -> Result<R, LookupError> {
    match R::decode(value, arena, opts) {
        Ok(record) => Ok(record),
        Err(DecodeError::Arena(e)) => Err(LookupError::BufferTooSmall(e)),
        Err(DecodeError::Malformed(why)) => {
            warning!("{}: record {}: {}", path.display(), String::from_utf8_lossy(key), why);
            Err(LookupError::NotFound)
        }
    }
}

fn next_entry<'a, R: Record<'a>>(handle: &mut Handle, arena: &mut Arena<'a>, opts: &DecodeOptions) -> Result<R, LookupError> {
    let result = loop {
        let (key, value) = match handle.cursor_step() {
            Ok(Some(entry)) => entry,
            Ok(None) => break Err(LookupError::NotFound),
            Err(e) => {
                handle.close();
                return Err(unavailable(e));
            }
        };
        match decode::<R>(&value, arena, opts, handle.path(), &key) {
            Err(LookupError::NotFound) => continue,
            Err(LookupError::BufferTooSmall(e)) => {
                debug!(
                    "{}: {} bytes short for {}, will replay",
                    handle.path().display(),
                    e.requested.saturating_sub(e.available),
                    String::from_utf8_lossy(&key)
                );
                handle.rewind();
                break Err(LookupError::BufferTooSmall(e));
            }
            other => break other,
        }
    };
    handle.release();
    result
}
