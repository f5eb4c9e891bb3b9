use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::codec::{self, DecodeOptions};

pub const DEFAULT_CONF_PATH: &str = "/etc/nss_ndb.conf";
pub const DEFAULT_DBDIR: &str = "/var/db/nss_ndb";

pub const CONF_ENV: &str = "NSS_NDB_CONF";
pub const DBDIR_ENV: &str = "NSS_NDB_DBDIR";
pub const STRIP_WORKGROUP_ENV: &str = "NSS_NDB_STRIP_WORKGROUP";
pub const STRIP_REALM_ENV: &str = "NSS_NDB_STRIP_REALM";
pub const DEBUG_ENV: &str = "NSS_NDB_DEBUG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub dbdir: PathBuf,
    /// Workgroup prefix to remove from looked-up names; empty matches any.
    pub strip_workgroup: Option<String>,
    /// Realm suffix to remove from looked-up names; empty matches any.
    pub strip_realm: Option<String>,
    pub extended_passwd: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dbdir: PathBuf::from(DEFAULT_DBDIR),
            strip_workgroup: None,
            strip_realm: None,
            extended_passwd: codec::master_passwd_platform(),
            debug: false,
        }
    }
}

/// Locations of the five index files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPaths {
    pub passwd_byname: PathBuf,
    pub passwd_byuid: PathBuf,
    pub group_byname: PathBuf,
    pub group_bygid: PathBuf,
    pub group_byuser: PathBuf,
}

impl DbPaths {
    pub fn in_dir(dir: &Path) -> Self {
        DbPaths {
            passwd_byname: dir.join("passwd.byname.db"),
            passwd_byuid: dir.join("passwd.byuid.db"),
            group_byname: dir.join("group.byname.db"),
            group_bygid: dir.join("group.bygid.db"),
            group_byuser: dir.join("group.byuser.db"),
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reads a configuration file. A file that does not exist is not an
    /// error and yields `None`.
    pub fn read(path: &Path) -> Result<Option<Self>, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Config::from_toml(&text).map(Some).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides settings from environment variables, looked up through
    /// `var`.
    pub fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = var(DBDIR_ENV).filter(|d| !d.is_empty()) {
            self.dbdir = PathBuf::from(dir);
        }
        if let Some(workgroup) = var(STRIP_WORKGROUP_ENV) {
            self.strip_workgroup = Some(workgroup);
        }
        if let Some(realm) = var(STRIP_REALM_ENV) {
            self.strip_realm = Some(realm);
        }
        if let Some(debug) = var(DEBUG_ENV) {
            self.debug = truthy(&debug);
        }
        self
    }

    /// The process configuration: the file named by `NSS_NDB_CONF` (or the
    /// default path) with environment overrides on top. Problems with the
    /// file are logged and the defaults used instead.
    pub fn load() -> Self {
        let path = env::var_os(CONF_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_PATH));
        let file = match Config::read(&path) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                warning!("{}; using defaults", e);
                Config::default()
            }
        };
        file.with_env(|name| env::var(name).ok())
    }

    pub fn paths(&self) -> DbPaths {
        DbPaths::in_dir(&self.dbdir)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            extended_passwd: self.extended_passwd,
            ..DecodeOptions::default()
        }
    }
}
