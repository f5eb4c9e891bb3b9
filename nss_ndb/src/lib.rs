#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;

pub mod arena;
pub mod codec;
pub mod config;
pub mod loader;
pub mod lookup;
pub mod membership;
pub mod normalize;
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
pub mod nsdispatch;
pub mod nss;
pub mod status;
pub mod store;

pub use arena::{Arena, ArenaExhausted};
pub use codec::{DecodeError, DecodeOptions, Group, Passwd};
pub use config::{Config, ConfigError, DbPaths};
pub use loader::{LoadError, LoadOptions, LoadStats, Loader, RecordClass};
pub use lookup::{Lookup, LookupError};
pub use membership::{Added, BoundedGroups, GroupSink, MembershipReport};
pub use status::NssStatus;
pub use store::{Access, Generation, Handle, PutOutcome, Seek, Store, StoreError};
