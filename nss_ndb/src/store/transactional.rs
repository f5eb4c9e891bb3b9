//! The `redb` engine.
//!
//! redb allows a file to be open only once per process, so every session on
//! the same path shares one database handle through a registry. The
//! registry remembers which process opened each handle; a forked child never
//! reuses its parent's.
//!
//! Readers open the file as a [`ReadOnlyDatabase`], which needs only read
//! permission and takes a shared lock, so any number of processes can read
//! an index at once. Writers take the exclusive lock for as long as they
//! hold the file.

use std::collections::HashMap;
use std::mem;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex, Weak};

use redb::{
    Database, ReadOnlyDatabase, ReadTransaction, ReadableDatabase, ReadableTable, StorageError, TableDefinition,
    TableError, WriteTransaction,
};

use super::{Entry, Generation, OrderedStore, PutOutcome, Seek, StoreError};

pub(super) const MAGIC: &[u8] = b"redb";

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

#[derive(Clone)]
enum Shared {
    Writable(Arc<Database>),
    ReadOnly(Arc<ReadOnlyDatabase>),
}

impl Shared {
    fn begin_read(&self) -> Result<ReadTransaction, redb::TransactionError> {
        match self {
            Shared::Writable(database) => database.begin_read(),
            Shared::ReadOnly(database) => database.begin_read(),
        }
    }

    fn downgrade(&self) -> Registered {
        match self {
            Shared::Writable(database) => Registered::Writable(Arc::downgrade(database)),
            Shared::ReadOnly(database) => Registered::ReadOnly(Arc::downgrade(database)),
        }
    }

    #[cfg(test)]
    fn same(&self, other: &Shared) -> bool {
        match (self, other) {
            (Shared::Writable(a), Shared::Writable(b)) => Arc::ptr_eq(a, b),
            (Shared::ReadOnly(a), Shared::ReadOnly(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

enum Registered {
    Writable(Weak<Database>),
    ReadOnly(Weak<ReadOnlyDatabase>),
}

impl Registered {
    fn upgrade(&self) -> Option<Shared> {
        match self {
            Registered::Writable(database) => database.upgrade().map(Shared::Writable),
            Registered::ReadOnly(database) => database.upgrade().map(Shared::ReadOnly),
        }
    }
}

struct Opened {
    pid: u32,
    database: Registered,
}

lazy_static! {
    static ref DATABASES: Mutex<HashMap<PathBuf, Opened>> = Mutex::new(HashMap::new());
}

/// The live handle this process holds on `path`, or a newly opened one.
/// Readers reuse either kind; writers only reuse a writable handle.
fn shared_database(path: &Path, writable: bool) -> Result<Shared, StoreError> {
    let mut databases = match DATABASES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let pid = process::id();
    let live = databases
        .get(path)
        .filter(|opened| opened.pid == pid)
        .and_then(|opened| opened.database.upgrade());
    match live {
        Some(database @ Shared::Writable(_)) => return Ok(database),
        Some(database) if !writable => return Ok(database),
        _ => {}
    }

    let database = if writable {
        Shared::Writable(Arc::new(Database::create(path).map_err(StoreError::engine(path))?))
    } else {
        Shared::ReadOnly(Arc::new(ReadOnlyDatabase::open(path).map_err(StoreError::engine(path))?))
    };
    databases.insert(
        path.to_path_buf(),
        Opened {
            pid,
            database: database.downgrade(),
        },
    );
    Ok(database)
}

enum Session {
    Read(ReadTransaction),
    // None between a commit and the next write.
    Write(Option<WriteTransaction>),
}

pub(super) struct RedbStore {
    path: PathBuf,
    session: Session,
    // Declared last so the transaction above is dropped first.
    database: Shared,
}

fn seek_in<T>(table: &T, seek: Seek<'_>) -> Result<Option<Entry>, StorageError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut range = match seek {
        Seek::First | Seek::Last => table.range::<&[u8]>(..)?,
        Seek::After(key) => table.range::<&[u8]>((Bound::Excluded(key), Bound::Unbounded))?,
        Seek::Before(key) => table.range::<&[u8]>((Bound::Unbounded, Bound::Excluded(key)))?,
    };
    let found = match seek {
        Seek::First | Seek::After(_) => range.next(),
        Seek::Last | Seek::Before(_) => range.next_back(),
    };
    Ok(found
        .transpose()?
        .map(|(key, value)| (key.value().to_vec(), value.value().to_vec())))
}

impl RedbStore {
    pub(super) fn open(path: &Path, writable: bool) -> Result<Self, StoreError> {
        let database = shared_database(path, writable)?;
        let session = match &database {
            Shared::Writable(db) if writable => Session::Write(Some(db.begin_write().map_err(StoreError::engine(path))?)),
            _ => Session::Read(database.begin_read().map_err(StoreError::engine(path))?),
        };
        Ok(RedbStore {
            path: path.to_path_buf(),
            session,
            database,
        })
    }

    fn write_txn(&mut self) -> Result<&mut WriteTransaction, StoreError> {
        match &mut self.session {
            Session::Read(_) => Err(StoreError::ReadOnly {
                path: self.path.clone(),
            }),
            Session::Write(txn) => {
                if txn.is_none() {
                    let Shared::Writable(database) = &self.database else {
                        return Err(StoreError::ReadOnly {
                            path: self.path.clone(),
                        });
                    };
                    *txn = Some(database.begin_write().map_err(StoreError::engine(&self.path))?);
                }
                match txn.as_mut() {
                    Some(txn) => Ok(txn),
                    None => Err(StoreError::ReadOnly {
                        path: self.path.clone(),
                    }),
                }
            }
        }
    }
}

impl OrderedStore for RedbStore {
    fn generation(&self) -> Generation {
        Generation::Transactional
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Session::Read(txn) = &self.session {
            let table = match txn.open_table(RECORDS) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(StoreError::engine(&self.path)(e)),
            };
            let value = table.get(key).map_err(StoreError::engine(&self.path))?;
            return Ok(value.map(|v| v.value().to_vec()));
        }

        let path = self.path.clone();
        let txn = self.write_txn()?;
        let table = txn.open_table(RECORDS).map_err(StoreError::engine(&path))?;
        let value = table.get(key).map_err(StoreError::engine(&path))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put(&mut self, key: &[u8], value: &[u8], unique: bool) -> Result<PutOutcome, StoreError> {
        let path = self.path.clone();
        let txn = self.write_txn()?;
        let mut table = txn.open_table(RECORDS).map_err(StoreError::engine(&path))?;
        if unique && table.get(key).map_err(StoreError::engine(&path))?.is_some() {
            return Ok(PutOutcome::Exists);
        }
        let previous = table.insert(key, value).map_err(StoreError::engine(&path))?;
        Ok(match previous {
            Some(_) => PutOutcome::Overwritten,
            None => PutOutcome::Inserted,
        })
    }

    fn seek(&mut self, seek: Seek<'_>) -> Result<Option<Entry>, StoreError> {
        if let Session::Read(txn) = &self.session {
            return match txn.open_table(RECORDS) {
                Ok(table) => seek_in(&table, seek).map_err(StoreError::engine(&self.path)),
                Err(TableError::TableDoesNotExist(_)) => Ok(None),
                Err(e) => Err(StoreError::engine(&self.path)(e)),
            };
        }

        let path = self.path.clone();
        let txn = self.write_txn()?;
        let table = txn.open_table(RECORDS).map_err(StoreError::engine(&path))?;
        seek_in(&table, seek).map_err(StoreError::engine(&path))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if let Session::Write(txn) = &mut self.session {
            if let Some(txn) = txn.take() {
                txn.commit().map_err(StoreError::engine(&self.path))?;
            }
        }
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        // The transaction and database belong to the parent process; running
        // their destructors here would release its locks and rewrite state.
        mem::forget(self);
    }
}
