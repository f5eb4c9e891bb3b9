use std::path::{Path, PathBuf};

use super::{Access, Entry, Seek, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, Default)]
enum Position {
    /// Before the first entry.
    #[default]
    Start,
    /// On the entry most recently yielded.
    At(Entry),
    /// Past the last entry.
    End,
}

/// Where an enumeration stands. The position is an owned copy of the last
/// entry yielded rather than an engine cursor, so it outlives the session
/// that produced it.
#[derive(Debug, Default)]
struct Cursor {
    position: Position,
    direction: Direction,
    replay: bool,
}

impl Cursor {
    fn step(&mut self, store: &mut Store, direction: Direction) -> Result<Option<Entry>, StoreError> {
        if std::mem::take(&mut self.replay) {
            if let Position::At(entry) = &self.position {
                return Ok(Some(entry.clone()));
            }
        }
        self.direction = direction;

        let seek = match (&self.position, direction) {
            (Position::Start, Direction::Forward) => Seek::First,
            (Position::End, Direction::Backward) => Seek::Last,
            (Position::Start, Direction::Backward) | (Position::End, Direction::Forward) => return Ok(None),
            (Position::At((key, _)), Direction::Forward) => Seek::After(key.as_slice()),
            (Position::At((key, _)), Direction::Backward) => Seek::Before(key.as_slice()),
        };
        let found = store.seek(seek)?;
        self.position = match &found {
            Some(entry) => Position::At(entry.clone()),
            None if direction == Direction::Forward => Position::End,
            None => Position::Start,
        };
        Ok(found)
    }
}

/// A named index file together with an optional open session and an
/// enumeration cursor.
///
/// Without `stay_open` the session is released after every enumeration
/// step and reopened on the next one; the cursor carries the position
/// across.
#[derive(Debug)]
pub struct Handle {
    path: PathBuf,
    store: Option<Store>,
    cursor: Cursor,
    stay_open: bool,
}

impl Handle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Handle {
            path: path.into(),
            store: None,
            cursor: Cursor::default(),
            stay_open: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub fn stay_open(&self) -> bool {
        self.stay_open
    }

    pub fn direction(&self) -> Direction {
        self.cursor.direction
    }

    /// Starts a fresh enumeration and opens the session.
    pub fn setent(&mut self, stay_open: bool) -> Result<(), StoreError> {
        self.close();
        self.stay_open = stay_open;
        self.with_session(|_, _| Ok(()))
    }

    pub fn endent(&mut self) {
        self.close();
        self.stay_open = false;
    }

    fn with_session<R>(&mut self, f: impl FnOnce(&mut Store, &mut Cursor) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut store = match self.store.take() {
            Some(store) => store,
            None => Store::open(&self.path, Access::ReadOnly)?,
        };
        let result = f(&mut store, &mut self.cursor);
        self.store = Some(store);
        result
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_session(|store, _| store.get(key))
    }

    pub fn cursor_next(&mut self) -> Result<Option<Entry>, StoreError> {
        self.with_session(|store, cursor| cursor.step(store, Direction::Forward))
    }

    pub fn cursor_prev(&mut self) -> Result<Option<Entry>, StoreError> {
        self.with_session(|store, cursor| cursor.step(store, Direction::Backward))
    }

    /// Steps in whichever direction the last explicit step went.
    pub fn cursor_step(&mut self) -> Result<Option<Entry>, StoreError> {
        let direction = self.cursor.direction;
        self.with_session(|store, cursor| cursor.step(store, direction))
    }

    /// Makes the next step yield the current entry again.
    pub fn rewind(&mut self) {
        if let Position::At(_) = self.cursor.position {
            self.cursor.replay = true;
        }
    }

    /// Ends the session unless the handle was asked to stay open. The cursor
    /// is kept.
    pub fn release(&mut self) {
        if !self.stay_open {
            self.close_session();
        }
    }

    /// Ends the session and forgets the cursor.
    pub fn close(&mut self) {
        self.close_session();
        self.cursor = Cursor::default();
    }

    fn close_session(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.close() {
                warning!("closing {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close_session();
    }
}
