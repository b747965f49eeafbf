//! Id spaces: the per-relationship namespaces of session objects
//!
//! A session object lives in exactly two id spaces while alive, one on the
//! client side and one on the server side of the parent relationship. Ids
//! may be picked by the space or imposed by the caller; imposing a taken
//! id is a protocol error reported as a conflict.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier within one id space
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub u64);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdSpaceError {
    #[error("id {0} is already in use")]
    ConflictingId(u64),

    #[error("unknown id {0}")]
    UnknownId(u64),
}

struct Inner<T> {
    map: BTreeMap<u64, T>,
    next: u64,
}

/// Lock-guarded id-to-object map
pub struct IdSpace<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> IdSpace<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                next: 1,
            }),
        }
    }

    /// Insert under a fresh id picked by the space
    pub fn insert(&self, value: T) -> Id {
        let mut inner = self.inner.lock().unwrap();
        while inner.map.contains_key(&inner.next) {
            inner.next += 1;
        }
        let id = inner.next;
        inner.next += 1;
        inner.map.insert(id, value);
        Id(id)
    }

    /// Insert under a caller-imposed id
    pub fn insert_at(&self, id: Id, value: T) -> Result<(), IdSpaceError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&id.0) {
            return Err(IdSpaceError::ConflictingId(id.0));
        }
        inner.map.insert(id.0, value);
        Ok(())
    }

    pub fn remove(&self, id: Id) -> Result<T, IdSpaceError> {
        self.inner
            .lock()
            .unwrap()
            .map
            .remove(&id.0)
            .ok_or(IdSpaceError::UnknownId(id.0))
    }

    pub fn contains(&self, id: Id) -> bool {
        self.inner.lock().unwrap().map.contains_key(&id.0)
    }

    /// Run a closure against the object behind `id`
    pub fn apply<R>(&self, id: Id, f: impl FnOnce(&mut T) -> R) -> Result<R, IdSpaceError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .map
            .get_mut(&id.0)
            .map(f)
            .ok_or(IdSpaceError::UnknownId(id.0))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<Id> {
        self.inner.lock().unwrap().map.keys().map(|k| Id(*k)).collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(Id, &mut T)) {
        let mut inner = self.inner.lock().unwrap();
        for (id, value) in inner.map.iter_mut() {
            f(Id(*id), value);
        }
    }
}

impl<T> Default for IdSpace<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IdSpace<T> {
    pub fn get(&self, id: Id) -> Result<T, IdSpaceError> {
        self.inner
            .lock()
            .unwrap()
            .map
            .get(&id.0)
            .cloned()
            .ok_or(IdSpaceError::UnknownId(id.0))
    }
}
