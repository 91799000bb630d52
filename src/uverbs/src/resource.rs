use fnv::FnvHashMap;
use thiserror::Error;

use uverbs_api::Handle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Resource not found in the table")]
    NotFound,
    #[error("Table is full, please adjust its capacity in the configuration")]
    Exhausted,
}

/// Owns the objects of one kind under one parent, keyed by caller-visible handles.
///
/// Handles come from a per-table monotonic counter starting at 1 and are never reused while the
/// table lives, so a stale handle can only ever miss.
#[derive(Debug)]
pub struct ResourceTable<R> {
    table: FnvHashMap<Handle, R>,
    next: u32,
}

impl<R> Default for ResourceTable<R> {
    fn default() -> Self {
        ResourceTable {
            table: FnvHashMap::default(),
            next: 1,
        }
    }
}

impl<R> ResourceTable<R> {
    fn next_handle(&mut self) -> Result<Handle, Error> {
        let h = Handle(self.next);
        self.next = self.next.checked_add(1).ok_or(Error::Exhausted)?;
        Ok(h)
    }

    /// Installs `r` under a fresh handle.
    pub fn allocate(&mut self, r: R) -> Result<Handle, Error> {
        let h = self.next_handle()?;
        self.table.insert(h, r);
        Ok(h)
    }

    /// Like [`allocate`](Self::allocate) for objects that need to know their own handle. On
    /// failure nothing is installed.
    pub fn allocate_with<E, F>(&mut self, f: F) -> Result<Handle, E>
    where
        E: From<Error>,
        F: FnOnce(Handle) -> Result<R, E>,
    {
        let h = self.next_handle()?;
        let r = f(h)?;
        self.table.insert(h, r);
        Ok(h)
    }

    /// Removes the object and hands its ownership back to the caller.
    pub fn release(&mut self, h: Handle) -> Result<R, Error> {
        self.table.remove(&h).ok_or(Error::NotFound)
    }

    pub fn get(&self, h: Handle) -> Result<&R, Error> {
        self.table.get(&h).ok_or(Error::NotFound)
    }

    pub fn get_mut(&mut self, h: Handle) -> Result<&mut R, Error> {
        self.table.get_mut(&h).ok_or(Error::NotFound)
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.table.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut R> {
        self.table.values_mut()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
