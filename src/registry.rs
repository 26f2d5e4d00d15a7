//! The shared set of live connections.
//!
//! A single `Mutex` guards the whole collection and is held for every insert, removal and
//! traversal. Broadcasts run their writes from inside [`ConnectionRegistry::for_each`], so no two
//! broadcasts (or a broadcast and a membership change) ever overlap. That serialisation is what
//! gives every receiver the same relative order of chunks.
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::RegistryError;

/// Lock-guarded collection of connection handles, most recently inserted first.
pub struct ConnectionRegistry<H> {
    entries: Mutex<VecDeque<H>>,
}

impl<H> ConnectionRegistry<H> {
    pub fn new() -> ConnectionRegistry<H> {
        ConnectionRegistry {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> ConnectionRegistry<H> {
        ConnectionRegistry {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    // The deque is never left half-mutated by a panicking caller action, so a poisoned lock
    // still guards a valid collection.
    fn lock(&self) -> MutexGuard<'_, VecDeque<H>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `handle` at the head.
    ///
    /// Growth is reserved fallibly: if the allocation fails the registry is left exactly as it
    /// was and the handle is dropped.
    pub fn insert_front(&self, handle: H) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        entries
            .try_reserve(1)
            .map_err(|_| RegistryError::OutOfMemory)?;
        entries.push_front(handle);
        Ok(())
    }

    /// Remove every handle matching `predicate` in one pass and return how many went.
    ///
    /// Survivors keep their relative order.
    pub fn remove_matching<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&H) -> bool,
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|handle| !predicate(handle));
        before - entries.len()
    }

    /// Call `action` on every handle, head to tail, with the lock held throughout.
    ///
    /// `action` must not call back into this registry: the lock is not re-entrant and the
    /// thread would deadlock on itself. Anything it blocks on also blocks every other user of
    /// the registry until it returns.
    pub fn for_each<F>(&self, mut action: F)
    where
        F: FnMut(&H),
    {
        let entries = self.lock();
        for handle in entries.iter() {
            action(handle);
        }
    }

    /// Like [`for_each`](ConnectionRegistry::for_each), tail to head.
    pub fn for_each_back<F>(&self, mut action: F)
    where
        F: FnMut(&H),
    {
        let entries = self.lock();
        for handle in entries.iter().rev() {
            action(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every remaining handle out of the registry, head first.
    ///
    /// Meant for teardown once no worker can touch the registry any more.
    pub fn drain(&self) -> Vec<H> {
        self.lock().drain(..).collect()
    }
}

impl<H> Default for ConnectionRegistry<H> {
    fn default() -> ConnectionRegistry<H> {
        ConnectionRegistry::new()
    }
}

impl<H> fmt::Debug for ConnectionRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
