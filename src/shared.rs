//! Thread-safe handle to a tree.
//!
//! Mutations go through a single write lock, which puts them in one total
//! order. Reads share the lock and always observe a tree between commits.

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::Result;
use crate::ledger::{Ledger, MemoryLedger};
use crate::tree::{Event, OrderedMultiset};
use crate::Value;

pub struct SharedMultiset<L = MemoryLedger> {
    inner: RwLock<OrderedMultiset<L>>,
}

impl<L: Ledger> SharedMultiset<L> {
    pub fn new(tree: OrderedMultiset<L>) -> Self {
        Self {
            inner: RwLock::new(tree),
        }
    }

    pub fn insert(&self, value: Value) -> Result<u64> {
        self.inner.write().insert(value)
    }

    pub fn remove(&self, value: Value) -> Result<bool> {
        self.inner.write().remove(value)
    }

    pub fn remove_all(&self, value: Value) -> Result<u64> {
        self.inner.write().remove_all(value)
    }

    pub fn pop(&self) -> Result<Value> {
        self.inner.write().pop()
    }

    pub fn peek(&self) -> Result<Value> {
        self.inner.read().peek()
    }

    pub fn exists(&self, value: Value) -> Result<bool> {
        self.inner.read().exists(value)
    }

    pub fn count(&self, value: Value) -> Result<u64> {
        self.inner.read().count(value)
    }

    pub fn size(&self) -> u64 {
        self.inner.read().size()
    }

    pub fn list(&self) -> Result<Vec<Value>> {
        self.inner.read().list()
    }

    /// Callbacks run while the write lock is held. A callback that calls back
    /// into the same `SharedMultiset` deadlocks.
    pub fn subscribe(&self, subscriber: impl FnMut(&Event) + Send + Sync + 'static) {
        self.inner.write().subscribe(subscriber);
    }

    /// Hold the read lock for several queries against the same state.
    pub fn snapshot(&self) -> RwLockReadGuard<'_, OrderedMultiset<L>> {
        self.inner.read()
    }

    pub fn into_inner(self) -> OrderedMultiset<L> {
        self.inner.into_inner()
    }
}

impl<L: Ledger> From<OrderedMultiset<L>> for SharedMultiset<L> {
    fn from(tree: OrderedMultiset<L>) -> Self {
        Self::new(tree)
    }
}

impl Default for SharedMultiset<MemoryLedger> {
    fn default() -> Self {
        Self::new(OrderedMultiset::new())
    }
}
