//! Node arena.
//!
//! Tree nodes live in ledger cells keyed by [`Handle`]. A `NodeArena` is the
//! arena as seen by one operation: reads fall through to the committed cells,
//! writes are staged in an overlay and leave as a single [`Batch`], so a half
//! finished splice is never visible in the ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ledger::{Batch, Cell, CellKey, Header, Ledger};
use crate::Value;

/// Stable identifier of a tree node. Handles are allocated in increasing order
/// and never reused for the lifetime of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    pub const FIRST: Handle = Handle(NonZeroU64::MIN);

    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A tree node as stored in its cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub value: Value,
    pub left: Option<Handle>,
    pub right: Option<Handle>,
    /// Number of insertions folded into this node. Always at least 1.
    pub occurrences: u64,
}

impl Node {
    pub fn leaf(value: Value) -> Self {
        Self {
            value,
            left: None,
            right: None,
            occurrences: 1,
        }
    }
}

pub(crate) struct NodeArena<'l, L: ?Sized> {
    ledger: &'l L,
    header: Header,
    header_dirty: bool,
    /// `None` marks a node freed by this operation.
    staged: BTreeMap<Handle, Option<Node>>,
}

impl<'l, L: Ledger + ?Sized> NodeArena<'l, L> {
    pub fn new(ledger: &'l L, header: Header) -> Self {
        Self {
            ledger,
            header,
            header_dirty: false,
            staged: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn begin(ledger: &'l L) -> Result<Self> {
        Ok(Self::new(ledger, crate::ledger::load_header(ledger)?))
    }

    #[inline]
    pub fn root(&self) -> Option<Handle> {
        self.header.root
    }

    pub fn set_root(&mut self, root: Option<Handle>) {
        self.header.root = root;
        self.header_dirty = true;
    }

    #[cfg(test)]
    pub fn size(&self) -> u64 {
        self.header.size
    }

    pub fn grow(&mut self, by: u64) {
        self.header.size += by;
        self.header_dirty = true;
    }

    pub fn shrink(&mut self, by: u64) -> Result<()> {
        self.header.size = self.header.size.checked_sub(by).ok_or_else(|| {
            Error::Invariant(format!(
                "size {} cannot drop by {}",
                self.header.size, by
            ))
        })?;
        self.header_dirty = true;
        Ok(())
    }

    /// Create a childless node holding one occurrence of `value`.
    pub fn allocate(&mut self, value: Value) -> Result<Handle> {
        let handle = Handle::new(self.header.next_handle)
            .ok_or_else(|| Error::Invariant("next handle is zero".into()))?;
        self.header.next_handle = self
            .header
            .next_handle
            .checked_add(1)
            .ok_or_else(|| Error::Invariant("handle space exhausted".into()))?;
        self.header_dirty = true;
        self.staged.insert(handle, Some(Node::leaf(value)));
        Ok(handle)
    }

    pub fn free(&mut self, handle: Handle) {
        self.staged.insert(handle, None);
    }

    pub fn get(&self, handle: Handle) -> Result<Node> {
        match self.staged.get(&handle) {
            Some(Some(node)) => Ok(*node),
            Some(None) => Err(Error::CorruptState { handle }),
            None => load_node(self.ledger, handle),
        }
    }

    pub fn put(&mut self, handle: Handle, node: Node) {
        debug_assert!(node.occurrences >= 1);
        debug_assert!(
            !matches!(self.staged.get(&handle), Some(None)),
            "write to freed node {handle}"
        );
        self.staged.insert(handle, Some(node));
    }

    /// Close the operation, returning the resulting header and the batch
    /// that makes it durable.
    pub fn finish(self) -> (Header, Batch) {
        let mut batch = Batch::with_capacity(self.staged.len() + 1);
        if self.header_dirty {
            batch.put(CellKey::Header, Cell::Header(self.header));
        }
        for (handle, node) in self.staged {
            match node {
                Some(node) => batch.put(CellKey::Node(handle), Cell::Node(node)),
                None => batch.delete(CellKey::Node(handle)),
            }
        }
        (self.header, batch)
    }
}

/// Read a committed node. A missing cell means the handle is dangling.
pub(crate) fn load_node<L: Ledger + ?Sized>(ledger: &L, handle: Handle) -> Result<Node> {
    match ledger.load(&CellKey::Node(handle))? {
        Some(Cell::Node(node)) => Ok(node),
        _ => Err(Error::CorruptState { handle }),
    }
}
