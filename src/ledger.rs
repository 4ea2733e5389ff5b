//! Key-indexed persistent cells.
//!
//! The tree has no heap of its own: its header and every node occupy one cell
//! of a [`Ledger`], and each mutation reaches the ledger as a single [`Batch`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arena::{Handle, Node};
use crate::config::DuplicatePolicy;
use crate::error::{Error, Result};

/// Commit sequence number. `0` means nothing has been committed yet.
pub type Seq = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKey {
    Header,
    Node(Handle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Header(Header),
    Node(Node),
}

/// Tree-wide bookkeeping, stored under [`CellKey::Header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub root: Option<Handle>,
    pub size: u64,
    /// Raw value of the next handle to allocate.
    pub next_handle: u64,
    /// Policy the tree was created with. Headers written before the policy
    /// was recorded read back as counted.
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
}

impl Header {
    pub const EMPTY: Header = Header::empty(DuplicatePolicy::Counted);

    pub const fn empty(duplicates: DuplicatePolicy) -> Header {
        Header {
            root: None,
            size: 0,
            next_handle: 1,
            duplicates,
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// One cell write. `cell: None` deletes the cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellWrite {
    pub key: CellKey,
    pub cell: Option<Cell>,
}

/// Cell writes that must become visible together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    writes: Vec<CellWrite>,
}

impl From<Vec<CellWrite>> for Batch {
    fn from(writes: Vec<CellWrite>) -> Self {
        Self { writes }
    }
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            writes: Vec::with_capacity(n),
        }
    }

    pub fn put(&mut self, key: CellKey, cell: Cell) {
        self.writes.push(CellWrite {
            key,
            cell: Some(cell),
        });
    }

    pub fn delete(&mut self, key: CellKey) {
        self.writes.push(CellWrite { key, cell: None });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[CellWrite] {
        &self.writes
    }

    /// Apply every write to `cells`, in order.
    pub(crate) fn apply_to(&self, cells: &mut BTreeMap<CellKey, Cell>) {
        for write in &self.writes {
            match write.cell {
                Some(cell) => {
                    cells.insert(write.key, cell);
                }
                None => {
                    cells.remove(&write.key);
                }
            }
        }
    }
}

/// Storage substrate the tree is committed to.
///
/// Implementations must make `commit` atomic: after it returns `Ok` every write
/// in the batch is visible to `load`, and after it returns `Err` none is.
pub trait Ledger {
    fn load(&self, key: &CellKey) -> Result<Option<Cell>>;

    /// Commit `batch` and return its sequence number. Empty batches are
    /// accepted without advancing the sequence.
    fn commit(&mut self, batch: Batch) -> Result<Seq>;

    /// Sequence number of the last committed batch.
    fn seq(&self) -> Seq;

    /// Number of node cells currently stored.
    fn node_cells(&self) -> usize;
}

/// Read the tree header, if one has been committed.
pub(crate) fn stored_header<L: Ledger + ?Sized>(ledger: &L) -> Result<Option<Header>> {
    match ledger.load(&CellKey::Header)? {
        Some(Cell::Header(header)) => Ok(Some(header)),
        None => Ok(None),
        Some(Cell::Node(_)) => Err(Error::Invariant("header cell holds a node".into())),
    }
}

/// Read the tree header. A ledger without one holds an empty counted tree.
#[cfg(test)]
pub(crate) fn load_header<L: Ledger + ?Sized>(ledger: &L) -> Result<Header> {
    Ok(stored_header(ledger)?.unwrap_or(Header::EMPTY))
}

/// In-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    cells: BTreeMap<CellKey, Cell>,
    seq: Seq,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn load(&self, key: &CellKey) -> Result<Option<Cell>> {
        Ok(self.cells.get(key).copied())
    }

    fn commit(&mut self, batch: Batch) -> Result<Seq> {
        if batch.is_empty() {
            return Ok(self.seq);
        }
        batch.apply_to(&mut self.cells);
        self.seq += 1;
        Ok(self.seq)
    }

    fn seq(&self) -> Seq {
        self.seq
    }

    fn node_cells(&self) -> usize {
        // The header sorts first; everything after it is a node.
        self.cells.len() - usize::from(self.cells.contains_key(&CellKey::Header))
    }
}
