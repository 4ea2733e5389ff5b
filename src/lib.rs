//! # bst-ledger
//!
//! An ordered multiset of integers kept as a plain binary search tree inside a
//! key-indexed ledger.
//!
//! Nodes are addressed by integer [`Handle`]s instead of pointers, and every
//! node and the tree header occupy one cell of a [`Ledger`]. Each mutation is
//! staged against the committed cells and lands as a single atomic [`Batch`],
//! so the ledger never holds a half-spliced tree. [`JournalLedger`] makes the
//! ledger durable as an append-only journal.
//!
//! ## Example
//!
//! ```rust
//! use bst_ledger::{Error, OrderedMultiset};
//!
//! let mut tree = OrderedMultiset::new();
//! for v in [20, 10, 30, 10] {
//!     tree.insert(v).unwrap();
//! }
//!
//! assert_eq!(tree.size(), 4);
//! assert_eq!(tree.peek().unwrap(), 10);
//! assert_eq!(tree.pop().unwrap(), 10);
//! assert_eq!(tree.list().unwrap(), vec![10, 20, 30]);
//!
//! tree.remove_all(10).unwrap();
//! assert!(!tree.exists(10).unwrap());
//!
//! let mut empty = OrderedMultiset::new();
//! assert!(matches!(empty.pop(), Err(Error::EmptyTree)));
//! ```
//!
//! ## Duplicates
//!
//! With the default [`DuplicatePolicy::Counted`], equal values share one node
//! that counts its occurrences: `size` counts occurrences, `remove` and `pop`
//! take one occurrence and `remove_all` takes them all.
//! [`DuplicatePolicy::Distinct`] turns repeated inserts into no-ops and makes
//! every removal drop the value entirely.

pub mod arena;
pub mod config;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod shared;
pub mod tree;

pub use arena::{Handle, Node};
pub use config::{Config, DuplicatePolicy};
pub use error::{Error, Result};
pub use journal::JournalLedger;
pub use ledger::{Batch, Cell, CellKey, CellWrite, Header, Ledger, MemoryLedger, Seq};
pub use shared::SharedMultiset;
pub use tree::{Event, Iter, OrderedMultiset};

/// Element type stored in the tree.
pub type Value = i64;

#[cfg(test)]
mod proptests;
