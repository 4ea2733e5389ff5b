use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use tracing::{debug, trace};

use crate::arena::{load_node, Handle, Node, NodeArena};
use crate::config::{Config, DuplicatePolicy};
use crate::error::{Error, Result};
use crate::journal::JournalLedger;
use crate::ledger::{stored_header, Batch, Header, Ledger, MemoryLedger};
use crate::Value;

/// Notification fired after a mutation has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Inserted {
        value: Value,
        size: u64,
    },
    Removed {
        value: Value,
        occurrences: u64,
        size: u64,
    },
    /// The minimum was extracted by [`OrderedMultiset::pop`].
    Popped {
        value: Value,
        size: u64,
    },
}

type Subscriber = Box<dyn FnMut(&Event) + Send + Sync>;

// =============================================================================
// Tree
// =============================================================================

/// An ordered multiset of integers, kept as an unbalanced binary search tree
/// whose nodes live in a [`Ledger`].
///
/// Every mutation is staged in full and reaches the ledger as one batch, so the
/// committed tree is always valid. Nothing is rebalanced: inserting sorted
/// input produces a tree as deep as it is large.
pub struct OrderedMultiset<L = MemoryLedger> {
    ledger: L,
    config: Config,
    /// Last committed header.
    header: Header,
    subscribers: Vec<Subscriber>,
}

impl OrderedMultiset<MemoryLedger> {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            ledger: MemoryLedger::new(),
            header: Header::empty(config.duplicates),
            config,
            subscribers: Vec::new(),
        }
    }
}

impl Default for OrderedMultiset<MemoryLedger> {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedMultiset<JournalLedger> {
    /// Rewrite the journal as a single snapshot of the current tree.
    pub fn compact(&mut self) -> Result<()> {
        self.ledger.compact()
    }
}

impl<L: Ledger> OrderedMultiset<L> {
    /// Attach to the tree already stored in `ledger`, or to an empty tree if
    /// the ledger holds none.
    ///
    /// The duplicate policy is recorded with the tree; opening it with a
    /// different [`Config::duplicates`] fails with [`Error::PolicyMismatch`].
    pub fn open(ledger: L, config: Config) -> Result<Self> {
        let header = match stored_header(&ledger)? {
            Some(header) if header.duplicates != config.duplicates => {
                return Err(Error::PolicyMismatch {
                    stored: header.duplicates,
                    requested: config.duplicates,
                });
            }
            Some(header) => header,
            None => Header::empty(config.duplicates),
        };
        let tree = Self {
            ledger,
            config,
            header,
            subscribers: Vec::new(),
        };
        if tree.config.debug_checks {
            tree.check_invariants()?;
        }
        debug!(size = header.size, seq = tree.ledger.seq(), "opened tree");
        Ok(tree)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    /// Register a callback for committed mutations. Callbacks run inside the
    /// mutating call and must not mutate this tree.
    pub fn subscribe(&mut self, subscriber: impl FnMut(&Event) + Send + Sync + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Occurrences stored under [`DuplicatePolicy::Counted`], distinct values
    /// under [`DuplicatePolicy::Distinct`].
    #[inline]
    pub fn size(&self) -> u64 {
        self.header.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.root.is_none()
    }

    /// Add `value`, returning the new size.
    pub fn insert(&mut self, value: Value) -> Result<u64> {
        trace!(value, "insert");
        let mut arena = NodeArena::new(&self.ledger, self.header);
        let changed = arena.insert(value, self.config.duplicates)?;
        let staged = arena.finish();
        self.commit(staged)?;
        let size = self.size();
        if changed {
            self.emit(Event::Inserted { value, size });
        }
        Ok(size)
    }

    /// Remove one occurrence of `value` (the whole value under
    /// [`DuplicatePolicy::Distinct`]). Returns whether anything was removed;
    /// an absent value is not an error.
    pub fn remove(&mut self, value: Value) -> Result<bool> {
        Ok(self.remove_occurrences(value, self.single_removal())? > 0)
    }

    /// Remove every occurrence of `value`, returning how many there were.
    pub fn remove_all(&mut self, value: Value) -> Result<u64> {
        self.remove_occurrences(value, u64::MAX)
    }

    /// Occurrences dropped by `remove` and `pop`.
    fn single_removal(&self) -> u64 {
        match self.config.duplicates {
            DuplicatePolicy::Counted => 1,
            DuplicatePolicy::Distinct => u64::MAX,
        }
    }

    fn remove_occurrences(&mut self, value: Value, take: u64) -> Result<u64> {
        trace!(value, take, "remove");
        let mut arena = NodeArena::new(&self.ledger, self.header);
        let Some(found) = arena.find(value)? else {
            return Ok(0);
        };
        let removed = arena.take(found, take)?;
        let staged = arena.finish();
        self.commit(staged)?;
        self.emit(Event::Removed {
            value,
            occurrences: removed,
            size: self.size(),
        });
        Ok(removed)
    }

    /// Smallest stored value.
    pub fn peek(&self) -> Result<Value> {
        let root = self.header.root.ok_or(Error::EmptyTree)?;
        let mut node = load_node(&self.ledger, root)?;
        while let Some(left) = node.left {
            node = load_node(&self.ledger, left)?;
        }
        Ok(node.value)
    }

    /// Remove one occurrence of the smallest value and return it.
    pub fn pop(&mut self) -> Result<Value> {
        let mut arena = NodeArena::new(&self.ledger, self.header);
        let found = arena.min()?.ok_or(Error::EmptyTree)?;
        let value = found.node.value;
        trace!(value, "pop");
        arena.take(found, self.single_removal())?;
        let staged = arena.finish();
        self.commit(staged)?;
        self.emit(Event::Popped {
            value,
            size: self.size(),
        });
        Ok(value)
    }

    pub fn exists(&self, value: Value) -> Result<bool> {
        Ok(self.locate(value)?.is_some())
    }

    /// Number of occurrences of `value`; zero if absent.
    pub fn count(&self, value: Value) -> Result<u64> {
        Ok(self.locate(value)?.map_or(0, |node| node.occurrences))
    }

    /// All stored values in non-decreasing order.
    pub fn list(&self) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(usize::try_from(self.size()).unwrap_or(0));
        for value in self.iter() {
            out.push(value?);
        }
        Ok(out)
    }

    /// Lazy in-order traversal. Each value is yielded once per occurrence.
    pub fn iter(&self) -> Iter<'_, L> {
        Iter {
            ledger: &self.ledger,
            stack: Vec::new(),
            descend: self.header.root,
            repeat: None,
        }
    }

    fn locate(&self, value: Value) -> Result<Option<Node>> {
        let mut current = self.header.root;
        while let Some(handle) = current {
            let node = load_node(&self.ledger, handle)?;
            current = match value.cmp(&node.value) {
                Ordering::Equal => return Ok(Some(node)),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        Ok(None)
    }

    /// Commit a staged mutation. An `Err` from the ledger means nothing was
    /// applied. An `Err` from the invariant walk enabled by
    /// [`Config::debug_checks`] comes after the batch is durable: it reports a
    /// defect in the stored tree, not a rollback.
    fn commit(&mut self, (header, batch): (Header, Batch)) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let writes = batch.len();
        let seq = self.ledger.commit(batch)?;
        self.header = header;
        debug!(seq, writes, size = header.size, "committed");
        if self.config.debug_checks {
            self.check_invariants()?;
        }
        Ok(())
    }

    fn emit(&mut self, event: Event) {
        for subscriber in &mut self.subscribers {
            subscriber(&event);
        }
    }

    /// Walk the whole tree and verify its structural invariants: search
    /// ordering, reachability of every stored node, occurrence counts and the
    /// stored size.
    pub fn check_invariants(&self) -> Result<()> {
        fn fail<T>(msg: String) -> Result<T> {
            Err(Error::Invariant(msg))
        }

        let header = stored_header(&self.ledger)?
            .unwrap_or(Header::empty(self.config.duplicates));
        if header != self.header {
            return fail(format!(
                "cached header {:?} differs from ledger {:?}",
                self.header, header
            ));
        }
        if header.root.is_none() != (header.size == 0) {
            return fail(format!(
                "root {:?} inconsistent with size {}",
                header.root, header.size
            ));
        }

        let mut seen = HashSet::new();
        let mut occurrences = 0u64;
        // (handle, exclusive lower bound, exclusive upper bound)
        let mut stack: Vec<(Handle, Option<Value>, Option<Value>)> = Vec::new();
        if let Some(root) = header.root {
            stack.push((root, None, None));
        }
        while let Some((handle, lo, hi)) = stack.pop() {
            if !seen.insert(handle) {
                return fail(format!("node {handle} is reachable twice"));
            }
            if handle.get() >= header.next_handle {
                return fail(format!(
                    "node {handle} was never allocated (next {})",
                    header.next_handle
                ));
            }
            let node = load_node(&self.ledger, handle)?;
            if lo.is_some_and(|lo| node.value <= lo) || hi.is_some_and(|hi| node.value >= hi) {
                return fail(format!(
                    "node {handle} value {} outside ({lo:?}, {hi:?})",
                    node.value
                ));
            }
            if node.occurrences == 0 {
                return fail(format!("node {handle} has no occurrences"));
            }
            if self.config.duplicates == DuplicatePolicy::Distinct && node.occurrences != 1 {
                return fail(format!(
                    "node {handle} holds {} occurrences in a distinct tree",
                    node.occurrences
                ));
            }
            occurrences += node.occurrences;
            if let Some(left) = node.left {
                stack.push((left, lo, Some(node.value)));
            }
            if let Some(right) = node.right {
                stack.push((right, Some(node.value), hi));
            }
        }

        if occurrences != header.size {
            return fail(format!(
                "size {} but {} occurrences reachable",
                header.size, occurrences
            ));
        }
        let stored = self.ledger.node_cells();
        if stored != seen.len() {
            return fail(format!(
                "{stored} node cells stored but {} reachable",
                seen.len()
            ));
        }
        Ok(())
    }
}

impl<L: Ledger> fmt::Debug for OrderedMultiset<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMultiset")
            .field("size", &self.header.size)
            .field("root", &self.header.root)
            .field("seq", &self.ledger.seq())
            .field("duplicates", &self.config.duplicates)
            .finish()
    }
}

// =============================================================================
// Structural edits
// =============================================================================

/// The child pointer that refers to a node.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Root,
    Left(Handle),
    Right(Handle),
}

/// A located node together with the pointer that leads to it.
#[derive(Debug, Clone, Copy)]
struct Found {
    slot: Slot,
    handle: Handle,
    node: Node,
}

impl<L: Ledger + ?Sized> NodeArena<'_, L> {
    /// Returns `false` if the tree did not change.
    fn insert(&mut self, value: Value, duplicates: DuplicatePolicy) -> Result<bool> {
        let Some(mut at) = self.root() else {
            let handle = self.allocate(value)?;
            self.set_root(Some(handle));
            self.grow(1);
            return Ok(true);
        };

        loop {
            let mut node = self.get(at)?;
            let next = match value.cmp(&node.value) {
                Ordering::Equal => {
                    return Ok(match duplicates {
                        DuplicatePolicy::Counted => {
                            node.occurrences += 1;
                            self.put(at, node);
                            self.grow(1);
                            true
                        }
                        DuplicatePolicy::Distinct => false,
                    });
                }
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
            match next {
                Some(child) => at = child,
                None => {
                    let handle = self.allocate(value)?;
                    if value < node.value {
                        node.left = Some(handle);
                    } else {
                        node.right = Some(handle);
                    }
                    self.put(at, node);
                    self.grow(1);
                    return Ok(true);
                }
            }
        }
    }

    fn find(&self, value: Value) -> Result<Option<Found>> {
        let mut slot = Slot::Root;
        let mut current = self.root();
        while let Some(handle) = current {
            let node = self.get(handle)?;
            match value.cmp(&node.value) {
                Ordering::Equal => return Ok(Some(Found { slot, handle, node })),
                Ordering::Less => {
                    slot = Slot::Left(handle);
                    current = node.left;
                }
                Ordering::Greater => {
                    slot = Slot::Right(handle);
                    current = node.right;
                }
            }
        }
        Ok(None)
    }

    fn min(&self) -> Result<Option<Found>> {
        match self.root() {
            Some(root) => self.leftmost(Slot::Root, root).map(Some),
            None => Ok(None),
        }
    }

    fn leftmost(&self, mut slot: Slot, mut handle: Handle) -> Result<Found> {
        loop {
            let node = self.get(handle)?;
            match node.left {
                Some(left) => {
                    slot = Slot::Left(handle);
                    handle = left;
                }
                None => return Ok(Found { slot, handle, node }),
            }
        }
    }

    fn set_slot(&mut self, slot: Slot, child: Option<Handle>) -> Result<()> {
        match slot {
            Slot::Root => self.set_root(child),
            Slot::Left(parent) => {
                let mut node = self.get(parent)?;
                node.left = child;
                self.put(parent, node);
            }
            Slot::Right(parent) => {
                let mut node = self.get(parent)?;
                node.right = child;
                self.put(parent, node);
            }
        }
        Ok(())
    }

    /// Drop up to `take` occurrences from a located node, unlinking it once
    /// none remain. Returns the number of occurrences dropped.
    fn take(&mut self, found: Found, take: u64) -> Result<u64> {
        let Found { handle, mut node, .. } = found;
        let taken = take.min(node.occurrences);
        if taken < node.occurrences {
            node.occurrences -= taken;
            self.put(handle, node);
        } else {
            self.unlink(found)?;
        }
        self.shrink(taken)?;
        Ok(taken)
    }

    fn unlink(&mut self, found: Found) -> Result<()> {
        let Found { slot, handle, node } = found;
        match (node.left, node.right) {
            (None, child) | (child, None) => {
                self.set_slot(slot, child)?;
                self.free(handle);
            }
            (Some(_), Some(right)) => {
                // Replace the contents with the in-order successor, then splice
                // the successor out. It has no left child, so its right subtree
                // takes its place.
                let successor = self.leftmost(Slot::Right(handle), right)?;
                self.set_slot(successor.slot, successor.node.right)?;
                self.free(successor.handle);

                let mut target = self.get(handle)?;
                target.value = successor.node.value;
                target.occurrences = successor.node.occurrences;
                self.put(handle, target);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// In-order iterator returned by [`OrderedMultiset::iter`].
///
/// Nodes are read from the ledger as the traversal reaches them. A read failure
/// is yielded once and ends the iteration.
pub struct Iter<'a, L: ?Sized> {
    ledger: &'a L,
    /// Nodes whose left subtree is being visited.
    stack: Vec<Node>,
    /// Subtree to descend into before popping `stack`.
    descend: Option<Handle>,
    /// Value being repeated and how many more times.
    repeat: Option<(Value, u64)>,
}

impl<L: Ledger + ?Sized> Iterator for Iter<'_, L> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((value, remaining)) = self.repeat {
                if remaining > 0 {
                    self.repeat = Some((value, remaining - 1));
                    return Some(Ok(value));
                }
                self.repeat = None;
            }

            let mut current = self.descend.take();
            while let Some(handle) = current {
                match load_node(self.ledger, handle) {
                    Ok(node) => {
                        current = node.left;
                        self.stack.push(node);
                    }
                    Err(err) => {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                }
            }

            let node = self.stack.pop()?;
            self.descend = node.right;
            self.repeat = Some((node.value, node.occurrences));
        }
    }
}
