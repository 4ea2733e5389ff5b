use serde::{Deserialize, Serialize};

/// How repeated insertions of the same value are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Every insertion adds an occurrence. `size` counts occurrences, `remove`
    /// takes one occurrence away and `remove_all` drops the value entirely.
    #[default]
    Counted,
    /// Repeated insertions are no-ops. `size` counts distinct values and any
    /// removal drops the value entirely.
    Distinct,
}

/// Configuration for a tree and the ledger it commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Duplicate-value policy. Recorded with the tree when it is first
    /// committed; reopening it with another policy fails.
    pub duplicates: DuplicatePolicy,
    /// `sync_data` the journal after every committed batch.
    pub sync_on_commit: bool,
    /// Walk the whole tree and verify its invariants after every commit. A
    /// failed walk is reported after the mutation is already durable.
    pub debug_checks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duplicates: DuplicatePolicy::Counted,
            sync_on_commit: true,
            debug_checks: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn with_duplicates(mut self, duplicates: DuplicatePolicy) -> Self {
        self.duplicates = duplicates;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn with_debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }
}
