use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;
use std::io;

fn validate_tree<L: Ledger>(t: &OrderedMultiset<L>) {
    t.check_invariants().expect("tree invariants");

    let listed = t.list().expect("list");
    assert!(
        listed.windows(2).all(|w| w[0] <= w[1]),
        "list must be non-decreasing: {listed:?}"
    );
    assert_eq!(listed.len() as u64, t.size(), "list length must match size");
    assert_eq!(t.is_empty(), t.size() == 0);
    assert_eq!(t.peek().ok(), listed.first().copied());
}

/// Reference multiset.
struct Model {
    policy: DuplicatePolicy,
    values: BTreeMap<Value, u64>,
}

impl Model {
    fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            values: BTreeMap::new(),
        }
    }

    fn insert(&mut self, v: Value) -> u64 {
        let n = self.values.entry(v).or_default();
        match self.policy {
            DuplicatePolicy::Counted => *n += 1,
            DuplicatePolicy::Distinct => *n = 1,
        }
        self.size()
    }

    fn take(&mut self, v: Value, take: u64) -> u64 {
        let Some(n) = self.values.get_mut(&v) else {
            return 0;
        };
        let taken = take.min(*n);
        *n -= taken;
        if *n == 0 {
            self.values.remove(&v);
        }
        taken
    }

    fn remove(&mut self, v: Value) -> bool {
        let take = match self.policy {
            DuplicatePolicy::Counted => 1,
            DuplicatePolicy::Distinct => u64::MAX,
        };
        self.take(v, take) > 0
    }

    fn pop(&mut self) -> Option<Value> {
        let v = *self.values.keys().next()?;
        self.remove(v);
        Some(v)
    }

    fn size(&self) -> u64 {
        self.values.values().sum()
    }

    fn list(&self) -> Vec<Value> {
        self.values
            .iter()
            .flat_map(|(&v, &n)| std::iter::repeat(v).take(n as usize))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 4)]
    Insert(#[proptest(strategy = "-16i64..16")] Value),
    #[proptest(weight = 2)]
    Remove(#[proptest(strategy = "-16i64..16")] Value),
    RemoveAll(#[proptest(strategy = "-16i64..16")] Value),
    #[proptest(weight = 2)]
    Pop,
    Peek,
    Count(#[proptest(strategy = "-16i64..16")] Value),
}

fn run_ops<L: Ledger>(
    t: &mut OrderedMultiset<L>,
    m: &mut Model,
    ops: Vec<Op>,
) -> std::result::Result<(), TestCaseError> {
    for op in ops {
        match op {
            Op::Insert(v) => {
                prop_assert_eq!(t.insert(v).unwrap(), m.insert(v));
            }
            Op::Remove(v) => {
                prop_assert_eq!(t.remove(v).unwrap(), m.remove(v));
            }
            Op::RemoveAll(v) => {
                prop_assert_eq!(t.remove_all(v).unwrap(), m.take(v, u64::MAX));
                prop_assert!(!t.exists(v).unwrap());
            }
            Op::Pop => match m.pop() {
                Some(v) => {
                    prop_assert_eq!(t.pop().unwrap(), v);
                }
                None => {
                    prop_assert!(matches!(t.pop(), Err(Error::EmptyTree)));
                }
            },
            Op::Peek => {
                prop_assert_eq!(t.peek().ok(), m.values.keys().next().copied());
            }
            Op::Count(v) => {
                prop_assert_eq!(t.count(v).unwrap(), m.values.get(&v).copied().unwrap_or(0));
                prop_assert_eq!(t.exists(v).unwrap(), m.values.contains_key(&v));
            }
        }
        prop_assert_eq!(t.size(), m.size());
    }
    Ok(())
}

/// Ledger whose next commit can be made to fail.
struct FlakyLedger {
    inner: MemoryLedger,
    fail_next: bool,
}

impl Ledger for FlakyLedger {
    fn load(&self, key: &CellKey) -> Result<Option<Cell>> {
        self.inner.load(key)
    }

    fn commit(&mut self, batch: Batch) -> Result<Seq> {
        if std::mem::take(&mut self.fail_next) {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "injected")));
        }
        self.inner.commit(batch)
    }

    fn seq(&self) -> Seq {
        self.inner.seq()
    }

    fn node_cells(&self) -> usize {
        self.inner.node_cells()
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_counted(ops in prop::collection::vec(any::<Op>(), 0..=300)) {
        let mut t = OrderedMultiset::new();
        let mut m = Model::new(DuplicatePolicy::Counted);
        run_ops(&mut t, &mut m, ops)?;
        validate_tree(&t);
        prop_assert_eq!(t.list().unwrap(), m.list());
    }

    #[test]
    fn prop_equivalence_distinct(ops in prop::collection::vec(any::<Op>(), 0..=300)) {
        let mut t = OrderedMultiset::with_config(
            Config::default().with_duplicates(DuplicatePolicy::Distinct),
        );
        let mut m = Model::new(DuplicatePolicy::Distinct);
        run_ops(&mut t, &mut m, ops)?;
        validate_tree(&t);
        prop_assert_eq!(t.list().unwrap(), m.list());
    }

    #[test]
    fn prop_failed_commit_changes_nothing(
        ops in prop::collection::vec((any::<Op>(), prop::bool::weighted(0.2)), 0..=200),
    ) {
        let ledger = FlakyLedger { inner: MemoryLedger::new(), fail_next: false };
        let mut t = OrderedMultiset::open(ledger, Config::default()).unwrap();
        let mut m = Model::new(DuplicatePolicy::Counted);

        for (op, fail) in ops {
            let before = t.list().unwrap();
            let seq = t.ledger().seq();
            // Only mutations that reach the ledger can fail.
            let mut shadow = Model { policy: m.policy, values: m.values.clone() };
            let changes = match op {
                Op::Insert(v) => { shadow.insert(v); true }
                Op::Remove(v) => shadow.remove(v),
                Op::RemoveAll(v) => shadow.take(v, u64::MAX) > 0,
                Op::Pop => shadow.pop().is_some(),
                Op::Peek | Op::Count(_) => false,
            };

            if fail && changes {
                let mut arm = t.into_ledger();
                arm.fail_next = true;
                t = OrderedMultiset::open(arm, Config::default()).unwrap();
                let result = match op {
                    Op::Insert(v) => t.insert(v).map(|_| ()),
                    Op::Remove(v) => t.remove(v).map(|_| ()),
                    Op::RemoveAll(v) => t.remove_all(v).map(|_| ()),
                    Op::Pop => t.pop().map(|_| ()),
                    Op::Peek | Op::Count(_) => unreachable!(),
                };
                prop_assert!(matches!(result, Err(Error::Io(_))));
                prop_assert_eq!(t.ledger().seq(), seq);
                prop_assert_eq!(t.list().unwrap(), before);
                prop_assert_eq!(t.size(), m.size());
            } else {
                run_ops(&mut t, &mut m, vec![op])?;
            }
            validate_tree(&t);
        }
        prop_assert_eq!(t.list().unwrap(), m.list());
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_insert_order_small_set() {
    let values: Vec<Value> = vec![4, 2, 6, 1, 3, 5];

    for_each_permutation(&values, |perm| {
        let mut t = OrderedMultiset::new();
        for v in perm {
            t.insert(v).unwrap();
        }
        validate_tree(&t);
        assert_eq!(t.list().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    });
}

#[test]
fn exhaustive_remove_order_small_set() {
    // Every shape of the remove path is hit: leaves, single children on both
    // sides, two children with and without a direct right successor.
    let values: Vec<Value> = vec![4, 2, 6, 1, 3, 5, 7];

    let mut base = OrderedMultiset::new();
    for &v in &values {
        base.insert(v).unwrap();
    }
    let base_ledger = base.into_ledger();

    for_each_permutation(&values, |perm| {
        let mut t = OrderedMultiset::open(base_ledger.clone(), Config::default()).unwrap();
        let mut remaining: Vec<Value> = values.clone();
        remaining.sort_unstable();

        for v in perm {
            assert!(t.remove(v).unwrap());
            remaining.retain(|&r| r != v);
            assert_eq!(t.list().unwrap(), remaining);
            validate_tree(&t);
        }
        assert_eq!(t.size(), 0);
        assert!(t.is_empty());
        assert_eq!(t.ledger().node_cells(), 0);
    });
}

#[test]
fn exhaustive_pop_after_duplicates() {
    let values: Vec<Value> = vec![2, 1, 2, 3, 1];

    for_each_permutation(&values, |perm| {
        let mut t = OrderedMultiset::new();
        for v in perm {
            t.insert(v).unwrap();
        }
        let mut popped = Vec::new();
        while let Ok(v) = t.pop() {
            popped.push(v);
            validate_tree(&t);
        }
        assert_eq!(popped, vec![1, 1, 2, 2, 3]);
    });
}
