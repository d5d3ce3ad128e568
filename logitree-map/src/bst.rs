//! A concurrent, lock-coupled binary search tree augmented with a logical
//! ordering linked list.
//!
//! Lookups walk the physical tree without taking any lock, then correct
//! against the logical `pred`/`succ` chain. Insert and delete take a
//! validation latch on the target's logical predecessor (and, for delete,
//! its successor) before touching any tree pointer, so the two layers never
//! disagree about membership even though they're updated at different
//! times.

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use logitree_core::{is_reserved, Error, Result, ValidationReport, MAX_KEY, MIN_KEY};
use parking_lot::{Mutex, MutexGuard};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::BackoffConfig;

#[repr(align(64))]
struct Node<V> {
    key: i32,
    valid: AtomicBool,
    value: Option<V>,
    pred: Atomic<Node<V>>,
    succ: Atomic<Node<V>>,
    parent: Atomic<Node<V>>,
    left: Atomic<Node<V>>,
    right: Atomic<Node<V>>,
    succ_lock: Mutex<()>,
    tree_lock: Mutex<()>,
}

impl<V> Node<V> {
    fn new(key: i32, value: Option<V>) -> Self {
        Self {
            key,
            valid: AtomicBool::new(true),
            value,
            pred: Atomic::null(),
            succ: Atomic::null(),
            parent: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            succ_lock: Mutex::new(()),
            tree_lock: Mutex::new(()),
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// Outcome of [`BstMap::acquire_tree_locks`]: the set of tree locks needed
/// to physically detach a node, held for the duration of the splice.
enum AcquiredLocks<'g, V> {
    /// `node` has zero or one children; `left`/`right` are locked iff
    /// present.
    OneOrNoChildren {
        node_guard: MutexGuard<'g, ()>,
        left_guard: Option<MutexGuard<'g, ()>>,
        right_guard: Option<MutexGuard<'g, ()>>,
    },
    /// `node` has two children; the in-order successor branch is locked so
    /// it can be promoted into `node`'s slot.
    TwoChildren {
        node_guard: MutexGuard<'g, ()>,
        succ_parent: Shared<'g, Node<V>>,
        succ_parent_guard: Option<MutexGuard<'g, ()>>,
        succ: Shared<'g, Node<V>>,
        succ_guard: MutexGuard<'g, ()>,
        succ_right: Option<Shared<'g, Node<V>>>,
        succ_right_guard: Option<MutexGuard<'g, ()>>,
    },
}

/// Try-locks `n`'s tree lock. Returns `Some(None)` immediately if `n` is
/// null (nothing to lock), `Some(Some(guard))` on success, and `None` if
/// `n` is non-null and the trylock failed (caller must back off and
/// restart the whole acquisition).
fn try_lock_optional<V>(n: Shared<'_, Node<V>>) -> Option<Option<MutexGuard<'_, ()>>> {
    if n.is_null() {
        Some(None)
    } else {
        unsafe { n.as_ref() }.unwrap().tree_lock.try_lock().map(Some)
    }
}

/// A concurrent ordered map of `i32` keys to `V` values, backed by a
/// lock-coupled binary search tree with no self-balancing.
///
/// See the crate-level documentation for the concurrency protocol. `BstMap`
/// never rebalances, so adversarial (e.g. sorted) insertion orders degrade
/// to a linked list; use [`crate::AvlMap`] when bounded height matters.
pub struct BstMap<V> {
    low: Atomic<Node<V>>,
    high: Atomic<Node<V>>,
    backoff: BackoffConfig,
}

impl<V> Default for BstMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> BstMap<V> {
    /// Creates an empty map with its two sentinel nodes already wired
    /// together.
    pub fn new() -> Self {
        let low = Atomic::new(Node::new(MIN_KEY, None));
        let high = Atomic::new(Node::new(MAX_KEY, None));
        let guard = &epoch::pin();
        let low_shared = low.load(Ordering::Acquire, guard);
        let high_shared = high.load(Ordering::Acquire, guard);
        unsafe {
            let low_ref = low_shared.as_ref().unwrap();
            let high_ref = high_shared.as_ref().unwrap();
            low_ref.succ.store(high_shared, Ordering::Release);
            low_ref.pred.store(high_shared, Ordering::Release);
            high_ref.pred.store(low_shared, Ordering::Release);
            high_ref.succ.store(low_shared, Ordering::Release);
            high_ref.parent.store(low_shared, Ordering::Release);
        }
        Self {
            low,
            high,
            backoff: BackoffConfig::default(),
        }
    }

    /// Variant name, for diagnostics.
    pub fn name(&self) -> &'static str {
        "bst-logical-ordering"
    }

    fn descend<'g>(&self, key: i32, guard: &'g Guard) -> Shared<'g, Node<V>> {
        let mut node = self.high.load(Ordering::Acquire, guard);
        loop {
            let node_ref = unsafe { node.as_ref() }.unwrap();
            if key == node_ref.key {
                return node;
            }
            let child = if key < node_ref.key {
                node_ref.left.load(Ordering::Acquire, guard)
            } else {
                node_ref.right.load(Ordering::Acquire, guard)
            };
            if child.is_null() {
                return node;
            }
            node = child;
        }
    }

    /// Returns whether `key` is currently a member of the map.
    pub fn lookup(&self, key: i32) -> Result<bool> {
        if is_reserved(key) {
            return Err(Error::ReservedKey(key));
        }
        let guard = &epoch::pin();
        let mut node = self.descend(key, guard);
        let mut node_ref = unsafe { node.as_ref() }.unwrap();

        if node_ref.key >= key {
            while node_ref.key > key {
                node = node_ref.pred.load(Ordering::Acquire, guard);
                node_ref = unsafe { node.as_ref() }.unwrap();
            }
        } else {
            while node_ref.key < key {
                node = node_ref.succ.load(Ordering::Acquire, guard);
                node_ref = unsafe { node.as_ref() }.unwrap();
            }
        }

        Ok(node_ref.key == key && node_ref.is_valid())
    }

    /// Inserts `key` with `value`. Returns `Ok(true)` if the key was
    /// previously absent, `Ok(false)` if it was already present (the map is
    /// unchanged in that case).
    pub fn insert(&self, key: i32, value: V) -> Result<bool> {
        if is_reserved(key) {
            return Err(Error::ReservedKey(key));
        }
        let guard = &epoch::pin();
        let mut spins = 0u32;

        loop {
            let n = self.descend(key, guard);
            let n_ref = unsafe { n.as_ref() }.unwrap();
            let p = if n_ref.key >= key {
                n_ref.pred.load(Ordering::Acquire, guard)
            } else {
                n
            };
            let p_ref = unsafe { p.as_ref() }.unwrap();
            let p_guard = p_ref.succ_lock.lock();

            let s = p_ref.succ.load(Ordering::Acquire, guard);
            let s_ref = unsafe { s.as_ref() }.unwrap();

            if !(p_ref.is_valid() && p_ref.key < key && key <= s_ref.key) {
                drop(p_guard);
                log::trace!("{}: insert({key}) validation failed, retrying", self.name());
                self.backoff.backoff_once(spins);
                spins = spins.wrapping_add(1);
                continue;
            }
            if s_ref.key == key {
                return Ok(false);
            }

            let mut parent = if n == p || n == s { n } else { p };
            let mut use_p_side = parent == p;
            let parent_guard = loop {
                let parent_ref = unsafe { parent.as_ref() }.unwrap();
                let pg = parent_ref.tree_lock.lock();
                let occupied = if use_p_side {
                    !parent_ref.right.load(Ordering::Acquire, guard).is_null()
                } else {
                    !parent_ref.left.load(Ordering::Acquire, guard).is_null()
                };
                if !occupied {
                    break pg;
                }
                drop(pg);
                parent = if use_p_side { s } else { p };
                use_p_side = !use_p_side;
            };

            let new_node = Owned::new(Node::new(key, Some(value))).into_shared(guard);
            let new_ref = unsafe { new_node.as_ref() }.unwrap();
            new_ref.pred.store(p, Ordering::Relaxed);
            new_ref.succ.store(s, Ordering::Relaxed);
            new_ref.parent.store(parent, Ordering::Relaxed);

            s_ref.pred.store(new_node, Ordering::Release);
            p_ref.succ.store(new_node, Ordering::Release);
            drop(p_guard);

            let parent_ref = unsafe { parent.as_ref() }.unwrap();
            if use_p_side {
                parent_ref.right.store(new_node, Ordering::Release);
            } else {
                parent_ref.left.store(new_node, Ordering::Release);
            }
            drop(parent_guard);

            return Ok(true);
        }
    }

    fn lock_parent<'g>(
        &self,
        n: Shared<'g, Node<V>>,
        guard: &'g Guard,
    ) -> (Shared<'g, Node<V>>, MutexGuard<'g, ()>) {
        let mut spins = 0u32;
        loop {
            let n_ref = unsafe { n.as_ref() }.unwrap();
            let p = n_ref.parent.load(Ordering::Acquire, guard);
            let p_ref = unsafe { p.as_ref() }.unwrap();
            let p_guard = p_ref.tree_lock.lock();
            if n_ref.parent.load(Ordering::Acquire, guard) == p && p_ref.is_valid() {
                return (p, p_guard);
            }
            drop(p_guard);
            log::trace!("{}: lock_parent retry, parent rotated away", self.name());
            self.backoff.backoff_once(spins);
            spins = spins.wrapping_add(1);
        }
    }

    fn acquire_tree_locks<'g>(
        &self,
        n: Shared<'g, Node<V>>,
        guard: &'g Guard,
    ) -> AcquiredLocks<'g, V> {
        loop {
            let n_ref = unsafe { n.as_ref() }.unwrap();
            let node_guard = n_ref.tree_lock.lock();
            let left = n_ref.left.load(Ordering::Acquire, guard);
            let right = n_ref.right.load(Ordering::Acquire, guard);

            if left.is_null() || right.is_null() {
                let left_guard = match try_lock_optional(left) {
                    Some(g) => g,
                    None => continue,
                };
                let right_guard = match try_lock_optional(right) {
                    Some(g) => g,
                    None => continue,
                };
                return AcquiredLocks::OneOrNoChildren {
                    node_guard,
                    left_guard,
                    right_guard,
                };
            }

            let succ = n_ref.succ.load(Ordering::Acquire, guard);
            let succ_ref = unsafe { succ.as_ref() }.unwrap();
            let succ_parent = succ_ref.parent.load(Ordering::Acquire, guard);

            let succ_parent_guard = if succ_parent == n {
                None
            } else {
                let g = match try_lock_optional(succ_parent) {
                    Some(g) => g,
                    None => continue,
                };
                let sp_ref = unsafe { succ_parent.as_ref() }.unwrap();
                if succ_ref.parent.load(Ordering::Acquire, guard) != succ_parent
                    || !sp_ref.is_valid()
                {
                    continue;
                }
                g
            };

            let succ_guard = match succ_ref.tree_lock.try_lock() {
                Some(g) => g,
                None => continue,
            };

            let succ_right = succ_ref.right.load(Ordering::Acquire, guard);
            let succ_right_guard = match try_lock_optional(succ_right) {
                Some(g) => g,
                None => continue,
            };

            return AcquiredLocks::TwoChildren {
                node_guard,
                succ_parent,
                succ_parent_guard,
                succ,
                succ_guard,
                succ_right: if succ_right.is_null() {
                    None
                } else {
                    Some(succ_right)
                },
                succ_right_guard,
            };
        }
    }

    fn remove_from_tree<'g>(
        &self,
        s: Shared<'g, Node<V>>,
        s_parent: Shared<'g, Node<V>>,
        s_parent_guard: MutexGuard<'g, ()>,
        locks: AcquiredLocks<'g, V>,
        guard: &'g Guard,
    ) {
        let s_ref = unsafe { s.as_ref() }.unwrap();
        let s_parent_ref = unsafe { s_parent.as_ref() }.unwrap();
        let s_is_left = s_parent_ref.left.load(Ordering::Acquire, guard) == s;

        match locks {
            AcquiredLocks::OneOrNoChildren {
                node_guard,
                left_guard,
                right_guard,
            } => {
                let child = if left_guard.is_some() {
                    s_ref.left.load(Ordering::Acquire, guard)
                } else {
                    s_ref.right.load(Ordering::Acquire, guard)
                };
                if !child.is_null() {
                    unsafe { child.as_ref() }
                        .unwrap()
                        .parent
                        .store(s_parent, Ordering::Release);
                }
                if s_is_left {
                    s_parent_ref.left.store(child, Ordering::Release);
                } else {
                    s_parent_ref.right.store(child, Ordering::Release);
                }
                drop(node_guard);
                drop(left_guard);
                drop(right_guard);
                drop(s_parent_guard);
            }
            AcquiredLocks::TwoChildren {
                node_guard,
                succ_parent,
                succ_parent_guard,
                succ,
                succ_guard,
                succ_right,
                succ_right_guard,
            } => {
                let succ_ref = unsafe { succ.as_ref() }.unwrap();
                let s_left = s_ref.left.load(Ordering::Acquire, guard);
                let s_right = s_ref.right.load(Ordering::Acquire, guard);

                if succ_parent != s {
                    let sp_ref = unsafe { succ_parent.as_ref() }.unwrap();
                    let sr = succ_right.unwrap_or_else(Shared::null);
                    sp_ref.left.store(sr, Ordering::Release);
                    if let Some(sr) = succ_right {
                        unsafe { sr.as_ref() }
                            .unwrap()
                            .parent
                            .store(succ_parent, Ordering::Release);
                    }
                    succ_ref.right.store(s_right, Ordering::Release);
                    unsafe { s_right.as_ref() }
                        .unwrap()
                        .parent
                        .store(succ, Ordering::Release);
                } else {
                    let sr = succ_right.unwrap_or_else(Shared::null);
                    succ_ref.right.store(sr, Ordering::Release);
                    if let Some(sr) = succ_right {
                        unsafe { sr.as_ref() }
                            .unwrap()
                            .parent
                            .store(succ, Ordering::Release);
                    }
                }

                succ_ref.left.store(s_left, Ordering::Release);
                unsafe { s_left.as_ref() }
                    .unwrap()
                    .parent
                    .store(succ, Ordering::Release);
                succ_ref.parent.store(s_parent, Ordering::Release);

                if s_is_left {
                    s_parent_ref.left.store(succ, Ordering::Release);
                } else {
                    s_parent_ref.right.store(succ, Ordering::Release);
                }

                drop(node_guard);
                drop(succ_guard);
                drop(succ_right_guard);
                drop(succ_parent_guard);
                drop(s_parent_guard);
            }
        }
    }

    /// Removes `key`. Returns `Ok(true)` if it was present, `Ok(false)`
    /// otherwise.
    pub fn delete(&self, key: i32) -> Result<bool> {
        if is_reserved(key) {
            return Err(Error::ReservedKey(key));
        }
        let guard = &epoch::pin();
        let mut spins = 0u32;

        loop {
            let n = self.descend(key, guard);
            let n_ref = unsafe { n.as_ref() }.unwrap();
            let p = if n_ref.key >= key {
                n_ref.pred.load(Ordering::Acquire, guard)
            } else {
                n
            };
            let p_ref = unsafe { p.as_ref() }.unwrap();
            let p_guard = p_ref.succ_lock.lock();

            let s = p_ref.succ.load(Ordering::Acquire, guard);
            let s_ref = unsafe { s.as_ref() }.unwrap();

            if !(p_ref.is_valid() && p_ref.key < key && key <= s_ref.key) {
                drop(p_guard);
                log::trace!("{}: delete({key}) validation failed, retrying", self.name());
                self.backoff.backoff_once(spins);
                spins = spins.wrapping_add(1);
                continue;
            }
            if s_ref.key != key {
                return Ok(false);
            }

            let s_guard = s_ref.succ_lock.lock();
            let locks = self.acquire_tree_locks(s, guard);
            let (s_parent, s_parent_guard) = self.lock_parent(s, guard);

            s_ref.valid.store(false, Ordering::Release);
            let s_succ = s_ref.succ.load(Ordering::Acquire, guard);
            let s_succ_ref = unsafe { s_succ.as_ref() }.unwrap();
            s_succ_ref.pred.store(p, Ordering::Release);
            p_ref.succ.store(s_succ, Ordering::Release);
            drop(s_guard);
            drop(p_guard);

            self.remove_from_tree(s, s_parent, s_parent_guard, locks, guard);

            unsafe {
                guard.defer_destroy(s);
            }
            return Ok(true);
        }
    }

    /// Seeds `rand`'s `StdRng` from `seed` and inserts distinct random keys
    /// drawn from `0..max_key` until `n` of them succeed. Returns the
    /// number of successful insertions (always `n` unless `max_key` is too
    /// small to hold that many distinct keys). `force` is accepted for
    /// interface parity with the historical warmup routine this is
    /// modeled on; this port has no use for it since every insertion
    /// attempt already retries internally until it lands.
    pub fn warmup(&self, n: usize, max_key: i32, seed: u64, _force: bool) -> usize
    where
        V: Default,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = max_key.max(1);
        let mut inserted = 0;
        let mut attempts = 0usize;
        let max_attempts = n.saturating_mul(64).max(1024);
        while inserted < n && attempts < max_attempts {
            let key = rng.gen_range(0..bound);
            attempts += 1;
            if is_reserved(key) {
                continue;
            }
            if self.insert(key, V::default()).unwrap_or(false) {
                inserted += 1;
            }
        }
        inserted
    }

    /// Runs a single-threaded structural check and logs the result at
    /// `info` level. Returns whether every invariant held.
    pub fn validate(&self) -> bool {
        let report = self.validate_report();
        log::info!(
            "{}: validated {} nodes ({} via list walk), valid = {}",
            self.name(),
            report.node_count,
            report.list_count,
            report.is_valid()
        );
        report.is_valid()
    }

    /// Same check as [`Self::validate`] but returns the full structured
    /// report instead of just a boolean.
    pub fn validate_report(&self) -> ValidationReport {
        let guard = &epoch::pin();
        let mut report = ValidationReport {
            min_path_len: usize::MAX,
            ..Default::default()
        };

        let root = self.high.load(Ordering::Acquire, guard);
        self.validate_subtree(root, MIN_KEY, MAX_KEY, 0, &mut report, guard);
        if report.node_count == 0 {
            report.min_path_len = 0;
        }

        let low = self.low.load(Ordering::Acquire, guard);
        let mut node = unsafe { low.as_ref() }.unwrap().succ.load(Ordering::Acquire, guard);
        while node != self.high.load(Ordering::Acquire, guard) {
            let node_ref = unsafe { node.as_ref() }.unwrap();
            report.list_count += 1;
            let succ = node_ref.succ.load(Ordering::Acquire, guard);
            let succ_ref = unsafe { succ.as_ref() }.unwrap();
            if succ_ref.pred.load(Ordering::Acquire, guard) != node {
                report.list_violations += 1;
            }
            node = succ;
        }

        report
    }

    fn validate_subtree<'g>(
        &self,
        node: Shared<'g, Node<V>>,
        low: i32,
        high: i32,
        depth: usize,
        report: &mut ValidationReport,
        guard: &'g Guard,
    ) {
        if node.is_null() {
            return;
        }
        let node_ref = unsafe { node.as_ref() }.unwrap();
        let is_sentinel = node_ref.key == MIN_KEY || node_ref.key == MAX_KEY;
        if !is_sentinel {
            report.node_count += 1;
            if node_ref.key <= low || node_ref.key >= high {
                report.order_violations += 1;
            }
        }

        let left = node_ref.left.load(Ordering::Acquire, guard);
        let right = node_ref.right.load(Ordering::Acquire, guard);

        if left.is_null() && right.is_null() {
            report.max_path_len = report.max_path_len.max(depth);
            report.min_path_len = report.min_path_len.min(depth);
        }

        self.validate_subtree(left, low, node_ref.key, depth + 1, report, guard);
        self.validate_subtree(right, node_ref.key, high, depth + 1, report, guard);
    }
}

impl<V> Drop for BstMap<V> {
    fn drop(&mut self) {
        let guard = &epoch::pin();
        let mut stack = vec![self.high.load(Ordering::Acquire, guard)];
        while let Some(node) = stack.pop() {
            if node.is_null() {
                continue;
            }
            let node_ref = unsafe { node.as_ref() }.unwrap();
            stack.push(node_ref.left.load(Ordering::Acquire, guard));
            stack.push(node_ref.right.load(Ordering::Acquire, guard));
            unsafe {
                guard.defer_destroy(node);
            }
        }
        let low = self.low.load(Ordering::Acquire, guard);
        unsafe {
            guard.defer_destroy(low);
        }
    }
}

// BstMap automatically implements Send + Sync when V does, because:
// - Atomic<Node<V>> is Send + Sync when Node<V> is Send + Sync
// - Mutex<()> is Send + Sync unconditionally
// - Option<V> is Send + Sync when V is

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup() {
        let map: BstMap<i32> = BstMap::new();
        assert_eq!(map.insert(5, 50).unwrap(), true);
        assert_eq!(map.lookup(5).unwrap(), true);
        assert_eq!(map.lookup(4).unwrap(), false);
        assert!(map.validate());
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let map: BstMap<&str> = BstMap::new();
        assert_eq!(map.insert(1, "a").unwrap(), true);
        assert_eq!(map.insert(1, "b").unwrap(), false);
        assert_eq!(map.lookup(1).unwrap(), true);
    }

    #[test]
    fn delete_singleton() {
        let map: BstMap<i32> = BstMap::new();
        map.insert(5, 50).unwrap();
        assert_eq!(map.delete(5).unwrap(), true);
        assert_eq!(map.delete(5).unwrap(), false);
        assert_eq!(map.lookup(5).unwrap(), false);
        assert!(map.validate());
    }

    #[test]
    fn two_child_delete_promotes_successor() {
        let map: BstMap<i32> = BstMap::new();
        for k in [5, 3, 8, 1, 4, 7, 9] {
            map.insert(k, k).unwrap();
        }
        assert_eq!(map.delete(5).unwrap(), true);
        for k in [1, 3, 4, 7, 8, 9] {
            assert!(map.lookup(k).unwrap());
        }
        assert!(!map.lookup(5).unwrap());
        assert!(map.validate());
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let map: BstMap<i32> = BstMap::new();
        assert!(matches!(
            map.insert(MIN_KEY, 0),
            Err(Error::ReservedKey(_))
        ));
        assert!(matches!(
            map.lookup(MAX_KEY),
            Err(Error::ReservedKey(_))
        ));
    }

    #[test]
    fn warmup_inserts_requested_count() {
        let map: BstMap<i32> = BstMap::new();
        let inserted = map.warmup(50, 10_000, 42, false);
        assert_eq!(inserted, 50);
        assert!(map.validate());
    }
}
