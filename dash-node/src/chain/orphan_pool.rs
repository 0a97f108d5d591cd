//! Orphan pool for items whose single blocking dependency is not yet known.
//!
//! The same pool type is used for transactions (keyed by `Txid`, waiting on a
//! source transaction) and for blocks (keyed by `BlockHash`, waiting on the
//! parent block). The pool never looks inside the items; callers decide what an
//! item depends on and how to commit it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

/// Maximum number of orphans to keep in memory
pub const MAX_ORPHANS: usize = 100;

/// Maximum time to keep an orphan before eviction
pub const ORPHAN_TIMEOUT: Duration = Duration::from_secs(900); // 15 minutes

/// An orphaned item with the hash it is waiting for
#[derive(Debug, Clone)]
pub struct OrphanEntry<K, T> {
    pub hash: K,
    pub item: T,
    pub depends_on: K,
    pub received_at: Instant,
}

/// Outcome of committing one orphan during [`OrphanPool::accept_children`].
#[derive(Debug)]
pub enum Promotion<K, E> {
    /// Committed; the orphan leaves the pool and its own children are tried next.
    Accepted,
    /// Expected race (missing dependency, conflicting spend). The orphan stays.
    /// When the commit discovered a different missing dependency, the orphan is
    /// re-indexed under it so that its arrival triggers another attempt.
    Deferred(Option<K>),
    /// Anything else. Aborts the promotion and is returned to the caller.
    Failed(E),
}

struct PoolState<K, T> {
    /// Entries in arrival order, oldest first.
    entries: IndexMap<K, OrphanEntry<K, T>>,
    /// Reverse index: dependency -> orphans waiting on it.
    dependents: HashMap<K, IndexSet<K>>,
}

impl<K: Copy + Eq + Hash, T> PoolState<K, T> {
    fn unindex(&mut self, hash: &K, depends_on: &K) {
        if let Some(children) = self.dependents.get_mut(depends_on) {
            children.shift_remove(hash);
            if children.is_empty() {
                self.dependents.remove(depends_on);
            }
        }
    }

    fn remove(&mut self, hash: &K) -> Option<OrphanEntry<K, T>> {
        let entry = self.entries.shift_remove(hash)?;
        self.unindex(hash, &entry.depends_on);
        Some(entry)
    }
}

/// Manages items that arrive before the item they depend on
pub struct OrphanPool<K, T> {
    /// Label used in log lines ("transaction", "block")
    kind: &'static str,
    state: Mutex<PoolState<K, T>>,
    /// Serializes whole promotion runs so two threads never promote the same children.
    accept_lock: Mutex<()>,
    max_orphans: usize,
    orphan_timeout: Duration,
}

impl<K, T> OrphanPool<K, T>
where
    K: Copy + Eq + Hash + fmt::Display + fmt::Debug,
{
    /// Creates a new orphan pool with default settings
    pub fn new(kind: &'static str) -> Self {
        Self::with_config(kind, MAX_ORPHANS, ORPHAN_TIMEOUT)
    }

    /// Creates a new orphan pool with custom configuration
    pub fn with_config(kind: &'static str, max_orphans: usize, orphan_timeout: Duration) -> Self {
        Self {
            kind,
            state: Mutex::new(PoolState {
                entries: IndexMap::new(),
                dependents: HashMap::new(),
            }),
            accept_lock: Mutex::new(()),
            max_orphans,
            orphan_timeout,
        }
    }

    /// Inserts or overwrites the orphan `hash`, waiting on `depends_on`.
    ///
    /// Returns `true` if the orphan was not in the pool before. When the pool is
    /// full the oldest orphan is evicted first.
    pub fn put_orphan(&self, hash: K, item: T, depends_on: K) -> bool {
        let mut state = self.state();

        let is_new = match state.remove(&hash) {
            Some(_) => {
                trace!("Replacing {} orphan {}", self.kind, hash);
                false
            }
            None => true,
        };

        while state.entries.len() >= self.max_orphans.max(1) {
            let oldest = match state.entries.first() {
                Some((oldest, _)) => *oldest,
                None => break,
            };
            state.remove(&oldest);
            debug!("Evicted oldest {} orphan {} due to size limit", self.kind, oldest);
        }

        state.entries.insert(
            hash,
            OrphanEntry {
                hash,
                item,
                depends_on,
                received_at: Instant::now(),
            },
        );
        state.dependents.entry(depends_on).or_default().insert(hash);

        debug!("Added {} orphan {} (waiting on {})", self.kind, hash, depends_on);
        is_new
    }

    /// Checks if an item is an orphan
    pub fn has_orphan(&self, hash: &K) -> bool {
        self.state().entries.contains_key(hash)
    }

    /// The hash `hash` is waiting on, if it is an orphan
    pub fn dependency_of(&self, hash: &K) -> Option<K> {
        self.state().entries.get(hash).map(|entry| entry.depends_on)
    }

    /// Removes an orphan. Orphans waiting on `hash` stay in the pool.
    pub fn del_orphan(&self, hash: &K) -> Option<T> {
        let removed = self.state().remove(hash)?;
        trace!("Removed {} orphan {}", self.kind, hash);
        Some(removed.item)
    }

    /// Direct children of `parent` (one level only).
    pub fn get_orphans_depending_on(&self, parent: &K) -> Vec<K> {
        self.state()
            .dependents
            .get(parent)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forgets which orphans wait on `parent`.
    pub fn remove_dependencies_on(&self, parent: &K) {
        self.state().dependents.remove(parent);
    }

    /// Follows `depends_on` upward while the dependency is itself an orphan and
    /// returns the topmost orphan. Its `depends_on` is the missing ancestor to
    /// request from peers. A hash that is not an orphan is returned unchanged.
    pub fn get_orphan_root(&self, hash: &K) -> K {
        let state = self.state();
        let mut current = *hash;

        // Bounded by the pool size so a corrupted chain of pointers cannot loop forever.
        for _ in 0..state.entries.len() {
            match state.entries.get(&current) {
                Some(entry) if state.entries.contains_key(&entry.depends_on) => {
                    current = entry.depends_on;
                }
                _ => break,
            }
        }
        current
    }

    /// Recursively promotes everything that was waiting on `root`.
    ///
    /// Walks the dependency graph breadth-first. Each direct child of the current
    /// parent is handed to `commit`; accepted children leave the pool and become
    /// parents themselves. After a parent's children are examined, its dependency
    /// bucket is cleared. The whole walk runs under the pool's acceptance lock.
    ///
    /// Returns the accepted hashes in acceptance order, each exactly once.
    pub fn accept_children<E, F>(&self, root: &K, mut commit: F) -> Result<Vec<K>, E>
    where
        T: Clone,
        F: FnMut(&K, &T) -> Promotion<K, E>,
    {
        let _accepting = self.accept_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut accepted: IndexSet<K> = IndexSet::new();
        let mut frontier = VecDeque::from([*root]);

        while let Some(parent) = frontier.pop_front() {
            let mut examined: HashSet<K> = HashSet::new();

            // Re-read the bucket until it holds nothing new, so orphans added while
            // this parent was being processed are not silently dropped.
            loop {
                let children: Vec<(K, T)> = {
                    let state = self.state();
                    state
                        .dependents
                        .get(&parent)
                        .into_iter()
                        .flatten()
                        .filter(|child| !examined.contains(*child) && !accepted.contains(*child))
                        .filter_map(|child| {
                            state.entries.get(child).map(|entry| (*child, entry.item.clone()))
                        })
                        .collect()
                };
                if children.is_empty() {
                    break;
                }

                for (child, item) in children {
                    examined.insert(child);
                    match commit(&child, &item) {
                        Promotion::Accepted => {
                            self.state().remove(&child);
                            accepted.insert(child);
                            frontier.push_back(child);
                            trace!("Promoted {} orphan {} (parent {})", self.kind, child, parent);
                        }
                        Promotion::Deferred(None) => {
                            trace!("{} orphan {} stays orphaned", self.kind, child);
                        }
                        Promotion::Deferred(Some(missing)) => {
                            self.reindex(&child, missing);
                        }
                        Promotion::Failed(e) => return Err(e),
                    }
                }
            }

            self.remove_dependencies_on(&parent);
        }

        if !accepted.is_empty() {
            debug!(
                "Accepted {} {} orphan(s) descending from {}",
                accepted.len(),
                self.kind,
                root
            );
        }
        Ok(accepted.into_iter().collect())
    }

    /// Gets a clone of an orphaned item
    pub fn get_orphan(&self, hash: &K) -> Option<T>
    where
        T: Clone,
    {
        self.state().entries.get(hash).map(|entry| entry.item.clone())
    }

    /// Gets the number of orphans in the pool
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Checks if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Removes orphans older than the configured timeout
    pub fn remove_expired(&self) -> Vec<K> {
        let now = Instant::now();
        let mut state = self.state();

        let expired: Vec<K> = state
            .entries
            .values()
            .filter(|entry| now.duration_since(entry.received_at) > self.orphan_timeout)
            .map(|entry| entry.hash)
            .collect();

        for hash in &expired {
            state.remove(hash);
            debug!("Removed expired {} orphan {}", self.kind, hash);
        }
        expired
    }

    /// Gets statistics about the orphan pool
    pub fn stats(&self) -> OrphanPoolStats {
        let now = Instant::now();
        let state = self.state();
        let oldest_age = state
            .entries
            .first()
            .map(|(_, entry)| now.duration_since(entry.received_at))
            .unwrap_or(Duration::ZERO);

        OrphanPoolStats {
            total_orphans: state.entries.len(),
            unique_parents: state.dependents.len(),
            oldest_age,
        }
    }

    /// Clears all orphans from the pool
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.dependents.clear();
        debug!("Cleared {} orphan pool", self.kind);
    }

    fn reindex(&self, hash: &K, depends_on: K) {
        let mut state = self.state();
        let previous = match state.entries.get_mut(hash) {
            Some(entry) => std::mem::replace(&mut entry.depends_on, depends_on),
            None => return,
        };
        state.unindex(hash, &previous);
        state.dependents.entry(depends_on).or_default().insert(*hash);
        trace!("{} orphan {} now waits on {}", self.kind, hash, depends_on);
    }

    // No user code runs while this lock is held, so a poisoned lock still
    // guards consistent data.
    fn state(&self) -> MutexGuard<'_, PoolState<K, T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Statistics about the orphan pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanPoolStats {
    /// Total number of orphans
    pub total_orphans: usize,
    /// Number of unique dependencies referenced
    pub unique_parents: usize,
    /// Age of the oldest orphan
    pub oldest_age: Duration,
}
