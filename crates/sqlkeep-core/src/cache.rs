//! Compiled Statement Cache
//!
//! Pools idle compiled queries keyed by statement text, bounded by a
//! capacity, and tracks every query it has handed out so the whole set can
//! be disposed deterministically when the connection closes.
//!
//! Authority over a compiled query moves atomically under the cache lock:
//! an idle query belongs to the cache, a checked-out query belongs to the
//! reference tree returned by [`StatementCache::checkout`] or
//! [`StatementCache::register`]. Eviction happens only at checkin and is
//! purely size-triggered.
//!
//! Thread-safe via interior mutability using parking_lot::Mutex. Compiling
//! happens outside the lock, so two callers may race to compile the same
//! text; both results are kept or evicted by the normal checkin rules.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sqlkeep_config::StatementCacheConfig;
use tracing::{debug, trace};

use crate::query::{CompiledQuery, StatementId};
use crate::reference::{Release, StatementRef, Tree};

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Checkouts served from the idle pool
    pub hits: u64,
    /// Checkouts that found no idle statement
    pub misses: u64,
    /// Statements disposed at checkin because the pool was full
    pub evictions: u64,
}

impl CacheMetrics {
    /// Get hit rate as a fraction (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn record_hit(&mut self) {
        self.hits += 1;
    }

    fn record_miss(&mut self) {
        self.misses += 1;
    }

    fn record_eviction(&mut self) {
        self.evictions += 1;
    }
}

/// Where a registered statement currently lives
enum Residence<Q: CompiledQuery> {
    /// In the idle pool
    Idle,
    /// Owned by a live reference tree
    CheckedOut(Weak<Tree<Q>>),
}

struct IdleStatement<Q> {
    id: StatementId,
    query: Q,
}

/// Inner state for StatementCache (protected by Mutex)
struct CacheState<Q: CompiledQuery> {
    closed: bool,

    /// Per-text share of the capacity
    max_per_query: usize,

    /// Idle statements by statement text; buckets are never empty
    idle: HashMap<Arc<str>, Vec<IdleStatement<Q>>>,

    /// Total number of idle statements across all buckets
    idle_count: usize,

    /// Every statement known to the cache, idle or checked out
    registry: HashMap<StatementId, Residence<Q>>,

    metrics: CacheMetrics,
}

impl<Q: CompiledQuery> CacheState<Q> {
    /// Remove one idle statement for `sql`, returning the bucket key with it.
    fn take_idle(&mut self, sql: &str) -> Option<(Arc<str>, IdleStatement<Q>)> {
        let (key, mut bucket) = self.idle.remove_entry(sql)?;
        let statement = bucket.pop()?;
        if !bucket.is_empty() {
            self.idle.insert(Arc::clone(&key), bucket);
        }
        self.idle_count -= 1;
        Some((key, statement))
    }

    /// Drain everything, returning idle queries and checked-out trees.
    fn drain(&mut self) -> (Vec<Q>, Vec<Weak<Tree<Q>>>) {
        let idle = self
            .idle
            .drain()
            .flat_map(|(_, bucket)| bucket)
            .map(|statement| statement.query)
            .collect();
        let live = self
            .registry
            .drain()
            .filter_map(|(_, residence)| match residence {
                Residence::CheckedOut(tree) => Some(tree),
                Residence::Idle => None,
            })
            .collect();
        self.idle_count = 0;
        (idle, live)
    }
}

/// State shared between the cache and the reference trees it issues
pub(crate) struct CacheShared<Q: CompiledQuery> {
    capacity: usize,
    state: Mutex<CacheState<Q>>,
}

impl<Q: CompiledQuery> CacheShared<Q> {
    /// Take back a query whose tree was invalidated.
    ///
    /// The query is reset and pooled if both the per-text share and the total
    /// capacity allow it, otherwise it is disposed. A query no longer in the
    /// registry was drained by `remove_all` or `close` and is always disposed.
    pub(crate) fn checkin(&self, id: StatementId, sql: &Arc<str>, mut query: Q) {
        query.reset();

        let rejected = {
            let mut state = self.state.lock();
            let tracked = state.registry.remove(&id).is_some();

            let bucket_len = state.idle.get(sql).map_or(0, Vec::len);
            if state.closed || !tracked {
                Some(query)
            } else if bucket_len + 1 > state.max_per_query || state.idle_count + 1 > self.capacity
            {
                state.metrics.record_eviction();
                Some(query)
            } else {
                state.registry.insert(id, Residence::Idle);
                state
                    .idle
                    .entry(Arc::clone(sql))
                    .or_default()
                    .push(IdleStatement { id, query });
                state.idle_count += 1;
                None
            }
        };

        match rejected {
            Some(query) => {
                debug!(statement = %id, "disposing statement at checkin");
                drop(query);
            }
            None => trace!(statement = %id, "statement returned to pool"),
        }
    }

    /// Stop tracking a transient statement.
    pub(crate) fn forget(&self, id: StatementId) {
        self.state.lock().registry.remove(&id);
    }
}

/// Bounded pool of idle compiled statements for one connection.
///
/// Dropping the cache closes it.
pub struct StatementCache<Q: CompiledQuery> {
    shared: Arc<CacheShared<Q>>,
}

impl<Q: CompiledQuery> StatementCache<Q> {
    /// Create a cache retaining at most `capacity` idle statements.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                capacity,
                state: Mutex::new(CacheState {
                    closed: false,
                    max_per_query: capacity,
                    idle: HashMap::new(),
                    idle_count: 0,
                    registry: HashMap::new(),
                    metrics: CacheMetrics::default(),
                }),
            }),
        }
    }

    /// Create a cache from configuration.
    pub fn from_config(config: &StatementCacheConfig) -> Self {
        Self::new(config.capacity).with_max_per_query(config.effective_max_per_query())
    }

    /// Limit the idle statements retained for any single statement text.
    pub fn with_max_per_query(self, max: usize) -> Self {
        self.shared.state.lock().max_per_query = max;
        self
    }

    /// Maximum number of idle statements retained.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Maximum idle statements retained for one statement text.
    pub fn max_per_query(&self) -> usize {
        self.shared.state.lock().max_per_query
    }

    /// Number of idle statements.
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle_count
    }

    /// Number of idle statements for one statement text.
    pub fn idle_count_for(&self, sql: &str) -> usize {
        self.shared.state.lock().idle.get(sql).map_or(0, Vec::len)
    }

    /// Number of statements tracked, idle or checked out.
    pub fn registered_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Get a snapshot of cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        self.shared.state.lock().metrics.clone()
    }

    /// Reset cache metrics
    pub fn reset_metrics(&self) {
        self.shared.state.lock().metrics = CacheMetrics::default();
    }

    /// Take an idle statement for `sql`.
    ///
    /// Returns the owner node of a new reference tree, or `None` when the
    /// caller must compile `sql` itself and [`register`](Self::register) it.
    /// Any idle statement for the same text is interchangeable.
    pub fn checkout(&self, sql: &str) -> Option<StatementRef<Q>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }

        let Some((key, statement)) = state.take_idle(sql) else {
            state.metrics.record_miss();
            trace!(sql, "statement cache miss");
            return None;
        };
        state.metrics.record_hit();

        let id = statement.id;
        let root = StatementRef::new_root(
            id,
            key,
            Some(statement.query),
            Release::Checkin(Arc::downgrade(&self.shared)),
        );
        state
            .registry
            .insert(id, Residence::CheckedOut(root.downgrade()));
        trace!(statement = %id, "statement cache hit");
        Some(root)
    }

    /// Track a freshly compiled statement and hand it out.
    ///
    /// When its tree is invalidated the statement is checked in.
    pub fn register(&self, sql: &str, query: Q) -> StatementRef<Q> {
        self.track(sql, query, Release::Checkin(Arc::downgrade(&self.shared)))
    }

    /// Track a one-off statement for forced close only.
    ///
    /// When its tree is invalidated the statement is disposed, never pooled.
    pub fn register_transient(&self, sql: &str, query: Q) -> StatementRef<Q> {
        self.track(sql, query, Release::Finalize(Arc::downgrade(&self.shared)))
    }

    fn track(&self, sql: &str, query: Q, release: Release<Q>) -> StatementRef<Q> {
        let id = StatementId::next();
        let sql: Arc<str> = Arc::from(sql);

        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            debug!(statement = %id, "statement registered after close, disposing");
            drop(query);
            return StatementRef::new_root(id, sql, None, Release::Drop);
        }

        let root = StatementRef::new_root(id, sql, Some(query), release);
        state
            .registry
            .insert(id, Residence::CheckedOut(root.downgrade()));
        trace!(statement = %id, "statement registered");
        root
    }

    /// Dispose every statement, idle or checked out, and keep the cache open.
    ///
    /// Reference trees holding checked-out statements are invalidated.
    pub fn remove_all(&self) {
        self.dispose_all(false);
    }

    /// Dispose every statement and refuse all further pooling.
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.dispose_all(true);
    }

    fn dispose_all(&self, close: bool) {
        // Trees are invalidated after the cache lock is released: a tree
        // being invalidated concurrently holds its own lock and waits on ours.
        let (idle, live) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = close;
            state.drain()
        };

        debug!(
            idle = idle.len(),
            checked_out = live.len(),
            close,
            "disposing cached statements"
        );
        drop(idle);
        for tree in live.iter().filter_map(Weak::upgrade) {
            tree.dispose();
        }
    }
}

impl<Q: CompiledQuery> Drop for StatementCache<Q> {
    fn drop(&mut self) {
        self.close();
    }
}
