//! Statement Reference Trees
//!
//! One compiled query may be shared by several logical owners: a prepared
//! statement and the cursors executed from it. Each owner holds a node of a
//! reference tree. Node 0 is the owner; every other node was cloned from an
//! existing node. All nodes share one lock and one handle slot, so:
//!
//! - the handle is only reachable through [`StatementRef::perform`], under
//!   the tree lock, after a validity check
//! - invalidating any node invalidates every node, permanently
//! - the handle is released exactly once, to the statement cache or to
//!   `Drop`, whichever owns it
//!
//! Dropping a node invalidates its tree.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::cache::CacheShared;
use crate::error::HandleInvalidated;
use crate::query::{CompiledQuery, StatementId};

/// Index of a node within its reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// The owner node of every tree.
    pub const OWNER: NodeId = NodeId(0);

    /// Position of the node in the tree arena.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where the compiled query goes when its tree is invalidated.
pub(crate) enum Release<Q: CompiledQuery> {
    /// Back to the idle pool of the cache that handed it out
    Checkin(Weak<CacheShared<Q>>),
    /// Tracked by a cache for forced close, finalized on release
    Finalize(Weak<CacheShared<Q>>),
    /// Untracked one-off
    Drop,
}

/// Mutable tree state protected by the tree lock
struct TreeState<Q> {
    /// The live handle; `None` once the tree is invalidated
    query: Option<Q>,
    /// Arena of nodes: the parent of each node, `None` for the owner
    parents: Vec<Option<NodeId>>,
}

/// State shared by every node of one tree
pub(crate) struct Tree<Q: CompiledQuery> {
    id: StatementId,
    sql: Arc<str>,
    release: Release<Q>,
    state: Mutex<TreeState<Q>>,
}

impl<Q: CompiledQuery> Tree<Q> {
    /// Invalidate the tree and release its handle.
    ///
    /// The release runs under the tree lock, so no `perform` can observe the
    /// handle mid-release. Lock order is always tree, then cache.
    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        let Some(query) = state.query.take() else {
            return;
        };
        trace!(statement = %self.id, owners = state.parents.len(), "invalidating statement tree");

        match &self.release {
            Release::Checkin(cache) => match cache.upgrade() {
                Some(cache) => cache.checkin(self.id, &self.sql, query),
                None => drop(query),
            },
            Release::Finalize(cache) => {
                if let Some(cache) = cache.upgrade() {
                    cache.forget(self.id);
                }
                drop(query);
            }
            Release::Drop => drop(query),
        }
    }

    /// Invalidate the tree and dispose its handle without pooling it.
    ///
    /// Used by forced close, after the cache has dropped its bookkeeping.
    pub(crate) fn dispose(&self) {
        let mut state = self.state.lock();
        if let Some(query) = state.query.take() {
            trace!(statement = %self.id, "disposing statement tree");
            drop(query);
        }
    }
}

/// A node in a statement reference tree.
///
/// Not `Clone`: use [`StatementRef::clone_ref`], since dropping a node
/// invalidates the whole tree.
pub struct StatementRef<Q: CompiledQuery> {
    tree: Arc<Tree<Q>>,
    node: NodeId,
}

impl<Q: CompiledQuery> StatementRef<Q> {
    /// Create the owner node of a new tree.
    ///
    /// A `None` query creates a tree that is invalidated from the start.
    pub(crate) fn new_root(
        id: StatementId,
        sql: Arc<str>,
        query: Option<Q>,
        release: Release<Q>,
    ) -> Self {
        let tree = Tree {
            id,
            sql,
            release,
            state: Mutex::new(TreeState {
                query,
                parents: vec![None],
            }),
        };
        Self {
            tree: Arc::new(tree),
            node: NodeId::OWNER,
        }
    }

    /// Wrap a one-off compiled query that no cache tracks.
    ///
    /// Invalidation drops the query directly.
    pub fn detached(sql: &str, query: Q) -> Self {
        Self::new_root(StatementId::next(), Arc::from(sql), Some(query), Release::Drop)
    }

    /// Weak handle to the shared tree, for cache bookkeeping.
    pub(crate) fn downgrade(&self) -> Weak<Tree<Q>> {
        Arc::downgrade(&self.tree)
    }

    /// Identifier of the compiled query this tree manages.
    pub fn id(&self) -> StatementId {
        self.tree.id
    }

    /// This node's position in the tree.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The node this one was cloned from.
    ///
    /// `None` for the owner and for nodes cloned after invalidation.
    pub fn parent(&self) -> Option<NodeId> {
        self.tree.state.lock().parents.get(self.node.0).copied().flatten()
    }

    /// Statement text the query was compiled from.
    pub fn sql(&self) -> &str {
        &self.tree.sql
    }

    /// Whether this node is the tree's owner.
    pub fn is_owner(&self) -> bool {
        self.node == NodeId::OWNER
    }

    /// Whether the tree still holds a usable handle.
    pub fn is_valid(&self) -> bool {
        self.tree.state.lock().query.is_some()
    }

    /// Number of nodes ever created in this tree.
    pub fn owner_count(&self) -> usize {
        self.tree.state.lock().parents.len()
    }

    /// Whether the tree is valid and has at least one node besides the owner.
    pub fn is_shared(&self) -> bool {
        let state = self.tree.state.lock();
        state.query.is_some() && state.parents.len() > 1
    }

    /// Whether both nodes belong to the same tree.
    pub fn same_tree(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree)
    }

    /// Add a node to this tree.
    ///
    /// Cloning an invalidated tree yields an invalidated node that is not
    /// recorded, so a dead tree stops growing.
    pub fn clone_ref(&self) -> Self {
        let mut state = self.tree.state.lock();
        let node = NodeId(state.parents.len());
        if state.query.is_some() {
            state.parents.push(Some(self.node));
        }
        Self {
            tree: Arc::clone(&self.tree),
            node,
        }
    }

    /// Run `action` against the live handle.
    ///
    /// The tree lock is held for the duration of `action`; it must not touch
    /// this tree again.
    pub fn perform<R>(&self, action: impl FnOnce(&mut Q) -> R) -> Result<R, HandleInvalidated> {
        let mut state = self.tree.state.lock();
        match state.query.as_mut() {
            Some(query) => Ok(action(query)),
            None => Err(HandleInvalidated),
        }
    }

    /// Invalidate every node of the tree and release the handle.
    ///
    /// Idempotent.
    pub fn invalidate(&self) {
        self.tree.invalidate();
    }
}

impl<Q: CompiledQuery> Drop for StatementRef<Q> {
    fn drop(&mut self) {
        self.tree.invalidate();
    }
}

impl<Q: CompiledQuery> fmt::Debug for StatementRef<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementRef")
            .field("id", &self.tree.id)
            .field("node", &self.node)
            .field("sql", &self.sql())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::mock::Lifecycle;

    #[test]
    fn test_detached_root_is_valid_owner() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());

        assert!(root.is_valid());
        assert!(root.is_owner());
        assert_eq!(root.parent(), None);
        assert_eq!(root.sql(), "SELECT 1");
        assert_eq!(root.owner_count(), 1);
        assert!(!root.is_shared());
    }

    #[test]
    fn test_perform_runs_against_handle() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());

        root.perform(|q| q.runs += 1).unwrap();
        let runs = root.perform(|q| q.runs).unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_clone_records_parent() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();
        let grandchild = child.clone_ref();

        assert!(child.same_tree(&root));
        assert!(!child.is_owner());
        assert_eq!(child.parent(), Some(NodeId::OWNER));
        assert_eq!(grandchild.parent(), Some(child.node()));
        assert_eq!(root.owner_count(), 3);
        assert!(root.is_shared());
    }

    #[test]
    fn test_clone_sees_owner_handle() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();

        child.perform(|q| q.runs = 7).unwrap();
        assert_eq!(root.perform(|q| q.runs).unwrap(), 7);
    }

    #[test]
    fn test_invalidate_child_invalidates_root() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();

        child.invalidate();

        assert_eq!(root.perform(|_| ()), Err(HandleInvalidated));
        assert!(!root.is_valid());
        assert!(!root.is_shared());
        assert_eq!(lifecycle.drops(), 1);
    }

    #[test]
    fn test_invalidate_root_invalidates_child() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();

        root.invalidate();

        assert_eq!(child.perform(|_| ()), Err(HandleInvalidated));
        assert_eq!(lifecycle.drops(), 1);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();

        root.invalidate();
        root.invalidate();
        child.invalidate();
        drop(child);
        drop(root);

        assert_eq!(lifecycle.drops(), 1);
    }

    #[test]
    fn test_clone_of_dead_tree_is_dead() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        root.invalidate();

        let clone = root.clone_ref();
        assert!(!clone.is_valid());
        assert_eq!(clone.perform(|_| ()), Err(HandleInvalidated));
        assert_eq!(clone.parent(), None);
    }

    #[test]
    fn test_dead_tree_stops_growing() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();
        child.invalidate();
        assert_eq!(root.owner_count(), 2);

        for _ in 0..1000 {
            let dead = child.clone_ref();
            assert!(!dead.is_valid());
        }

        assert_eq!(root.owner_count(), 2);
        assert!(!root.is_shared());
        assert_eq!(child.parent(), Some(NodeId::OWNER));
    }

    #[test]
    fn test_drop_of_any_node_releases_handle() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let child = root.clone_ref();

        drop(child);

        assert_eq!(lifecycle.drops(), 1);
        assert!(!root.is_valid());
    }

    #[test]
    fn test_dead_root_from_start() {
        let root: StatementRef<crate::query::mock::MockQuery> = StatementRef::new_root(
            StatementId::next(),
            Arc::from("SELECT 1"),
            None,
            Release::Drop,
        );
        assert!(!root.is_valid());
        assert_eq!(root.perform(|_| ()), Err(HandleInvalidated));
    }

    #[test]
    fn test_debug_output() {
        let lifecycle = Lifecycle::default();
        let root = StatementRef::detached("SELECT 1", lifecycle.query());
        let debug = format!("{:?}", root);
        assert!(debug.contains("SELECT 1"));
        assert!(debug.contains("valid: true"));
    }
}
