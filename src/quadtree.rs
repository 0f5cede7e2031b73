//! Partition manager: a recursive rectangular decomposition of the world.
//!
//! [`QuadTree`] is an arena of [`QuadTreeNode`]s keyed by id. Cyclic
//! ownership (parent <-> child) is resolved the way the design notes
//! prescribe: the arena owns every node, child links are strong (an id
//! looked up in the arena), parent links are weak (also just an id). A node
//! is either internal, with exactly `2^D` children tiling its rectangle at
//! an interior split origin, or a leaf carrying a worker id. Leaf ids double
//! as worker ranks; once a leaf is split its id persists as a purely
//! structural/group identifier for the internal node, and the `2^D` fresh
//! leaf ids are drawn from the id pool.

use crate::error::{CoreError, CoreResult};
use crate::geometry::{AreaOfInterest, IntHyperRect, IntPoint};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Callbacks a client (a halo field, the transporter) registers to
/// participate in a coordinated rebalance. Pre-commit must stash local
/// state into a snapshot that can be replayed once the new topology is
/// known; post-commit reloads partition-derived caches and redistributes
/// that snapshot. Participants run in registration order on every worker.
pub trait RebalanceParticipant<const D: usize> {
    /// Called once per topology mutation, before it is applied, with the
    /// level and id of the node about to change. The node's rectangle (and,
    /// for a node about to be merged, its descendants') is still resolvable
    /// through the tree at this point.
    fn pre_commit(&mut self, level: u32, node_id: i64);
    /// Called once per topology mutation, after it has been applied, with
    /// the same node id passed to the matching `pre_commit`.
    fn post_commit(&mut self, node_id: i64);
}

/// A node in the quadtree arena: either internal (with a split origin and
/// `2^D` children) or a leaf (with a worker id).
#[derive(Debug, Clone)]
pub struct QuadTreeNode<const D: usize> {
    id: i64,
    rect: IntHyperRect<D>,
    level: u32,
    parent: Option<i64>,
    /// `Some` for internal nodes: the point children were split at.
    origin: Option<IntPoint<D>>,
    /// `Some` for internal nodes: exactly `2^D` child ids.
    children: Option<Vec<i64>>,
}

impl<const D: usize> QuadTreeNode<D> {
    /// This node's id. For a leaf, also its worker rank.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The rectangle this node (and, if a leaf, its owning worker) covers.
    #[must_use]
    pub fn rect(&self) -> &IntHyperRect<D> {
        &self.rect
    }

    /// Depth from the root (root is level 0).
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Whether this node currently has no children (i.e. is a worker leaf).
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// A simple arena id allocator: a bounded pool of ids, LIFO-reused on free.
#[derive(Debug, Clone)]
struct IdPool {
    next_fresh: i64,
    free_list: Vec<i64>,
    max: i64,
}

impl IdPool {
    fn new(max: i64) -> Self {
        Self {
            next_fresh: 0,
            free_list: Vec::new(),
            max,
        }
    }

    fn alloc(&mut self) -> Option<i64> {
        if let Some(id) = self.free_list.pop() {
            return Some(id);
        }
        if self.next_fresh < self.max {
            let id = self.next_fresh;
            self.next_fresh += 1;
            Some(id)
        } else {
            None
        }
    }

    fn free(&mut self, id: i64) {
        self.free_list.push(id);
    }

    /// Total number of ids currently not allocated to any live node.
    fn available(&self) -> i64 {
        (self.max - self.next_fresh) + self.free_list.len() as i64
    }
}

/// The quadtree-over-integer-hyperrectangles partition manager.
pub struct QuadTree<const D: usize> {
    nodes: HashMap<i64, QuadTreeNode<D>>,
    root_id: i64,
    ids: IdPool,
    world_rect: IntHyperRect<D>,
    participants: Vec<Rc<RefCell<dyn RebalanceParticipant<D>>>>,
}

const fn children_per_split(d: usize) -> usize {
    1 << d
}

impl<const D: usize> QuadTree<D> {
    /// Build a tree over `world_rect` (its `id` is forced to `-1`, the
    /// world-rectangle convention), with an id pool sized for at most
    /// `max_partitions` leaves.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TopologyError`] if `max_partitions < 1` or if
    /// `max_partitions` does not satisfy `N ≡ 1 (mod 2^D - 1)` -- the
    /// invariant that keeps leaf counts reachable by repeated splitting.
    pub fn new(world_rect: IntHyperRect<D>, max_partitions: i64) -> CoreResult<Self> {
        let per_split = children_per_split(D) as i64;
        if max_partitions < 1 {
            return Err(CoreError::TopologyError {
                detail: "max_partitions must be at least 1".into(),
            });
        }
        if per_split > 1 && (max_partitions - 1) % (per_split - 1) != 0 {
            return Err(CoreError::TopologyError {
                detail: format!(
                    "max_partitions {max_partitions} must satisfy N = 1 (mod {})",
                    per_split - 1
                ),
            });
        }
        let mut ids = IdPool::new(max_partitions);
        let root_id = ids.alloc().expect("pool sized for at least 1 id");
        let world_rect = IntHyperRect { id: -1, ..world_rect };
        let mut root_rect = world_rect;
        root_rect.id = root_id;
        let root = QuadTreeNode {
            id: root_id,
            rect: root_rect,
            level: 0,
            parent: None,
            origin: None,
            children: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(root_id, root);
        Ok(Self {
            nodes,
            root_id,
            ids,
            world_rect,
            participants: Vec::new(),
        })
    }

    /// The world rectangle (id `-1`).
    #[must_use]
    pub fn world_rect(&self) -> &IntHyperRect<D> {
        &self.world_rect
    }

    /// Register a client to run pre/post-commit callbacks around every
    /// topology mutation, in registration order.
    pub fn register_participant(&mut self, participant: Rc<RefCell<dyn RebalanceParticipant<D>>>) {
        self.participants.push(participant);
    }

    /// Look up a node (leaf or internal) by id.
    #[must_use]
    pub fn node(&self, id: i64) -> Option<&QuadTreeNode<D>> {
        self.nodes.get(&id)
    }

    /// All currently assigned worker ids (leaf ids), ascending.
    #[must_use]
    pub fn leaf_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .nodes
            .values()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of ids neither assigned to a live node nor held as a leaf id
    /// (i.e. the free pool size plus never-yet-allocated ids).
    #[must_use]
    pub fn available_id_count(&self) -> i64 {
        self.ids.available()
    }

    /// Descend from the root to the leaf containing `point`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TopologyError`] if `point` lies outside the
    /// world rectangle.
    pub fn get_leaf(&self, point: &IntPoint<D>) -> CoreResult<&QuadTreeNode<D>> {
        if !self.world_rect.contains(point) {
            return Err(CoreError::TopologyError {
                detail: format!("{point:?} outside world rectangle"),
            });
        }
        let mut current = self.nodes.get(&self.root_id).expect("root always present");
        loop {
            match (&current.children, &current.origin) {
                (Some(children), Some(origin)) => {
                    let mut mask = 0usize;
                    for d in 0..D {
                        if point.get(d) >= origin.get(d) {
                            mask |= 1 << d;
                        }
                    }
                    let child_id = children[mask];
                    current = self.nodes.get(&child_id).expect("child id must exist");
                }
                _ => return Ok(current),
            }
        }
    }

    /// The worker rank that owns `point` (the leaf id).
    ///
    /// # Errors
    ///
    /// See [`Self::get_leaf`].
    pub fn owner(&self, point: &IntPoint<D>) -> CoreResult<i64> {
        self.get_leaf(point).map(QuadTreeNode::id)
    }

    fn run_pre_commit(&self, level: u32, node_id: i64) {
        for p in &self.participants {
            p.borrow_mut().pre_commit(level, node_id);
        }
    }

    fn run_post_commit(&self, node_id: i64) {
        for p in &self.participants {
            p.borrow_mut().post_commit(node_id);
        }
    }

    /// `node_id` itself if it is a leaf, otherwise every leaf descending from
    /// it. Used by rebalance participants to determine which worker ranks a
    /// topology mutation touches.
    #[must_use]
    pub fn descendant_leaf_ids(&self, node_id: i64) -> Vec<i64> {
        let mut out = Vec::new();
        self.collect_descendant_leaves(node_id, &mut out);
        out.sort_unstable();
        out
    }

    fn collect_descendant_leaves(&self, node_id: i64, out: &mut Vec<i64>) {
        let Some(node) = self.nodes.get(&node_id) else {
            return;
        };
        match &node.children {
            Some(children) => {
                for child in children {
                    self.collect_descendant_leaves(*child, out);
                }
            }
            None => out.push(node_id),
        }
    }

    /// Subdivide the leaf containing `origin` into `2^D` children at that
    /// point.
    ///
    /// # Errors
    ///
    /// [`CoreError::TopologyError`] if `origin` is not strictly interior to
    /// its containing leaf, or if the id pool is exhausted.
    pub fn split(&mut self, origin: IntPoint<D>) -> CoreResult<()> {
        let leaf_id = self.get_leaf(&origin)?.id();
        self.split_leaf(leaf_id, origin)
    }

    fn split_leaf(&mut self, leaf_id: i64, origin: IntPoint<D>) -> CoreResult<()> {
        let level = {
            let leaf = self.nodes.get(&leaf_id).expect("leaf id must exist");
            if !leaf.is_leaf() {
                return Err(CoreError::TopologyError {
                    detail: format!("node {leaf_id} is not a leaf"),
                });
            }
            self.check_interior(&leaf.rect, &origin, leaf_id)?;
            leaf.level
        };
        let n_children = children_per_split(D);
        if self.ids.available() < n_children as i64 {
            return Err(CoreError::TopologyError {
                detail: "id pool exhausted".into(),
            });
        }

        self.run_pre_commit(level, leaf_id);
        self.split_leaf_no_commit(leaf_id, origin)?;
        self.run_post_commit(leaf_id);
        Ok(())
    }

    fn check_interior(&self, rect: &IntHyperRect<D>, origin: &IntPoint<D>, node_id: i64) -> CoreResult<()> {
        for d in 0..D {
            if origin.get(d) <= rect.ul.get(d) || origin.get(d) >= rect.br.get(d) {
                return Err(CoreError::TopologyError {
                    detail: format!("origin {origin:?} not strictly interior to node {node_id}"),
                });
            }
        }
        Ok(())
    }

    /// Remove all descendants of `node_id`, freeing their ids, and turn it
    /// back into a leaf.
    ///
    /// # Errors
    ///
    /// [`CoreError::TopologyError`] if `node_id` is unknown or already a leaf.
    pub fn merge(&mut self, node_id: i64) -> CoreResult<()> {
        let level = {
            let node = self
                .nodes
                .get(&node_id)
                .ok_or_else(|| CoreError::TopologyError {
                    detail: format!("unknown node {node_id}"),
                })?;
            if node.is_leaf() {
                return Err(CoreError::TopologyError {
                    detail: format!("node {node_id} is already a leaf"),
                });
            }
            node.level
        };

        self.run_pre_commit(level, node_id);
        self.merge_subtree(node_id);
        self.run_post_commit(node_id);
        Ok(())
    }

    /// Free every descendant of `node_id` (not `node_id` itself) and clear
    /// its split state, leaving it a leaf. Caller runs commit callbacks.
    fn merge_subtree(&mut self, node_id: i64) {
        let children = self
            .nodes
            .get_mut(&node_id)
            .and_then(|n| n.children.take());
        if let Some(children) = children {
            for child_id in children {
                self.free_subtree(child_id);
            }
        }
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.origin = None;
        }
    }

    fn free_subtree(&mut self, node_id: i64) {
        let children = self.nodes.get(&node_id).and_then(|n| n.children.clone());
        if let Some(children) = children {
            for child in children {
                self.free_subtree(child);
            }
        }
        self.nodes.remove(&node_id);
        self.ids.free(node_id);
    }

    /// `merge(node)` followed by `split_at(node.rect, new_origin)`,
    /// preserving `node`'s own id.
    ///
    /// # Errors
    ///
    /// See [`Self::merge`] and [`Self::split`].
    pub fn move_origin(&mut self, node_id: i64, new_origin: IntPoint<D>) -> CoreResult<()> {
        let level = {
            let node = self
                .nodes
                .get(&node_id)
                .ok_or_else(|| CoreError::TopologyError {
                    detail: format!("unknown node {node_id}"),
                })?;
            node.level
        };

        let rect = self.nodes.get(&node_id).expect("checked above").rect;
        self.check_interior(&rect, &new_origin, node_id)?;

        self.run_pre_commit(level, node_id);
        self.merge_subtree(node_id);
        // re-split without re-running commit callbacks (single mutation, single commit pair)
        self.split_leaf_no_commit(node_id, new_origin)?;
        self.run_post_commit(node_id);
        Ok(())
    }

    fn split_leaf_no_commit(&mut self, leaf_id: i64, origin: IntPoint<D>) -> CoreResult<()> {
        let rect = self.nodes.get(&leaf_id).expect("leaf id must exist").rect;
        let n_children = children_per_split(D);
        if self.ids.available() < n_children as i64 {
            return Err(CoreError::TopologyError {
                detail: "id pool exhausted".into(),
            });
        }
        let level = self.nodes.get(&leaf_id).expect("leaf id must exist").level;
        let mut child_ids = Vec::with_capacity(n_children);
        for mask in 0..n_children {
            let mut ul = [0i64; D];
            let mut br = [0i64; D];
            for d in 0..D {
                if mask & (1 << d) != 0 {
                    ul[d] = origin.get(d);
                    br[d] = rect.br.get(d);
                } else {
                    ul[d] = rect.ul.get(d);
                    br[d] = origin.get(d);
                }
            }
            let child_id = self.ids.alloc().expect("checked availability above");
            let child = QuadTreeNode {
                id: child_id,
                rect: IntHyperRect {
                    id: child_id,
                    ul: IntPoint(ul),
                    br: IntPoint(br),
                },
                level: level + 1,
                parent: Some(leaf_id),
                origin: None,
                children: None,
            };
            self.nodes.insert(child_id, child);
            child_ids.push(child_id);
        }
        let node = self.nodes.get_mut(&leaf_id).expect("leaf id must exist");
        node.origin = Some(origin);
        node.children = Some(child_ids);
        Ok(())
    }

    /// All leaves other than `leaf_id` whose rectangle intersects the
    /// `aoi`-expanded halo of `leaf_id`, replicated over every toroidal
    /// world shift. Ascending by leaf id.
    #[must_use]
    pub fn neighbors(&self, leaf_id: i64, aoi: &AreaOfInterest<D>) -> Vec<i64> {
        let Some(leaf) = self.nodes.get(&leaf_id) else {
            return Vec::new();
        };
        let halo = leaf.rect.expand_by_aoi(aoi);
        let world_size = self.world_rect.size();
        let shifted_halos = halo.toroidal_shifts(&world_size);

        let mut found: Vec<i64> = self
            .nodes
            .values()
            .filter(|n| n.is_leaf() && n.id != leaf_id)
            .filter(|n| shifted_halos.iter().any(|h| h.intersects(&n.rect)))
            .map(|n| n.id)
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Every currently assigned leaf's rectangle, ascending by id. Used by
    /// property tests to check the tiling invariant.
    #[must_use]
    pub fn leaf_rects(&self) -> Vec<IntHyperRect<D>> {
        let mut leaves: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.is_leaf())
            .map(|n| (n.id, n.rect))
            .collect();
        leaves.sort_by_key(|(id, _)| *id);
        leaves.into_iter().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect2;

    fn world(size: i64) -> Rect2 {
        Rect2::new(-1, IntPoint([0, 0]), IntPoint([size, size]))
    }

    #[test]
    fn new_requires_valid_id_budget() {
        // D=2 => per_split=4, per_split-1=3; 7 = 1 + 2*3 is valid.
        assert!(QuadTree::<2>::new(world(100), 7).is_ok());
        assert!(QuadTree::<2>::new(world(100), 8).is_err());
    }

    #[test]
    fn split_creates_four_children_and_tiles() {
        let mut tree = QuadTree::<2>::new(world(100), 13).unwrap();
        tree.split(IntPoint([50, 50])).unwrap();
        assert_eq!(tree.leaf_ids().len(), 4);
        let leaves = tree.leaf_rects();
        let total_area: i64 = leaves.iter().map(IntHyperRect::area).sum();
        assert_eq!(total_area, 100 * 100);
    }

    #[test]
    fn split_rejects_non_interior_origin() {
        let mut tree = QuadTree::<2>::new(world(100), 13).unwrap();
        assert!(tree.split(IntPoint([0, 50])).is_err());
        assert!(tree.split(IntPoint([100, 50])).is_err());
    }

    #[test]
    fn merge_frees_ids() {
        let mut tree = QuadTree::<2>::new(world(100), 13).unwrap();
        let before = tree.available_id_count();
        tree.split(IntPoint([50, 50])).unwrap();
        assert_eq!(tree.available_id_count(), before - 4);
        let root = tree.root_id;
        tree.merge(root).unwrap();
        assert_eq!(tree.available_id_count(), before);
        assert_eq!(tree.leaf_ids(), vec![root]);
    }

    #[test]
    fn move_origin_preserves_node_id() {
        let mut tree = QuadTree::<2>::new(world(100), 13).unwrap();
        let root = tree.root_id;
        tree.split(IntPoint([50, 50])).unwrap();
        let child = tree.leaf_ids()[0];
        tree.move_origin(child, IntPoint([20, 20])).unwrap();
        assert!(tree.node(child).is_some());
        assert_eq!(tree.node(root).unwrap().id(), root);
    }

    #[test]
    fn get_leaf_routes_by_origin() {
        let mut tree = QuadTree::<2>::new(world(100), 13).unwrap();
        tree.split(IntPoint([50, 50])).unwrap();
        let a = tree.get_leaf(&IntPoint([10, 10])).unwrap().id();
        let b = tree.get_leaf(&IntPoint([90, 90])).unwrap().id();
        assert_ne!(a, b);
    }
}
