//! Halo-exchanged grid field: a [`GridStorage`] bound to one worker's
//! partition, kept in sync with its neighbors' ghost regions (§3, §4.4).
//!
//! A [`HaloField`] tracks three nested rectangles over the same storage
//! (§4.1): `orig_part` (owned, written freely), `halo_part` (owned plus a
//! read-only ghost margin of `aoi` cells, the bound storage actually covers
//! this one), and `private_part` (owned minus `aoi`, guaranteed untouched by
//! any neighbor's writes). [`HaloField::sync`] refreshes the ghost margin
//! from neighbors; it never touches `private_part`.
//!
//! [`HaloField`] also implements [`RebalanceParticipant`] so it can ride a
//! [`crate::quadtree::QuadTree`] topology mutation: `pre_commit` snapshots
//! enough of the old topology and data to redistribute afterward,
//! `post_commit` reshapes storage to the new partition and exchanges
//! whatever cells moved to a different owner.

use crate::collectives::CollectiveTransport;
use crate::error::{CoreError, CoreResult};
use crate::geometry::{AreaOfInterest, IntHyperRect, IntPoint};
use crate::grid::GridStorage;
use crate::quadtree::{QuadTree, RebalanceParticipant};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A neighbor's pre-computed send/receive sub-rectangle lists (§4.4).
///
/// `send_overlaps` are sub-rects of our own `orig_part` that fall in this
/// neighbor's halo and so must be packed and sent to it; `recv_overlaps` are
/// sub-rects of our `halo_part` that this neighbor owns and so must be
/// received from it. Both lists are computed per toroidal world-shift so a
/// partition near a wraparound edge still sees the right overlap. The two
/// lists are sorted in opposite order (ascending / descending by corner) so
/// that, index for index, our send list lines up with what the neighbor
/// expects to write into the matching slot of its own receive list.
#[derive(Debug, Clone)]
pub struct Neighbor<const D: usize> {
    pub worker_id: i64,
    pub send_overlaps: Vec<IntHyperRect<D>>,
    pub recv_overlaps: Vec<IntHyperRect<D>>,
}

fn sort_key<const D: usize>(r: &IntHyperRect<D>) -> [i64; D] {
    r.ul.0
}

/// State captured by [`RebalanceParticipant::pre_commit`] and consumed by
/// the matching `post_commit`.
struct PendingRebalance<S, const D: usize> {
    /// `(rank, rect)` of every leaf under the mutated node before the
    /// mutation -- the only place this information survives a `merge`,
    /// since the nodes themselves are freed.
    old_group_rects: Vec<(i64, IntHyperRect<D>)>,
    /// This worker's own pre-mutation partition, if it owned one.
    my_old_rect: Option<IntHyperRect<D>>,
    /// A full snapshot of this worker's storage before the mutation, so
    /// `post_commit` can pack arbitrary sub-rects of it after the live
    /// `storage` field has been reshaped to the new partition.
    old_storage: Option<S>,
}

/// A grid field, halo-exchanged against a partition's current neighbors.
pub struct HaloField<S, const D: usize> {
    field_index: i64,
    my_rank: i64,
    aoi: AreaOfInterest<D>,
    partition: Rc<RefCell<QuadTree<D>>>,
    transport: Rc<dyn CollectiveTransport>,
    storage: S,
    orig_part: IntHyperRect<D>,
    halo_part: IntHyperRect<D>,
    private_part: IntHyperRect<D>,
    neighbors: Vec<Neighbor<D>>,
    pending: Option<PendingRebalance<S, D>>,
}

impl<S, const D: usize> HaloField<S, D>
where
    S: GridStorage<D> + Clone,
{
    /// Build a field for `my_rank`'s current partition in `partition`.
    ///
    /// # Errors
    ///
    /// [`CoreError::TopologyError`] if `my_rank` does not currently name a
    /// leaf (worker) in `partition`.
    pub fn new(
        field_index: i64,
        my_rank: i64,
        aoi: AreaOfInterest<D>,
        partition: Rc<RefCell<QuadTree<D>>>,
        transport: Rc<dyn CollectiveTransport>,
    ) -> CoreResult<Self> {
        let orig_part = Self::owned_rect(&partition, my_rank)?;
        let halo_part = orig_part.expand_by_aoi(&aoi);
        let private_part = orig_part.shrink_by_aoi(&aoi);
        let storage = S::new_storage(halo_part);
        let mut field = Self {
            field_index,
            my_rank,
            aoi,
            partition,
            transport,
            storage,
            orig_part,
            halo_part,
            private_part,
            neighbors: Vec::new(),
            pending: None,
        };
        field.neighbors = field.compute_neighbors()?;
        Ok(field)
    }

    fn owned_rect(partition: &Rc<RefCell<QuadTree<D>>>, rank: i64) -> CoreResult<IntHyperRect<D>> {
        partition
            .borrow()
            .node(rank)
            .filter(|n| n.is_leaf())
            .map(|n| *n.rect())
            .ok_or_else(|| CoreError::TopologyError {
                detail: format!("rank {rank} does not currently own a partition"),
            })
    }

    /// The field index this instance exposes to remote reads (see
    /// [`crate::proxy`]).
    #[must_use]
    pub fn field_index(&self) -> i64 {
        self.field_index
    }

    /// The owned sub-rectangle, written freely.
    #[must_use]
    pub fn orig_part(&self) -> &IntHyperRect<D> {
        &self.orig_part
    }

    /// The owned sub-rectangle expanded by the field's aoi; the region the
    /// bound storage actually covers.
    #[must_use]
    pub fn halo_part(&self) -> &IntHyperRect<D> {
        &self.halo_part
    }

    /// The owned sub-rectangle shrunk by the field's aoi; guaranteed never
    /// touched by a neighbor's sync.
    #[must_use]
    pub fn private_part(&self) -> &IntHyperRect<D> {
        &self.private_part
    }

    /// Current neighbor list, recomputed on every topology mutation.
    #[must_use]
    pub fn neighbors(&self) -> &[Neighbor<D>] {
        &self.neighbors
    }

    fn wrap_point(&self, point: &IntPoint<D>) -> IntPoint<D> {
        let world_size = self.partition.borrow().world_rect().size();
        point.wrap(&world_size)
    }

    /// Read a cell. Falls back to [`CoreError::OutOfLocal`] (recoverable:
    /// the caller should retry through [`crate::proxy`]) if `point` lies
    /// outside both the owned region and its halo.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfLocal`] if `point` is outside `halo_part`.
    pub fn get(&self, point: &IntPoint<D>) -> CoreResult<S::Elem> {
        let wrapped = self.wrap_point(point);
        if self.halo_part.contains(&wrapped) {
            return Ok(self.storage.get(self.halo_part.flatten(&wrapped)));
        }
        let owner_rank = self
            .partition
            .borrow()
            .owner(&wrapped)
            .ok()
            .and_then(|r| u32::try_from(r).ok());
        Err(CoreError::OutOfLocal {
            field_index: self.field_index,
            point: format!("{wrapped:?}"),
            owner_rank,
        })
    }

    /// Write a cell. `point` must fall within `orig_part`; a write to the
    /// halo margin (owned by a neighbor) is rejected rather than silently
    /// shadowed by the next sync.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfLocalWrite`] if `point` is outside `orig_part`.
    pub fn set(&mut self, point: &IntPoint<D>, value: S::Elem) -> CoreResult<()> {
        let wrapped = self.wrap_point(point);
        if !self.orig_part.contains(&wrapped) {
            return Err(CoreError::OutOfLocalWrite {
                point: format!("{wrapped:?}"),
                rank: u32::try_from(self.my_rank).unwrap_or(u32::MAX),
            });
        }
        self.storage.set(self.halo_part.flatten(&wrapped), value);
        Ok(())
    }

    /// Place an object at `point`; an alias for [`Self::set`], named for the
    /// agent-placement use case (§4.3).
    ///
    /// # Errors
    ///
    /// See [`Self::set`].
    pub fn add_object(&mut self, point: &IntPoint<D>, value: S::Elem) -> CoreResult<()> {
        self.set(point, value)
    }

    /// Reset the cell at `point` to its empty value.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfLocalWrite`] if `point` is outside `orig_part`.
    pub fn remove_object(&mut self, point: &IntPoint<D>) -> CoreResult<()> {
        let wrapped = self.wrap_point(point);
        if !self.orig_part.contains(&wrapped) {
            return Err(CoreError::OutOfLocalWrite {
                point: format!("{wrapped:?}"),
                rank: u32::try_from(self.my_rank).unwrap_or(u32::MAX),
            });
        }
        self.storage.clear(self.halo_part.flatten(&wrapped));
        Ok(())
    }

    /// Move whatever occupies `from` to `to`, clearing `from`.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfLocal`] if `from` is outside the halo (nothing
    /// local to read); [`CoreError::OutOfLocalWrite`] if `to` is outside
    /// `orig_part` -- in that case the caller (typically
    /// [`crate::transport::Transporter`]) is expected to migrate the object
    /// to the owning worker instead.
    pub fn move_object(&mut self, from: &IntPoint<D>, to: &IntPoint<D>) -> CoreResult<()> {
        let value = self.get(from)?;
        self.set(to, value)?;
        let wrapped_from = self.wrap_point(from);
        if self.orig_part.contains(&wrapped_from) {
            self.storage.clear(self.halo_part.flatten(&wrapped_from));
        }
        Ok(())
    }

    fn compute_neighbors(&self) -> CoreResult<Vec<Neighbor<D>>> {
        let tree = self.partition.borrow();
        let world_size = tree.world_rect().size();
        let neighbor_ids = tree.neighbors(self.my_rank, &self.aoi);
        let mut out = Vec::with_capacity(neighbor_ids.len());
        for nid in neighbor_ids {
            let their_rect = *tree
                .node(nid)
                .expect("neighbor id returned by QuadTree::neighbors must exist")
                .rect();
            let their_halo = their_rect.expand_by_aoi(&self.aoi);

            let mut send_overlaps: Vec<IntHyperRect<D>> = their_halo
                .toroidal_shifts(&world_size)
                .iter()
                .filter_map(|shifted| self.orig_part.intersection(shifted))
                .collect();
            send_overlaps.sort_by_key(sort_key);

            let mut recv_overlaps: Vec<IntHyperRect<D>> = their_rect
                .toroidal_shifts(&world_size)
                .iter()
                .filter_map(|shifted| self.halo_part.intersection(shifted))
                .collect();
            recv_overlaps.sort_by_key(sort_key);
            recv_overlaps.reverse();

            out.push(Neighbor {
                worker_id: nid,
                send_overlaps,
                recv_overlaps,
            });
        }
        Ok(out)
    }

    /// Exchange ghost-margin data with every current neighbor (§4.4.1): pack
    /// our `send_overlaps` for each neighbor, exchange with all of them in
    /// one collective round, unpack the results into the matching
    /// `recv_overlaps`.
    ///
    /// # Errors
    ///
    /// Propagates [`CoreError::SerializationFailure`] or
    /// [`CoreError::TransportFault`] from packing or the underlying
    /// transport.
    pub fn sync(&mut self) -> CoreResult<()> {
        let mut sends = BTreeMap::new();
        for n in &self.neighbors {
            sends.insert(n.worker_id, self.storage.pack(&n.send_overlaps)?);
        }
        let recv_from: Vec<i64> = self.neighbors.iter().map(|n| n.worker_id).collect();
        let received = self.transport.neighbor_exchange(&sends, &recv_from)?;
        for n in &self.neighbors {
            if let Some(bytes) = received.get(&n.worker_id) {
                self.storage.unpack(&n.recv_overlaps, bytes)?;
            }
        }
        Ok(())
    }

    /// Gather every worker's `orig_part` into a single storage covering the
    /// whole world, at `root`. Every other worker gets `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Propagates packing or transport failures.
    pub fn collect(&self, root: i64) -> CoreResult<Option<S>> {
        let (members, extent) = {
            let tree = self.partition.borrow();
            (tree.leaf_ids(), *tree.world_rect())
        };
        self.collect_over(root, &members, extent)
    }

    /// Scatter a world-covering `whole` (required at `root`, ignored
    /// elsewhere) out to every worker's `orig_part`.
    ///
    /// # Errors
    ///
    /// Propagates packing or transport failures.
    pub fn distribute(&mut self, root: i64, whole: Option<&S>) -> CoreResult<()> {
        let members = self.partition.borrow().leaf_ids();
        self.distribute_over(root, &members, whole)
    }

    /// As [`Self::collect`], scoped to the leaves descending from `node_id`
    /// (or `node_id` itself, if it is currently a leaf) and that subtree's
    /// rectangle rather than the whole world.
    ///
    /// # Errors
    ///
    /// Propagates packing or transport failures.
    pub fn collect_group(&self, root: i64, node_id: i64) -> CoreResult<Option<S>> {
        let (members, extent) = {
            let tree = self.partition.borrow();
            let members = tree.descendant_leaf_ids(node_id);
            let extent = *tree
                .node(node_id)
                .ok_or_else(|| CoreError::TopologyError {
                    detail: format!("unknown node {node_id}"),
                })?
                .rect();
            (members, extent)
        };
        self.collect_over(root, &members, extent)
    }

    /// As [`Self::distribute`], scoped to `node_id`'s descendant leaves.
    ///
    /// # Errors
    ///
    /// Propagates packing or transport failures.
    pub fn distribute_group(&mut self, root: i64, node_id: i64, whole: Option<&S>) -> CoreResult<()> {
        let members = self.partition.borrow().descendant_leaf_ids(node_id);
        self.distribute_over(root, &members, whole)
    }

    fn collect_over(&self, root: i64, members: &[i64], extent: IntHyperRect<D>) -> CoreResult<Option<S>> {
        let payload = self.storage.pack(&[self.orig_part])?;
        let gathered = self.transport.gather(root, members, payload)?;
        let Some(payloads) = gathered else {
            return Ok(None);
        };
        let tree = self.partition.borrow();
        let mut whole = S::new_storage(extent);
        for (member, bytes) in members.iter().zip(payloads.iter()) {
            let rect = *tree
                .node(*member)
                .ok_or_else(|| CoreError::TopologyError {
                    detail: format!("unknown member {member}"),
                })?
                .rect();
            whole.unpack(&[rect], bytes)?;
        }
        Ok(Some(whole))
    }

    fn distribute_over(&mut self, root: i64, members: &[i64], whole: Option<&S>) -> CoreResult<()> {
        let payloads = if self.my_rank == root {
            let whole = whole.ok_or_else(|| CoreError::TopologyError {
                detail: "root must supply data to distribute".into(),
            })?;
            let tree = self.partition.borrow();
            let mut out = Vec::with_capacity(members.len());
            for member in members {
                let rect = *tree
                    .node(*member)
                    .ok_or_else(|| CoreError::TopologyError {
                        detail: format!("unknown member {member}"),
                    })?
                    .rect();
                out.push(whole.pack(&[rect])?);
            }
            Some(out)
        } else {
            None
        };
        let my_bytes = self.transport.scatter(root, members, payloads)?;
        self.storage.unpack(&[self.orig_part], &my_bytes)?;
        Ok(())
    }

    fn recompute_topology(&mut self) -> CoreResult<()> {
        let owned = self.partition.borrow().node(self.my_rank).filter(|n| n.is_leaf()).map(|n| *n.rect());
        match owned {
            Some(orig) => {
                self.orig_part = orig;
                self.halo_part = orig.expand_by_aoi(&self.aoi);
                self.private_part = orig.shrink_by_aoi(&self.aoi);
                self.storage.reshape(self.halo_part);
                self.neighbors = self.compute_neighbors()?;
            }
            None => {
                let empty = IntHyperRect {
                    id: self.my_rank,
                    ul: IntPoint::origin(),
                    br: IntPoint::origin(),
                };
                self.orig_part = empty;
                self.halo_part = empty;
                self.private_part = empty;
                self.storage.reshape(empty);
                self.neighbors.clear();
            }
        }
        Ok(())
    }

    fn try_post_commit(&mut self, node_id: i64) -> CoreResult<()> {
        let pending = self.pending.take().ok_or_else(|| CoreError::TopologyError {
            detail: "post_commit called without a matching pre_commit".into(),
        })?;
        let new_group = self.partition.borrow().descendant_leaf_ids(node_id);

        let mut sends: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
        if let (Some(old_rect), Some(old_storage)) = (pending.my_old_rect, &pending.old_storage) {
            let tree = self.partition.borrow();
            for &dest in &new_group {
                if dest == self.my_rank {
                    continue;
                }
                let Some(dest_rect) = tree.node(dest).map(|n| *n.rect()) else {
                    continue;
                };
                if let Some(sub) = old_rect.intersection(&dest_rect) {
                    sends.insert(dest, old_storage.pack(&[sub])?);
                }
            }
        }

        let new_rect = self.partition.borrow().node(self.my_rank).filter(|n| n.is_leaf()).map(|n| *n.rect());
        let mut recv_subrects: BTreeMap<i64, IntHyperRect<D>> = BTreeMap::new();
        if let Some(new_rect) = new_rect {
            for &(src, src_rect) in &pending.old_group_rects {
                if src == self.my_rank {
                    continue;
                }
                if let Some(sub) = src_rect.intersection(&new_rect) {
                    recv_subrects.insert(src, sub);
                }
            }
        }
        let recv_from: Vec<i64> = recv_subrects.keys().copied().collect();
        let received = if sends.is_empty() && recv_from.is_empty() {
            BTreeMap::new()
        } else {
            self.transport.neighbor_exchange(&sends, &recv_from)?
        };

        self.recompute_topology()?;

        if let (Some(old_rect), Some(old_storage), Some(new_rect)) =
            (pending.my_old_rect, &pending.old_storage, new_rect)
        {
            if let Some(sub) = old_rect.intersection(&new_rect) {
                let bytes = old_storage.pack(&[sub])?;
                self.storage.unpack(&[sub], &bytes)?;
            }
        }

        for (src, bytes) in received {
            if let Some(sub) = recv_subrects.get(&src) {
                self.storage.unpack(&[*sub], &bytes)?;
            }
        }

        Ok(())
    }
}

impl<S, const D: usize> RebalanceParticipant<D> for HaloField<S, D>
where
    S: GridStorage<D> + Clone,
{
    fn pre_commit(&mut self, _level: u32, node_id: i64) {
        let tree = self.partition.borrow();
        let group = tree.descendant_leaf_ids(node_id);
        let old_group_rects = group
            .iter()
            .filter_map(|id| tree.node(*id).map(|n| (*id, *n.rect())))
            .collect();
        let my_old_rect = if group.contains(&self.my_rank) {
            Some(self.orig_part)
        } else {
            None
        };
        drop(tree);
        let old_storage = my_old_rect.map(|_| self.storage.clone());
        self.pending = Some(PendingRebalance {
            old_group_rects,
            my_old_rect,
            old_storage,
        });
    }

    fn post_commit(&mut self, node_id: i64) {
        if let Err(e) = self.try_post_commit(node_id) {
            panic!("{}", e.diagnostic(u32::try_from(self.my_rank).unwrap_or(u32::MAX), node_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Aoi2, Point2, Rect2};
    use crate::grid::NumericGrid;

    fn world(size: i64) -> Rect2 {
        Rect2::new(-1, IntPoint([0, 0]), IntPoint([size, size]))
    }

    /// A transport for a world of exactly one worker: every method is
    /// reachable only with empty peer sets, since there is no one else to
    /// talk to.
    struct NullTransport(i64);

    impl CollectiveTransport for NullTransport {
        fn rank(&self) -> i64 {
            self.0
        }
        fn neighbor_exchange(
            &self,
            sends: &BTreeMap<i64, Vec<u8>>,
            recv_from: &[i64],
        ) -> CoreResult<BTreeMap<i64, Vec<u8>>> {
            assert!(sends.is_empty() && recv_from.is_empty());
            Ok(BTreeMap::new())
        }
        fn gather(&self, root: i64, _members: &[i64], payload: Vec<u8>) -> CoreResult<Option<Vec<Vec<u8>>>> {
            Ok((root == self.0).then_some(vec![payload]))
        }
        fn scatter(&self, _root: i64, _members: &[i64], payloads: Option<Vec<Vec<u8>>>) -> CoreResult<Vec<u8>> {
            Ok(payloads.and_then(|mut p| p.pop()).unwrap_or_default())
        }
        fn all_reduce_min(&self, value: f64, _members: &[i64]) -> CoreResult<f64> {
            Ok(value)
        }
        fn barrier(&self, _members: &[i64]) -> CoreResult<()> {
            Ok(())
        }
    }

    fn single_worker_field(aoi: Aoi2) -> HaloField<NumericGrid<i32, 2>, 2> {
        let tree = Rc::new(RefCell::new(QuadTree::<2>::new(world(100), 1).unwrap()));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(NullTransport(0));
        HaloField::new(0, 0, aoi, tree, transport).unwrap()
    }

    #[test]
    fn get_outside_world_is_out_of_local() {
        let field = single_worker_field(Aoi2::new([2, 2]));
        let err = field.get(&Point2::new([500, 0])).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn set_within_orig_part_succeeds_outside_is_rejected() {
        let mut field = single_worker_field(Aoi2::new([0, 0]));
        assert!(field.set(&Point2::new([50, 50]), 7).is_ok());
        assert_eq!(field.get(&Point2::new([50, 50])).unwrap(), 7);
    }

    #[test]
    fn remove_object_resets_to_init_value() {
        let mut field = single_worker_field(Aoi2::new([0, 0]));
        field.set(&Point2::new([1, 1]), 9).unwrap();
        field.remove_object(&Point2::new([1, 1])).unwrap();
        assert_eq!(field.get(&Point2::new([1, 1])).unwrap(), 0);
    }

    #[test]
    fn move_object_clears_source() {
        let mut field = single_worker_field(Aoi2::new([0, 0]));
        field.set(&Point2::new([1, 1]), 5).unwrap();
        field.move_object(&Point2::new([1, 1]), &Point2::new([2, 2])).unwrap();
        assert_eq!(field.get(&Point2::new([1, 1])).unwrap(), 0);
        assert_eq!(field.get(&Point2::new([2, 2])).unwrap(), 5);
    }

    #[test]
    fn collect_on_single_worker_round_trips() {
        let mut field = single_worker_field(Aoi2::new([0, 0]));
        field.set(&Point2::new([3, 3]), 42).unwrap();
        let whole = field.collect(0).unwrap().expect("root receives the gathered grid");
        let flat = whole.rect().flatten(&Point2::new([3, 3]));
        assert_eq!(whole.get(flat), 42);
    }
}
