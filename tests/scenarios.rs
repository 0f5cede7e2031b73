//! Scenario and property tests against the spatial substrate (§8).
//!
//! The concrete scenarios describe a specific 22-partition "classical test
//! vector" with fixed node ids; that exact numbering isn't reproducible here
//! (nothing upstream of this crate pins down how such a tree is built), so
//! these tests build their own self-consistent fixtures via
//! [`tessera::testing::uniform_quadtree`] and [`tessera::quadtree::QuadTree`]
//! directly, and assert the same properties the scenarios describe.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use tessera::collectives::CollectiveTransport;
use tessera::geometry::{Aoi2, IntHyperRect, Point2};
use tessera::grid::{NumericGrid, ObjectGrid};
use tessera::halo::HaloField;
use tessera::quadtree::QuadTree;
use tessera::testing::{square_world, uniform_quadtree, MockCluster};
use tessera::transport::Transporter;

fn assert_tiling(tree: &QuadTree<2>) {
    let leaves = tree.leaf_rects();
    let total_area: i64 = leaves.iter().map(IntHyperRect::area).sum();
    assert_eq!(total_area, tree.world_rect().area());
    for (i, a) in leaves.iter().enumerate() {
        for b in &leaves[i + 1..] {
            assert!(a.intersection(b).is_none(), "leaves {a:?} and {b:?} overlap");
        }
    }
}

fn assert_unique_ids(tree: &QuadTree<2>) {
    let ids = tree.leaf_ids();
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len());
}

/// Invariants 1/2: leaf rectangles tile the world exactly and every leaf id
/// is unique, after a sequence of splits (S3's repeated-rebalance shape).
#[test]
fn tiling_and_id_uniqueness_survive_repeated_splits() {
    let mut tree = QuadTree::<2>::new(square_world(100), 13).unwrap();
    tree.split(Point2::new([40, 60])).unwrap();
    let second_target = tree.get_leaf(&Point2::new([10, 80])).unwrap().id();
    tree.split(second_target).unwrap();

    assert_eq!(tree.leaf_ids().len(), 7);
    assert_tiling(&tree);
    assert_unique_ids(&tree);
}

/// Invariant 8 / S3: a cell set before a repartition is still readable,
/// unchanged, from whichever worker owns it afterward.
///
/// Splitting a 4-child internal node and immediately `move_origin`-ing it
/// again frees exactly those 4 leaf ids and reallocates exactly that many,
/// so (per the id pool's LIFO reuse) the same 4 worker ranks persist across
/// the move, just remapped to different quadrants -- which is what lets this
/// test use a fixed `MockCluster` rank set.
#[test]
fn move_origin_preserves_data_for_its_new_owner() {
    let ranks = [1i64, 2, 3, 4];

    MockCluster::run(&ranks, |rank, transport| {
        let mut tree = QuadTree::<2>::new(square_world(100), 13).unwrap();
        tree.split(Point2::new([50, 50])).unwrap();
        assert_eq!(tree.leaf_ids(), vec![1, 2, 3, 4]);
        let tree = Rc::new(RefCell::new(tree));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);

        let halo_field = Rc::new(RefCell::new(
            HaloField::<NumericGrid<i32, 2>, 2>::new(0, rank, Aoi2::new([0, 0]), tree.clone(), transport).unwrap(),
        ));
        tree.borrow_mut().register_participant(halo_field.clone());

        if rank == 1 {
            halo_field.borrow_mut().set(&Point2::new([10, 10]), 42).unwrap();
        }

        tree.borrow_mut().move_origin(0, Point2::new([60, 70])).unwrap();

        // mask math for origin (60, 70): x<60,y<70 -> mask0; the move's LIFO
        // id reuse assigns mask0 the highest freed id, which for a plain
        // 4-child split of root (ids 1..=4) is 4.
        let new_owner = tree.borrow().owner(&Point2::new([10, 10])).unwrap();
        assert_eq!(new_owner, 4);

        if rank == 4 {
            assert_eq!(halo_field.borrow().get(&Point2::new([10, 10])).unwrap(), 42);
        }
        if rank == 1 {
            assert!(halo_field.borrow().get(&Point2::new([10, 10])).is_err());
        }
    });
}

/// Invariant 9: reading a point and its toroidal-wrapped equivalent must
/// agree.
#[test]
fn toroidal_read_parity() {
    struct Loopback;
    impl CollectiveTransport for Loopback {
        fn rank(&self) -> i64 {
            0
        }
        fn neighbor_exchange(
            &self,
            _sends: &std::collections::BTreeMap<i64, Vec<u8>>,
            _recv_from: &[i64],
        ) -> tessera::CoreResult<std::collections::BTreeMap<i64, Vec<u8>>> {
            Ok(std::collections::BTreeMap::new())
        }
        fn gather(&self, _root: i64, _m: &[i64], _p: Vec<u8>) -> tessera::CoreResult<Option<Vec<Vec<u8>>>> {
            Ok(None)
        }
        fn scatter(&self, _root: i64, _m: &[i64], _p: Option<Vec<Vec<u8>>>) -> tessera::CoreResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn all_reduce_min(&self, v: f64, _m: &[i64]) -> tessera::CoreResult<f64> {
            Ok(v)
        }
        fn barrier(&self, _m: &[i64]) -> tessera::CoreResult<()> {
            Ok(())
        }
    }

    let tree = Rc::new(RefCell::new(QuadTree::<2>::new(square_world(100), 1).unwrap()));
    let transport: Rc<dyn CollectiveTransport> = Rc::new(Loopback);
    let mut field =
        HaloField::<NumericGrid<i32, 2>, 2>::new(0, 0, Aoi2::new([0, 0]), tree, transport).unwrap();
    field.set(&Point2::new([5, 5]), 77).unwrap();
    let base = field.get(&Point2::new([5, 5])).unwrap();
    let wrapped = field.get(&Point2::new([105, -195])).unwrap();
    assert_eq!(base, wrapped);
}

/// Invariant 10 (a self-consistent stand-in for S6): the neighbor set
/// returned by the partition manager equals every other leaf whose
/// AOI-expanded, toroidally-shifted halo intersects the queried leaf.
#[test]
fn neighbor_set_matches_brute_force_intersection() {
    let tree = uniform_quadtree(400, 2);
    let aoi = Aoi2::new([1, 1]);
    let world_size = tree.world_rect().size();
    let rects_by_id: Vec<(i64, IntHyperRect<2>)> = tree.leaf_ids().into_iter().zip(tree.leaf_rects()).collect();

    for &(leaf, rect) in &rects_by_id {
        let computed: HashSet<i64> = tree.neighbors(leaf, &aoi).into_iter().collect();
        let halo = rect.expand_by_aoi(&aoi);
        let shifted = halo.toroidal_shifts(&world_size);
        let expected: HashSet<i64> = rects_by_id
            .iter()
            .filter(|(id, _)| *id != leaf)
            .filter(|(_, r)| shifted.iter().any(|h| h.intersects(r)))
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(computed, expected, "leaf {leaf} neighbor mismatch");
    }
}

/// S2 — an agent at `(499, 499)` stepped to `(501, 501)` must land in the
/// diagonal quadrant's inbox and be gone from the origin worker's field.
#[test]
fn agent_migration_across_diagonal_quadrant() {
    let mut seed = QuadTree::<2>::new(square_world(1000), 4).unwrap();
    seed.split(Point2::new([500, 500])).unwrap();
    let origin_rank = seed.owner(&Point2::new([499, 499])).unwrap();
    let dest_rank = seed.owner(&Point2::new([501, 501])).unwrap();
    assert_ne!(origin_rank, dest_rank);
    let ranks = seed.leaf_ids();

    MockCluster::run(&ranks, move |rank, transport| {
        let mut tree = QuadTree::<2>::new(square_world(1000), 4).unwrap();
        tree.split(Point2::new([500, 500])).unwrap();
        let tree = Rc::new(RefCell::new(tree));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);
        let aoi = Aoi2::new([2, 2]);

        let field = Rc::new(RefCell::new(
            HaloField::<ObjectGrid<u64, 2>, 2>::new(0, rank, aoi, tree.clone(), transport.clone()).unwrap(),
        ));
        let mut transporter = Transporter::<u64, 2>::new(rank, &aoi, tree.clone(), transport);

        if rank == origin_rank {
            field.borrow_mut().set(&Point2::new([499, 499]), Some(1)).unwrap();
            field.borrow_mut().remove_object(&Point2::new([499, 499])).unwrap();
            transporter.migrate(1, dest_rank, 0, Point2::new([501, 501])).unwrap();
        }

        // A uniform 4-leaf tree has neighbor-graph diameter 1.
        transporter.sync().unwrap();

        if rank == dest_rank {
            assert_eq!(transporter.inbox.len(), 1);
            assert_eq!(transporter.inbox[0].destination_rank, dest_rank);
        }
        if rank == origin_rank {
            assert_eq!(
                field.borrow().get(&Point2::new([499, 499])).unwrap(),
                None,
                "origin worker must no longer hold the migrated agent"
            );
        }
    });
}

/// S4 — a multi-hop migration across a deeper tree must still arrive after
/// enough `sync()` calls (bounded by the neighbor graph's diameter).
#[test]
fn multi_hop_migration_reaches_a_non_neighbor_leaf() {
    let seed = uniform_quadtree(800, 2); // 16 leaves, depth 2
    let leaves = seed.leaf_ids();
    let origin_rank = leaves[0];
    let dest_rank = *leaves.last().unwrap();
    let dest_rect = *seed.node(dest_rank).unwrap().rect();

    MockCluster::run(&leaves.clone(), move |rank, transport| {
        let tree = Rc::new(RefCell::new(uniform_quadtree(800, 2)));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);
        let aoi = Aoi2::new([1, 1]);
        let mut transporter = Transporter::<u64, 2>::new(rank, &aoi, tree, transport);

        if rank == origin_rank {
            transporter.migrate(7, dest_rank, -1, dest_rect.ul).unwrap();
        }

        for _ in 0..8 {
            transporter.sync().unwrap();
        }

        if rank == dest_rank {
            let mine: Vec<_> = transporter.inbox.iter().filter(|t| t.destination_rank == rank).collect();
            assert_eq!(mine.len(), 1);
        }
    });
}

/// S5 — a read inside a foreign quadrant (outside any halo) must return the
/// same value the owning worker stores there, via the remote read proxy.
#[test]
fn remote_read_matches_owner_storage() {
    let seed = uniform_quadtree(400, 1); // 4 leaves
    let leaves = seed.leaf_ids();
    let reader_rank = leaves[0];
    let owner_rank = leaves[1];
    let owner_rect = *seed.node(owner_rank).unwrap().rect();
    let target = Point2::new([owner_rect.ul.get(0) + 5, owner_rect.ul.get(1) + 5]);

    MockCluster::run(&leaves.clone(), move |rank, transport| {
        let tree = Rc::new(RefCell::new(uniform_quadtree(400, 1)));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);
        let aoi = Aoi2::new([2, 2]);

        let field = Rc::new(RefCell::new(
            HaloField::<NumericGrid<i32, 2>, 2>::new(0, rank, aoi, tree.clone(), transport.clone()).unwrap(),
        ));
        if rank == owner_rank {
            field.borrow_mut().set(&target, 123).unwrap();
        }

        let mut proxy = tessera::RemoteReadProxy::new(rank, tree, transport);
        proxy.register_field(field);

        if rank == reader_rank {
            proxy.queue(0, target).unwrap();
            let results = proxy.resolve_all().unwrap();
            assert_eq!(results[0].clone().unwrap(), 123);
        } else {
            proxy.resolve_all().unwrap();
        }
    });
}

/// Invariant 7: `revise_time` (all-reduce-min) never returns more than any
/// individual worker's input.
#[test]
fn revise_time_is_never_greater_than_any_input() {
    MockCluster::run(&[0, 1, 2], |rank, transport| {
        let members = vec![0, 1, 2];
        let inputs = [10.0, 3.0, 7.0];
        let mine = inputs[usize::try_from(rank).unwrap()];
        let result = transport.all_reduce_min(mine, &members).unwrap();
        assert!(result <= mine);
        assert_eq!(result, 3.0);
    });
}
