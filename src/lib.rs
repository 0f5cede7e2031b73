//! # Tessera
//!
//! A distributed spatial substrate for agent-based simulation: a quadtree
//! partition manager, halo-exchanged grid storage, an agent transporter, a
//! remote read proxy, and the coordination loop tying them together for a
//! fixed set of bulk-synchronous-parallel workers.
//!
//! ## Module overview
//!
//! - [`geometry`] - toroidal integer-coordinate arithmetic and half-open
//!   hyperrectangles, generic over a const dimensionality `D`.
//! - [`quadtree`] - [`quadtree::QuadTree`], the partition manager: an arena
//!   of nodes where leaf ids double as worker ranks, with split/merge/
//!   move-origin mutations and a [`quadtree::RebalanceParticipant`] callback
//!   protocol for clients that need to ride a topology change.
//! - [`grid`] - [`grid::GridStorage`], implemented by [`grid::NumericGrid`]
//!   (dense primitive cells) and [`grid::ObjectGrid`] (opaque application
//!   objects).
//! - [`collectives`] - [`collectives::CollectiveTransport`], the MPI-like
//!   collective-operations contract the rest of the crate is built against.
//! - [`halo`] - [`halo::HaloField`], a grid bound to one worker's partition
//!   and kept in sync with its neighbors' ghost margins.
//! - [`transport`] - [`transport::Transporter`], per-neighbor outgoing
//!   queues and multi-hop forwarding for migrating agents between workers.
//! - [`proxy`] - [`proxy::RemoteReadProxy`], the correctness fallback for a
//!   read that misses both a field's owned region and its halo.
//! - [`coordinator`] - [`coordinator::CoordinationLoop`] and
//!   [`coordinator::RuntimeContext`], the per-tick orchestration described
//!   in §4.7: stop the rebalance timer, halo-sync, transporter-sync, drain
//!   the inbox, restart the timer, then (after the application's own tick)
//!   all-reduce the shared clock.
//! - [`metrics`] - an extensible per-tick metrics sink the coordination loop
//!   optionally records into.
//! - [`error`] - [`error::CoreError`] and the propagation policy: every
//!   variant but [`error::CoreError::OutOfLocal`] is fatal.
//! - [`testing`] - a channel-backed [`collectives::CollectiveTransport`]
//!   plus a real-thread [`testing::MockCluster`] and fixture builders, used
//!   by this crate's own test suite and available to downstream crates
//!   building scenario tests against a live topology.
//!
//! ## Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use tessera::collectives::CollectiveTransport;
//! use tessera::geometry::{Aoi2, Point2, Rect2};
//! use tessera::grid::ObjectGrid;
//! use tessera::halo::HaloField;
//! use tessera::quadtree::QuadTree;
//! use tessera::testing::MockCluster;
//!
//! MockCluster::run(&[0], |rank, transport| {
//!     let world = Rect2::new(-1, Point2::new([0, 0]), Point2::new([100, 100]));
//!     let tree = Rc::new(RefCell::new(QuadTree::<2>::new(world, 1).unwrap()));
//!     let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);
//!
//!     let field = HaloField::<ObjectGrid<u64, 2>, 2>::new(
//!         0, rank, Aoi2::new([1, 1]), tree, transport,
//!     ).unwrap();
//!     assert_eq!(field.field_index(), 0);
//! });
//! ```

pub mod collectives;
pub mod coordinator;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod halo;
pub mod proxy;
pub mod quadtree;
pub mod testing;
pub mod transport;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use collectives::CollectiveTransport;
pub use coordinator::{CoordinationLoop, RuntimeContext, Syncable};
pub use error::{CoreError, CoreResult};
pub use geometry::{AreaOfInterest, IntHyperRect, IntPoint};
pub use grid::{GridStorage, NumericGrid, ObjectGrid};
pub use halo::{HaloField, Neighbor};
pub use proxy::RemoteReadProxy;
pub use quadtree::{QuadTree, QuadTreeNode, RebalanceParticipant};
pub use transport::{LocalScheduler, Payload, Transportee, Transporter};
