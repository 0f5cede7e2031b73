//! Remote read proxy: resolves an [`crate::error::CoreError::OutOfLocal`]
//! miss by querying whichever worker currently owns the point (§4.6).
//!
//! A halo field's ghost margin only reaches `aoi` cells past its own
//! partition; any read further out has to go through a worker that isn't
//! a direct neighbor. [`RemoteReadProxy`] batches every such miss accumulated
//! during a tick and resolves the whole batch in two collective rounds: one
//! world-wide exchange carrying each worker's outstanding requests (grouped
//! by owner, empty for owners nobody queried), and a second carrying the
//! replies back. This trades bandwidth (every worker exchanges a message
//! with every other worker, even an empty one, each round) for not needing
//! a dynamic "who is about to query me" membership -- the same trade a halo
//! sync avoids only because its neighbor set is static between rebalances.

use crate::collectives::CollectiveTransport;
use crate::error::{CoreError, CoreResult};
use crate::geometry::IntPoint;
use crate::grid::GridStorage;
use crate::halo::HaloField;
use crate::quadtree::QuadTree;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReadRequest<const D: usize> {
    field_index: i64,
    point: IntPoint<D>,
}

/// Resolves out-of-local reads against whichever field/worker actually owns
/// the point.
pub struct RemoteReadProxy<S, const D: usize> {
    my_rank: i64,
    partition: Rc<RefCell<QuadTree<D>>>,
    transport: Rc<dyn CollectiveTransport>,
    fields: HashMap<i64, Rc<RefCell<HaloField<S, D>>>>,
    /// Queued misses: `(owner_rank, request)`, in submission order.
    outgoing: Vec<(i64, ReadRequest<D>)>,
}

impl<S, const D: usize> RemoteReadProxy<S, D>
where
    S: GridStorage<D> + Clone,
    S::Elem: Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(my_rank: i64, partition: Rc<RefCell<QuadTree<D>>>, transport: Rc<dyn CollectiveTransport>) -> Self {
        Self {
            my_rank,
            partition,
            transport,
            fields: HashMap::new(),
            outgoing: Vec::new(),
        }
    }

    /// Make a local field servable to other workers' remote reads.
    pub fn register_field(&mut self, field: Rc<RefCell<HaloField<S, D>>>) {
        let field_index = field.borrow().field_index();
        self.fields.insert(field_index, field);
    }

    /// Queue a miss against field `field_index` at `point`, to be resolved on
    /// the next [`Self::resolve_all`]. Returns the token (its index in the
    /// batch) needed to read back the matching result.
    ///
    /// # Errors
    ///
    /// [`CoreError::TopologyError`] if `point` lies outside the world.
    pub fn queue(&mut self, field_index: i64, point: IntPoint<D>) -> CoreResult<usize> {
        let owner = self.partition.borrow().owner(&point)?;
        self.outgoing.push((owner, ReadRequest { field_index, point }));
        Ok(self.outgoing.len() - 1)
    }

    /// Resolve every queued request in two collective rounds, in submission
    /// order; each slot is `Ok(value)` or a propagated read failure.
    /// Clears the queue.
    ///
    /// # Errors
    ///
    /// Propagates a transport-level failure; does not itself fail for an
    /// individual miss (that shows up as `Err` in the per-slot result).
    pub fn resolve_all(&mut self) -> CoreResult<Vec<CoreResult<S::Elem>>> {
        let members = self.partition.borrow().leaf_ids();
        let peers: Vec<i64> = members.iter().copied().filter(|&r| r != self.my_rank).collect();

        let mut requests_by_owner: BTreeMap<i64, Vec<ReadRequest<D>>> = BTreeMap::new();
        for (owner, req) in &self.outgoing {
            requests_by_owner.entry(*owner).or_default().push(req.clone());
        }

        let mut request_sends: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
        for &peer in &peers {
            let batch = requests_by_owner.get(&peer).cloned().unwrap_or_default();
            request_sends.insert(peer, encode(&batch)?);
        }
        let inbound_requests = self.transport.neighbor_exchange(&request_sends, &peers)?;

        let mut reply_sends: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
        for &peer in &peers {
            let batch: Vec<ReadRequest<D>> = match inbound_requests.get(&peer) {
                Some(bytes) => decode(bytes)?,
                None => Vec::new(),
            };
            let replies: Vec<Option<S::Elem>> = batch
                .iter()
                .map(|r| {
                    self.fields
                        .get(&r.field_index)
                        .and_then(|f| f.borrow().get(&r.point).ok())
                })
                .collect();
            reply_sends.insert(peer, encode(&replies)?);
        }
        // Round 2 is a full all-to-all too, mirroring round 1: every peer
        // sends every peer a reply (empty if nobody queried them), so the
        // mesh never has a leftover, unconsumed message sitting in a channel
        // for the next tick's round 1 to misread.
        let inbound_replies = self.transport.neighbor_exchange(&reply_sends, &peers)?;

        let mut replies_by_owner: BTreeMap<i64, std::vec::IntoIter<Option<S::Elem>>> = BTreeMap::new();
        for (&owner, bytes) in &inbound_replies {
            let decoded: Vec<Option<S::Elem>> = decode(bytes)?;
            replies_by_owner.insert(owner, decoded.into_iter());
        }

        let mut out = Vec::with_capacity(self.outgoing.len());
        for (owner, req) in self.outgoing.drain(..) {
            let value = replies_by_owner.get_mut(&owner).and_then(std::iter::Iterator::next).flatten();
            out.push(value.ok_or_else(|| CoreError::OutOfLocal {
                field_index: req.field_index,
                point: format!("{:?}", req.point),
                owner_rank: u32::try_from(owner).ok(),
            }));
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| CoreError::SerializationFailure { detail: e.to_string() })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    postcard::from_bytes(bytes).map_err(|e| CoreError::SerializationFailure { detail: e.to_string() })
}
