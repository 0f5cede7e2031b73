//! Agent transporter: per-neighbor serialization queues and multi-hop
//! forwarding over the partition manager's neighbor graph (§4.5).
//!
//! [`Transporter`] buffers outgoing [`Transportee`] envelopes per direct
//! neighbor, exchanges those buffers in one collective round via
//! [`sync`](Transporter::sync), and forwards anything that arrived for
//! someone else on to the next hop. A quadtree neighbor graph has diameter
//! `O(depth)`, so multi-hop delivery needs `sync()` called roughly once per
//! tick for as many ticks as the graph is deep; the coordination loop
//! guarantees at least one call per tick.

use crate::collectives::CollectiveTransport;
use crate::error::{CoreError, CoreResult};
use crate::geometry::IntPoint;
use crate::quadtree::QuadTree;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// What a [`Transportee`] carries, distinguishing a bare field object from
/// scheduled work (§4.5, "Transportee").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload<T> {
    /// Add `object` to the destination field at the envelope's `location`;
    /// no scheduling involved.
    Object(T),
    /// Add `agent` to the destination field and schedule it: `time < 0`
    /// means "at the next step", `time >= 0` means an absolute time.
    AgentWrapper { agent: T, ordering: i64, time: f64 },
    /// Schedule a recurring task identified by `step` (no field object is
    /// carried; the destination worker's scheduler already knows what `step`
    /// refers to).
    RepeatWrapper {
        step: i64,
        ordering: i64,
        time: f64,
        interval: f64,
    },
}

/// An envelope migrating a payload to `destination_rank`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transportee<T, const D: usize> {
    pub destination_rank: i64,
    /// Field to insert into on arrival; negative means "no field insert".
    pub field_index: i64,
    pub location: IntPoint<D>,
    pub payload: Payload<T>,
}

/// Receives arrived envelopes so the coordination loop can hand them to the
/// right field and the application's scheduler (§4.6, "drain inbox").
pub trait LocalScheduler<T> {
    /// Schedule `agent` once, per `ordering`/`time` (see [`Payload::AgentWrapper`]).
    fn schedule_once(&mut self, agent: T, ordering: i64, time: f64);
    /// Schedule a recurring task, per [`Payload::RepeatWrapper`].
    fn schedule_repeating(&mut self, step: i64, ordering: i64, time: f64, interval: f64);
}

/// Per-neighbor outgoing queues and multi-hop forwarding over a partition's
/// neighbor graph.
pub struct Transporter<T, const D: usize> {
    my_rank: i64,
    partition: Rc<RefCell<QuadTree<D>>>,
    transport: Rc<dyn CollectiveTransport>,
    direct_neighbors: Vec<i64>,
    outgoing: HashMap<i64, Vec<Transportee<T, D>>>,
    /// Envelopes that arrived destined for this worker, drained by the
    /// coordination loop each tick.
    pub inbox: Vec<Transportee<T, D>>,
}

impl<T, const D: usize> Transporter<T, D>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Build a transporter for `my_rank`, using `aoi` to determine the
    /// direct-neighbor set (the same neighbor relation a halo field with
    /// that aoi would compute).
    #[must_use]
    pub fn new(
        my_rank: i64,
        aoi: &crate::geometry::AreaOfInterest<D>,
        partition: Rc<RefCell<QuadTree<D>>>,
        transport: Rc<dyn CollectiveTransport>,
    ) -> Self {
        let direct_neighbors = partition.borrow().neighbors(my_rank, aoi);
        Self {
            my_rank,
            partition,
            transport,
            direct_neighbors,
            outgoing: HashMap::new(),
            inbox: Vec::new(),
        }
    }

    /// Recompute the direct-neighbor set after a topology mutation. Callers
    /// typically invoke this from their own `RebalanceParticipant::post_commit`.
    pub fn refresh_neighbors(&mut self, aoi: &crate::geometry::AreaOfInterest<D>) {
        self.direct_neighbors = self.partition.borrow().neighbors(self.my_rank, aoi);
    }

    fn choose_next_hop(&self, destination_rank: i64) -> CoreResult<i64> {
        if self.direct_neighbors.contains(&destination_rank) {
            return Ok(destination_rank);
        }
        self.direct_neighbors
            .iter()
            .min()
            .copied()
            .ok_or_else(|| CoreError::Unroutable {
                destination: u32::try_from(destination_rank).unwrap_or(u32::MAX),
            })
    }

    fn enqueue(&mut self, envelope: Transportee<T, D>) -> CoreResult<()> {
        let hop = self.choose_next_hop(envelope.destination_rank)?;
        self.outgoing.entry(hop).or_default().push(envelope);
        Ok(())
    }

    /// Hand a bare object off to `destination_rank`, to be added to field
    /// `field_index` at `location` on arrival.
    ///
    /// # Errors
    ///
    /// [`CoreError::Unroutable`] if this worker has no direct neighbor to
    /// forward through (an isolated single-worker world).
    pub fn migrate(
        &mut self,
        object: T,
        destination_rank: i64,
        field_index: i64,
        location: IntPoint<D>,
    ) -> CoreResult<()> {
        self.enqueue(Transportee {
            destination_rank,
            field_index,
            location,
            payload: Payload::Object(object),
        })
    }

    /// Hand an agent off with scheduling metadata (§4.5, "agent-wrapper").
    ///
    /// # Errors
    ///
    /// See [`Self::migrate`].
    pub fn migrate_agent(
        &mut self,
        agent: T,
        destination_rank: i64,
        field_index: i64,
        location: IntPoint<D>,
        ordering: i64,
        time: f64,
    ) -> CoreResult<()> {
        self.enqueue(Transportee {
            destination_rank,
            field_index,
            location,
            payload: Payload::AgentWrapper { agent, ordering, time },
        })
    }

    /// Serialize every direct neighbor's outgoing queue, exchange in one
    /// collective round, decode what arrived, forward anything not destined
    /// for this worker, and append the rest to [`Self::inbox`].
    ///
    /// # Errors
    ///
    /// Propagates [`CoreError::SerializationFailure`] or a transport
    /// failure from the underlying [`CollectiveTransport`].
    pub fn sync(&mut self) -> CoreResult<()> {
        let mut sends: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
        for (&neighbor, queue) in &self.outgoing {
            let bytes = postcard::to_allocvec(queue).map_err(|e| CoreError::SerializationFailure {
                detail: e.to_string(),
            })?;
            sends.insert(neighbor, bytes);
        }
        self.outgoing.clear();

        let received = self.transport.neighbor_exchange(&sends, &self.direct_neighbors)?;
        let mut to_forward = Vec::new();
        for bytes in received.values() {
            if bytes.is_empty() {
                continue;
            }
            let batch: Vec<Transportee<T, D>> =
                postcard::from_bytes(bytes).map_err(|e| CoreError::SerializationFailure {
                    detail: e.to_string(),
                })?;
            for envelope in batch {
                if envelope.destination_rank == self.my_rank {
                    self.inbox.push(envelope);
                } else {
                    to_forward.push(envelope);
                }
            }
        }
        for envelope in to_forward {
            self.enqueue(envelope)?;
        }
        Ok(())
    }

    /// Drain [`Self::inbox`], handing agent/repeat payloads to `scheduler`.
    /// Returns the drained envelopes so the caller can add bare and agent
    /// objects to the right field by `field_index`/`location`.
    pub fn drain_inbox(&mut self, scheduler: &mut dyn LocalScheduler<T>) -> Vec<Transportee<T, D>> {
        let drained: Vec<_> = self.inbox.drain(..).collect();
        for envelope in &drained {
            match &envelope.payload {
                Payload::Object(_) => {}
                Payload::AgentWrapper { agent, ordering, time } => {
                    scheduler.schedule_once(agent.clone(), *ordering, *time);
                }
                Payload::RepeatWrapper { step, ordering, time, interval } => {
                    scheduler.schedule_repeating(*step, *ordering, *time, *interval);
                }
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Aoi2, Point2};
    use crate::quadtree::QuadTree;
    use crate::testing::square_world;

    struct RecordingScheduler {
        scheduled: Vec<(i64, i64, f64)>,
        repeats: Vec<(i64, i64, f64, f64)>,
    }

    impl LocalScheduler<i32> for RecordingScheduler {
        fn schedule_once(&mut self, agent: i32, ordering: i64, time: f64) {
            self.scheduled.push((i64::from(agent), ordering, time));
        }
        fn schedule_repeating(&mut self, step: i64, ordering: i64, time: f64, interval: f64) {
            self.repeats.push((step, ordering, time, interval));
        }
    }

    struct LoopbackTransport(i64);
    impl CollectiveTransport for LoopbackTransport {
        fn rank(&self) -> i64 {
            self.0
        }
        fn neighbor_exchange(
            &self,
            _sends: &BTreeMap<i64, Vec<u8>>,
            _recv_from: &[i64],
        ) -> CoreResult<BTreeMap<i64, Vec<u8>>> {
            Ok(BTreeMap::new())
        }
        fn gather(&self, _root: i64, _members: &[i64], _payload: Vec<u8>) -> CoreResult<Option<Vec<Vec<u8>>>> {
            Ok(None)
        }
        fn scatter(&self, _root: i64, _members: &[i64], _payloads: Option<Vec<Vec<u8>>>) -> CoreResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn all_reduce_min(&self, value: f64, _members: &[i64]) -> CoreResult<f64> {
            Ok(value)
        }
        fn barrier(&self, _members: &[i64]) -> CoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn migrate_to_isolated_worker_is_unroutable() {
        let tree = Rc::new(RefCell::new(QuadTree::<2>::new(square_world(100), 1).unwrap()));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(LoopbackTransport(0));
        let mut t = Transporter::<i32, 2>::new(0, &Aoi2::new([2, 2]), tree, transport);
        let err = t.migrate(7, 1, 0, Point2::new([0, 0])).unwrap_err();
        assert!(matches!(err, CoreError::Unroutable { .. }));
    }

    #[test]
    fn drain_inbox_schedules_agent_and_repeat_payloads() {
        let tree = Rc::new(RefCell::new(QuadTree::<2>::new(square_world(100), 1).unwrap()));
        let transport: Rc<dyn CollectiveTransport> = Rc::new(LoopbackTransport(0));
        let mut t = Transporter::<i32, 2>::new(0, &Aoi2::new([2, 2]), tree, transport);
        t.inbox.push(Transportee {
            destination_rank: 0,
            field_index: -1,
            location: Point2::new([0, 0]),
            payload: Payload::AgentWrapper { agent: 42, ordering: 1, time: -1.0 },
        });
        t.inbox.push(Transportee {
            destination_rank: 0,
            field_index: -1,
            location: Point2::new([0, 0]),
            payload: Payload::RepeatWrapper { step: 5, ordering: 0, time: 1.0, interval: 2.0 },
        });
        let mut scheduler = RecordingScheduler { scheduled: Vec::new(), repeats: Vec::new() };
        let drained = t.drain_inbox(&mut scheduler);
        assert_eq!(drained.len(), 2);
        assert_eq!(scheduler.scheduled, vec![(42, 1, -1.0)]);
        assert_eq!(scheduler.repeats, vec![(5, 0, 1.0, 2.0)]);
    }
}
