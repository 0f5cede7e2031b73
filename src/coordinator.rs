//! Per-tick coordination loop (§4.7) and the `RuntimeContext` that carries
//! its configuration.
//!
//! The loop is split the way the application actually drives it: a call to
//! [`CoordinationLoop::pre_schedule`] (steps 1-5 -- stop the rebalance
//! timer, halo-sync every registered field, sync the transporter, drain its
//! inbox into fields and the local scheduler, restart the timer) runs
//! before the application's own tick logic (step 6, entirely outside this
//! crate), followed by [`CoordinationLoop::revise_time`] (step 7: all-reduce
//! the minimum next-scheduled time across every worker).

use crate::collectives::CollectiveTransport;
use crate::error::CoreResult;
use crate::geometry::IntPoint;
use crate::grid::GridStorage;
use crate::halo::HaloField;
#[cfg(feature = "metrics")]
use crate::metrics::MetricsCollector;
use crate::quadtree::QuadTree;
use crate::transport::{LocalScheduler, Payload, Transporter};
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Any halo-exchanged field, erased over its storage strategy, so the loop
/// can hold a single ordered list of heterogeneous fields and sync them all
/// in registration order (§5, ordering guarantee (d) does not apply here,
/// but registration order is still the documented contract for (a)/(c)).
pub trait Syncable {
    /// # Errors
    ///
    /// Propagates whatever [`HaloField::sync`] returns.
    fn sync(&mut self) -> CoreResult<()>;
}

impl<S, const D: usize> Syncable for HaloField<S, D>
where
    S: GridStorage<D> + Clone,
{
    fn sync(&mut self) -> CoreResult<()> {
        HaloField::sync(self)
    }
}

/// Tracks wall-clock tick duration over a rolling window, the signal a
/// rebalance policy (outside this crate's scope) would read to decide
/// whether repartitioning is warranted.
struct RebalanceTimer {
    window: usize,
    samples: VecDeque<Duration>,
    running_since: Option<Instant>,
}

impl RebalanceTimer {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            running_since: None,
        }
    }

    fn stop(&mut self) {
        if let Some(start) = self.running_since.take() {
            if self.samples.len() == self.window {
                self.samples.pop_front();
            }
            self.samples.push_back(start.elapsed());
        }
    }

    fn start(&mut self) {
        self.running_since = Some(Instant::now());
    }

    fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / u32::try_from(self.samples.len()).unwrap_or(1))
    }
}

/// Per-worker configuration and ambient state for the coordination loop:
/// rank, world size, the rebalance-runtime timer's rolling window, and an
/// optional metrics sink (§6, "rolling-window size for the rebalance-runtime
/// timer (default 20 ticks)").
pub struct RuntimeContext {
    pub rank: i64,
    pub world_size: i64,
    timer: RebalanceTimer,
    #[cfg(feature = "metrics")]
    metrics: Option<MetricsCollector>,
}

/// Default rolling-window size for the rebalance-runtime timer, per §6.
pub const DEFAULT_REBALANCE_WINDOW: usize = 20;

impl RuntimeContext {
    #[must_use]
    pub fn new(rank: i64, world_size: i64) -> Self {
        Self::with_rebalance_window(rank, world_size, DEFAULT_REBALANCE_WINDOW)
    }

    #[must_use]
    pub fn with_rebalance_window(rank: i64, world_size: i64, window: usize) -> Self {
        Self {
            rank,
            world_size,
            timer: RebalanceTimer::new(window),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach a metrics sink; every tick records wall-clock duration, halo
    /// bytes, and migration counts into it.
    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The rebalance timer's rolling average tick duration, `None` until at
    /// least one full stop/start cycle has completed.
    #[must_use]
    pub fn average_tick_duration(&self) -> Option<Duration> {
        self.timer.average()
    }

    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_ref()
    }
}

/// Drives one worker's per-tick coordination, holding every registered
/// field in sync order plus the transporter that moves agents between them.
///
/// `S` is the storage strategy of the fields agents are placed into
/// directly from the transporter's inbox (an [`crate::grid::ObjectGrid`] in
/// the common case, `Elem = Option<T>`); any other registered field (e.g. a
/// numeric environment layer) only needs [`Syncable`] and is registered
/// through [`Self::register_aux_field`].
pub struct CoordinationLoop<T, S, const D: usize>
where
    S: GridStorage<D, Elem = Option<T>> + Clone,
    T: Clone + Serialize + DeserializeOwned,
{
    ctx: RuntimeContext,
    partition: Rc<RefCell<QuadTree<D>>>,
    transport: Rc<dyn CollectiveTransport>,
    registered: Vec<Rc<RefCell<dyn Syncable>>>,
    agent_fields: HashMap<i64, Rc<RefCell<HaloField<S, D>>>>,
    transporter: Transporter<T, D>,
}

impl<T, S, const D: usize> CoordinationLoop<T, S, D>
where
    S: GridStorage<D, Elem = Option<T>> + Clone,
    T: Clone + Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(
        ctx: RuntimeContext,
        partition: Rc<RefCell<QuadTree<D>>>,
        transport: Rc<dyn CollectiveTransport>,
        transporter: Transporter<T, D>,
    ) -> Self {
        Self {
            ctx,
            partition,
            transport,
            registered: Vec::new(),
            agent_fields: HashMap::new(),
            transporter,
        }
    }

    #[must_use]
    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Register a field whose storage matches `S`: halo-synced every tick,
    /// and addressable by field index when the transporter's inbox delivers
    /// an agent destined for it.
    pub fn register_field(&mut self, field: Rc<RefCell<HaloField<S, D>>>) {
        let field_index = field.borrow().field_index();
        self.agent_fields.insert(field_index, field.clone());
        self.registered.push(field);
    }

    /// Register a field that only needs halo sync, not inbox delivery (a
    /// numeric environment layer, for instance).
    pub fn register_aux_field(&mut self, field: Rc<RefCell<dyn Syncable>>) {
        self.registered.push(field);
    }

    /// Steps 1-5 of §4.7: stop the rebalance timer, halo-sync every
    /// registered field in registration order, sync the transporter, drain
    /// its inbox (scheduling agent/repeat payloads against `scheduler` and
    /// placing any payload carrying a field index into the matching field),
    /// then restart the timer. Call once per tick, before the application's
    /// own step.
    ///
    /// # Errors
    ///
    /// Propagates a halo sync, transporter sync, or field-placement failure.
    pub fn pre_schedule(&mut self, scheduler: &mut dyn LocalScheduler<T>) -> CoreResult<()> {
        self.ctx.timer.stop();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.ctx.metrics {
            metrics.increment_counter("tick_count", 1);
        }

        for field in &self.registered {
            field.borrow_mut().sync()?;
        }
        self.transporter.sync()?;
        let drained = self.transporter.drain_inbox(scheduler);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.ctx.metrics {
            metrics.increment_counter("migrations_delivered", u64::try_from(drained.len()).unwrap_or(u64::MAX));
        }
        self.place_delivered(drained)?;

        self.ctx.timer.start();
        Ok(())
    }

    fn place_delivered(&mut self, drained: Vec<crate::transport::Transportee<T, D>>) -> CoreResult<()> {
        for envelope in drained {
            if envelope.field_index < 0 {
                continue;
            }
            let Some(field) = self.agent_fields.get(&envelope.field_index) else {
                continue;
            };
            let value = match envelope.payload {
                Payload::Object(obj) => obj,
                Payload::AgentWrapper { agent, .. } => agent,
                Payload::RepeatWrapper { .. } => continue,
            };
            field.borrow_mut().add_object(&envelope.location, Some(value))?;
        }
        Ok(())
    }

    /// Step 7 of §4.7: all-reduce the minimum of `local_next_time` (this
    /// worker's next scheduled time, as reported by the application's own
    /// scheduler) across every worker. The result is the shared tick clock.
    ///
    /// # Errors
    ///
    /// Propagates a transport-level collective failure.
    pub fn revise_time(&self, local_next_time: f64) -> CoreResult<f64> {
        let members = self.partition.borrow().leaf_ids();
        self.transport.all_reduce_min(local_next_time, &members)
    }

    /// Read a cell local to this worker, or -- via [`crate::proxy`] -- the
    /// owning worker if `point` is outside every registered field's halo.
    /// Exposed mainly so application code has one obvious place to look;
    /// most reads go straight through a field's own `get`.
    ///
    /// # Errors
    ///
    /// [`crate::error::CoreError::TopologyError`] if `field_index` names no
    /// registered field.
    pub fn get_local(&self, field_index: i64, point: &IntPoint<D>) -> CoreResult<Option<T>> {
        let field = self
            .agent_fields
            .get(&field_index)
            .ok_or_else(|| crate::error::CoreError::TopologyError {
                detail: format!("no field registered at index {field_index}"),
            })?;
        field.borrow().get(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Aoi2, Point2, Rect2};
    use crate::grid::ObjectGrid;
    use crate::testing::MockCluster;

    fn world(size: i64) -> Rect2 {
        Rect2::new(-1, Point2::new([0, 0]), Point2::new([size, size]))
    }

    struct NullScheduler;
    impl LocalScheduler<i32> for NullScheduler {
        fn schedule_once(&mut self, _agent: i32, _ordering: i64, _time: f64) {}
        fn schedule_repeating(&mut self, _step: i64, _ordering: i64, _time: f64, _interval: f64) {}
    }

    #[test]
    fn pre_schedule_runs_a_full_cycle_on_one_worker() {
        MockCluster::run(&[0], |rank, transport| {
            let tree = Rc::new(RefCell::new(QuadTree::<2>::new(world(100), 1).unwrap()));
            let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);
            let aoi = Aoi2::new([1, 1]);

            let field = Rc::new(RefCell::new(
                HaloField::<ObjectGrid<i32, 2>, 2>::new(0, rank, aoi, tree.clone(), transport.clone()).unwrap(),
            ));
            let transporter = Transporter::<i32, 2>::new(rank, &aoi, tree.clone(), transport.clone());

            let ctx = RuntimeContext::new(rank, 1);
            let mut loop_ = CoordinationLoop::new(ctx, tree, transport, transporter);
            loop_.register_field(field);

            let mut scheduler = NullScheduler;
            loop_.pre_schedule(&mut scheduler).unwrap();
            let shared_clock = loop_.revise_time(5.0).unwrap();
            assert_eq!(shared_clock, 5.0);
            // The timer's first `stop()` has nothing to measure yet (no
            // matching prior `start()`); a second tick produces a sample.
            loop_.pre_schedule(&mut scheduler).unwrap();
            assert!(loop_.context().average_tick_duration().is_some());
        });
    }

    #[test]
    fn delivered_agent_is_placed_into_its_field() {
        MockCluster::run(&[0], |rank, transport| {
            let tree = Rc::new(RefCell::new(QuadTree::<2>::new(world(100), 1).unwrap()));
            let transport: Rc<dyn CollectiveTransport> = Rc::new(transport);
            let aoi = Aoi2::new([0, 0]);

            let field = Rc::new(RefCell::new(
                HaloField::<ObjectGrid<i32, 2>, 2>::new(7, rank, aoi, tree.clone(), transport.clone()).unwrap(),
            ));
            let mut transporter = Transporter::<i32, 2>::new(rank, &aoi, tree.clone(), transport.clone());
            transporter.inbox.push(crate::transport::Transportee {
                destination_rank: rank,
                field_index: 7,
                location: Point2::new([3, 3]),
                payload: Payload::Object(55),
            });

            let ctx = RuntimeContext::new(rank, 1);
            let mut loop_ = CoordinationLoop::new(ctx, tree, transport, transporter);
            loop_.register_field(field.clone());

            let mut scheduler = NullScheduler;
            loop_.pre_schedule(&mut scheduler).unwrap();
            assert_eq!(field.borrow().get(&Point2::new([3, 3])).unwrap(), Some(55));
        });
    }
}
