//! The collective-operations contract the coordination loop, halo sync, and
//! transporter are built against (§6, "To the transport layer").
//!
//! This crate never binds to a concrete MPI library -- none of the crates in
//! the surrounding ecosystem do either, and a system MPI dependency would be
//! an odd fit for a Rust library. Instead every collective the core needs is
//! expressed as a trait, [`CollectiveTransport`], so a production deployment
//! can back it with an MPI binding, a gRPC mesh, or anything else, while the
//! crate ships one concrete, dependency-free implementation
//! ([`crate::testing::ChannelTransport`]) good enough to run every property
//! and scenario test end to end.
//!
//! A real MPI binding would implement a single [`CollectiveTransport::neighbor_exchange`]
//! call as the two-step `MPI_Neighbor_alltoall` (exchange byte counts) then
//! `MPI_Neighbor_alltoallv` (exchange the bytes) described in §4.5.1; a
//! message-oriented transport (channels, a socket mesh) can fuse both steps
//! since the message framing already carries its own length.

use crate::error::CoreResult;
use std::collections::BTreeMap;

/// MPI-like collectives the core substrate is built against.
///
/// Every method is a synchronization barrier across the participating
/// workers (§5): the caller suspends until its counterpart(s) have made the
/// matching call.
pub trait CollectiveTransport: Send {
    /// This worker's rank.
    fn rank(&self) -> i64;

    /// Exchange variable-length byte payloads with a set of peers in one
    /// round: `sends` maps peer rank -> payload to send that peer;
    /// `recv_from` lists the peers this call must receive exactly one
    /// payload from. Returns the received payloads keyed by sender rank.
    ///
    /// Used for both the halo sync neighbor exchange (§4.4.1) and the
    /// transporter's neighbor exchange (§4.5); the neighbor relation is
    /// symmetric in both cases so `recv_from` is typically the same set of
    /// ranks as `sends.keys()`.
    fn neighbor_exchange(
        &self,
        sends: &BTreeMap<i64, Vec<u8>>,
        recv_from: &[i64],
    ) -> CoreResult<BTreeMap<i64, Vec<u8>>>;

    /// Gather one payload per member of `members` to `root`. Non-root
    /// callers return `Ok(None)` after their payload has been delivered;
    /// `root` returns `Ok(Some(payloads))` ordered to match `members`.
    fn gather(
        &self,
        root: i64,
        members: &[i64],
        payload: Vec<u8>,
    ) -> CoreResult<Option<Vec<Vec<u8>>>>;

    /// Scatter one payload per member of `members` from `root`. `root` must
    /// pass `Some(payloads)` ordered to match `members` (including its own
    /// entry); every other caller passes `None`. Every member, including
    /// `root`, returns its own payload.
    fn scatter(
        &self,
        root: i64,
        members: &[i64],
        payloads: Option<Vec<Vec<u8>>>,
    ) -> CoreResult<Vec<u8>>;

    /// All-reduce the minimum of `value` across `members`. Used once per
    /// tick to advance the shared clock (§4.7 step 7).
    fn all_reduce_min(&self, value: f64, members: &[i64]) -> CoreResult<f64>;

    /// A plain synchronization barrier across `members`, with no payload.
    fn barrier(&self, members: &[i64]) -> CoreResult<()>;
}
