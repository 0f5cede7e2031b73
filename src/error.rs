//! Error kinds for the partitioning/halo/transport substrate.
//!
//! Most of this crate returns `anyhow::Result` at the API boundary, matching
//! the rest of the codebase, but a handful of operations need callers to
//! distinguish a *recoverable* outcome from a *fatal* one: a halo read that
//! misses the local region falls back to the remote proxy, while a write
//! outside the owned partition of a numeric grid is a programming error.
//! [`CoreError`] carries that distinction explicitly so call sites can match
//! on it instead of string-sniffing an `anyhow::Error`.
//!
//! Only [`CoreError::OutOfLocal`] is recovered in-band (by issuing a remote
//! read through the proxy). Every other variant is fatal: the propagation
//! policy is to abort the worker with a diagnostic naming the rank, the
//! partition, and the offending coordinate.

use std::fmt;

/// The set of error conditions the core substrate can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Attempted to split a leaf when the id pool is exhausted, or split at a
    /// point that is not strictly interior to the target leaf.
    TopologyError {
        /// Human-readable description of what went wrong.
        detail: String,
    },
    /// A read fell outside the requesting worker's `haloPart`. Recoverable:
    /// the caller is expected to fall back to [`crate::proxy`].
    OutOfLocal {
        /// Index of the field the read targeted.
        field_index: i64,
        /// World coordinate that was requested, formatted for diagnostics.
        point: String,
        /// Rank that owns the coordinate, if known.
        owner_rank: Option<u32>,
    },
    /// A write fell outside `origPart`. For object grids this is recovered by
    /// auto-migrating the write through the transporter; for numeric grids
    /// (which cannot be migrated as entities) this is fatal.
    OutOfLocalWrite {
        /// World coordinate that was written.
        point: String,
        /// Rank that attempted the write.
        rank: u32,
    },
    /// The transporter was asked to deliver to a worker with no reachable
    /// route through the neighbor graph.
    Unroutable {
        /// Destination rank that could not be reached.
        destination: u32,
    },
    /// A collective operation (all-to-all, gather/scatter, all-reduce,
    /// barrier) failed. The neighbor topology is static between rebalance
    /// commits, so this indicates a lost worker -- outside this crate's
    /// failure model.
    TransportFault {
        /// Description of the failed collective.
        detail: String,
    },
    /// Encoding or decoding a wire-format record failed.
    SerializationFailure {
        /// Description of the failure, typically from the underlying codec.
        detail: String,
    },
}

impl CoreError {
    /// True for the one variant the core recovers in-band.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::OutOfLocal { .. })
    }

    /// Format the fatal diagnostic required by the propagation policy: the
    /// worker rank, the partition, and the offending coordinate, where
    /// applicable to the variant.
    #[must_use]
    pub fn diagnostic(&self, rank: u32, partition_id: i64) -> String {
        format!("worker {rank} (partition {partition_id}): {self}")
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::TopologyError { detail } => write!(f, "topology error: {detail}"),
            CoreError::OutOfLocal {
                field_index,
                point,
                owner_rank,
            } => write!(
                f,
                "out-of-local read of field {field_index} at {point} (owner: {owner_rank:?})"
            ),
            CoreError::OutOfLocalWrite { point, rank } => {
                write!(f, "out-of-local write at {point} attempted by rank {rank}")
            }
            CoreError::Unroutable { destination } => {
                write!(f, "no route to destination rank {destination}")
            }
            CoreError::TransportFault { detail } => write!(f, "transport fault: {detail}"),
            CoreError::SerializationFailure { detail } => {
                write!(f, "serialization failure: {detail}")
            }
        }
    }
}

impl std::error::Error for CoreError {}

/// Convenience alias used throughout the core modules.
pub type CoreResult<T> = Result<T, CoreError>;
