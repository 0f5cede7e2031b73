//! Test-only harness: a channel-backed [`CollectiveTransport`] plus a
//! same-process, real-thread [`MockCluster`] that runs one OS thread per
//! worker, and fixture builders for the partition shapes the scenario tests
//! (§8) exercise.
//!
//! Each worker thread owns its partition manager, halo fields, etc. as an
//! independent `Rc<RefCell<_>>` graph -- nothing besides the
//! [`ChannelTransport`] handle itself crosses a thread boundary, matching
//! the single-threaded-per-worker execution model the rest of the crate is
//! built against (§5).

use crate::collectives::CollectiveTransport;
use crate::error::{CoreError, CoreResult};
use crate::geometry::{IntHyperRect, IntPoint};
use crate::quadtree::QuadTree;
use std::collections::HashMap;
use std::sync::mpsc;

/// A [`CollectiveTransport`] backed by a full mesh of MPSC channels, one
/// directed channel per ordered pair of ranks. Every method is implemented
/// as plain point-to-point sends/receives rather than a true barrier: since
/// every worker thread executes the same sequence of collectives in the
/// same order each tick, per-channel FIFO ordering is enough to keep calls
/// correctly paired without needing a shared rendezvous primitive.
pub struct ChannelTransport {
    rank: i64,
    senders: HashMap<i64, mpsc::Sender<Vec<u8>>>,
    receivers: HashMap<i64, mpsc::Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    fn send_to(&self, dest: i64, bytes: &[u8]) -> CoreResult<()> {
        self.senders
            .get(&dest)
            .ok_or_else(|| CoreError::Unroutable {
                destination: u32::try_from(dest).unwrap_or(u32::MAX),
            })?
            .send(bytes.to_vec())
            .map_err(|e| CoreError::TransportFault { detail: e.to_string() })
    }

    fn recv_from(&self, src: i64) -> CoreResult<Vec<u8>> {
        self.receivers
            .get(&src)
            .ok_or_else(|| CoreError::Unroutable {
                destination: u32::try_from(src).unwrap_or(u32::MAX),
            })?
            .recv()
            .map_err(|e| CoreError::TransportFault { detail: e.to_string() })
    }
}

impl CollectiveTransport for ChannelTransport {
    fn rank(&self) -> i64 {
        self.rank
    }

    fn neighbor_exchange(
        &self,
        sends: &std::collections::BTreeMap<i64, Vec<u8>>,
        recv_from: &[i64],
    ) -> CoreResult<std::collections::BTreeMap<i64, Vec<u8>>> {
        for (&dest, bytes) in sends {
            self.send_to(dest, bytes)?;
        }
        let mut out = std::collections::BTreeMap::new();
        for &src in recv_from {
            out.insert(src, self.recv_from(src)?);
        }
        Ok(out)
    }

    fn gather(&self, root: i64, members: &[i64], payload: Vec<u8>) -> CoreResult<Option<Vec<Vec<u8>>>> {
        if !members.contains(&self.rank) {
            return Ok(None);
        }
        if self.rank == root {
            let mut out = Vec::with_capacity(members.len());
            for &m in members {
                out.push(if m == self.rank {
                    payload.clone()
                } else {
                    self.recv_from(m)?
                });
            }
            Ok(Some(out))
        } else {
            self.send_to(root, &payload)?;
            Ok(None)
        }
    }

    fn scatter(&self, root: i64, members: &[i64], payloads: Option<Vec<Vec<u8>>>) -> CoreResult<Vec<u8>> {
        if self.rank == root {
            let payloads = payloads.ok_or_else(|| CoreError::TransportFault {
                detail: "root must supply payloads to scatter".into(),
            })?;
            let mut mine = Vec::new();
            for (&m, bytes) in members.iter().zip(payloads) {
                if m == self.rank {
                    mine = bytes;
                } else {
                    self.send_to(m, &bytes)?;
                }
            }
            Ok(mine)
        } else if members.contains(&self.rank) {
            self.recv_from(root)
        } else {
            Ok(Vec::new())
        }
    }

    fn all_reduce_min(&self, value: f64, members: &[i64]) -> CoreResult<f64> {
        let coordinator = *members.iter().min().ok_or_else(|| CoreError::TransportFault {
            detail: "all_reduce_min over an empty member set".into(),
        })?;
        if self.rank == coordinator {
            let mut min = value;
            for &m in members {
                if m != self.rank {
                    let bytes = self.recv_from(m)?;
                    min = min.min(decode_f64(&bytes)?);
                }
            }
            for &m in members {
                if m != self.rank {
                    self.send_to(m, &min.to_le_bytes())?;
                }
            }
            Ok(min)
        } else {
            self.send_to(coordinator, &value.to_le_bytes())?;
            decode_f64(&self.recv_from(coordinator)?)
        }
    }

    fn barrier(&self, members: &[i64]) -> CoreResult<()> {
        self.all_reduce_min(0.0, members).map(|_| ())
    }
}

fn decode_f64(bytes: &[u8]) -> CoreResult<f64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| CoreError::SerializationFailure {
        detail: "expected an 8-byte f64".into(),
    })?;
    Ok(f64::from_le_bytes(arr))
}

/// A same-process harness that runs one real OS thread per rank, wired
/// together by a full mesh of [`ChannelTransport`]s.
pub struct MockCluster;

impl MockCluster {
    fn build_transports(ranks: &[i64]) -> HashMap<i64, ChannelTransport> {
        let mut senders: HashMap<(i64, i64), mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut receivers: HashMap<(i64, i64), mpsc::Receiver<Vec<u8>>> = HashMap::new();
        for &a in ranks {
            for &b in ranks {
                if a == b {
                    continue;
                }
                let (tx, rx) = mpsc::channel();
                senders.insert((a, b), tx);
                receivers.insert((a, b), rx);
            }
        }
        let mut out = HashMap::new();
        for &r in ranks {
            let mut my_senders = HashMap::new();
            let mut my_receivers = HashMap::new();
            for &other in ranks {
                if other == r {
                    continue;
                }
                my_senders.insert(other, senders.remove(&(r, other)).expect("built above"));
                my_receivers.insert(other, receivers.remove(&(other, r)).expect("built above"));
            }
            out.insert(
                r,
                ChannelTransport {
                    rank: r,
                    senders: my_senders,
                    receivers: my_receivers,
                },
            );
        }
        out
    }

    /// Spawn one thread per rank in `ranks`, each calling `worker_fn(rank,
    /// transport)`; blocks until every thread returns. Panics inside a
    /// worker thread propagate and fail the calling test, same as any other
    /// `thread::scope` use.
    pub fn run<F>(ranks: &[i64], worker_fn: F)
    where
        F: Fn(i64, ChannelTransport) + Sync,
    {
        let mut transports = Self::build_transports(ranks);
        std::thread::scope(|scope| {
            for &r in ranks {
                let transport = transports.remove(&r).expect("transport built for every rank");
                let worker_fn = &worker_fn;
                scope.spawn(move || worker_fn(r, transport));
            }
        });
    }
}

/// Build a world rectangle `[0, size) x [0, size)` (id `-1`).
#[must_use]
pub fn square_world(size: i64) -> IntHyperRect<2> {
    IntHyperRect::new(-1, IntPoint::origin(), IntPoint::new([size, size]))
}

/// Build a uniform quadtree over a `size x size` world, split evenly
/// `depth` times (`4^depth` leaves), each split landing exactly at the
/// midpoint of the leaf it divides.
///
/// # Panics
///
/// Panics if the resulting leaf count does not fit the id pool invariant
/// (it always does for any `depth >= 0`, since `4^depth = 1 + 3 * ((4^depth
/// - 1) / 3)`).
#[must_use]
pub fn uniform_quadtree(size: i64, depth: u32) -> QuadTree<2> {
    let max_partitions = 4i64.saturating_pow(depth + 1);
    let mut tree = QuadTree::<2>::new(square_world(size), find_valid_pool(max_partitions))
        .expect("pool size chosen to satisfy the id-budget invariant");
    let mut frontier: Vec<i64> = tree.leaf_ids();
    for _ in 0..depth {
        let mut next = Vec::new();
        for leaf in frontier {
            let rect = *tree.node(leaf).expect("leaf id must exist").rect();
            let mid = IntPoint::new([
                (rect.ul.get(0) + rect.br.get(0)) / 2,
                (rect.ul.get(1) + rect.br.get(1)) / 2,
            ]);
            let before: std::collections::HashSet<i64> = tree.leaf_ids().into_iter().collect();
            tree.split(mid).expect("midpoint is always strictly interior for size > 1");
            let after = tree.leaf_ids();
            next.extend(after.into_iter().filter(|id| !before.contains(id)));
        }
        frontier = next;
    }
    tree
}

fn find_valid_pool(min: i64) -> i64 {
    // D=2 => children_per_split-1 = 3; smallest N >= min with N = 1 (mod 3).
    let mut n = min.max(1);
    while (n - 1) % 3 != 0 {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn uniform_quadtree_has_4_pow_depth_leaves() {
        let tree = uniform_quadtree(1000, 2);
        assert_eq!(tree.leaf_ids().len(), 16);
        let total_area: i64 = tree.leaf_rects().iter().map(IntHyperRect::area).sum();
        assert_eq!(total_area, 1000 * 1000);
    }

    #[test]
    fn neighbor_exchange_round_trips_across_threads() {
        MockCluster::run(&[0, 1, 2], |rank, transport| {
            let peer = (rank + 1) % 3;
            let mut sends = BTreeMap::new();
            sends.insert(peer, vec![rank as u8]);
            let recv_from = vec![(rank + 2) % 3];
            let received = transport.neighbor_exchange(&sends, &recv_from).unwrap();
            let expected_sender = (rank + 2) % 3;
            assert_eq!(received[&expected_sender], vec![expected_sender as u8]);
        });
    }

    #[test]
    fn all_reduce_min_agrees_across_threads() {
        MockCluster::run(&[0, 1, 2, 3], |rank, transport| {
            let members = vec![0, 1, 2, 3];
            let min = transport.all_reduce_min(10.0 - rank as f64, &members).unwrap();
            assert_eq!(min, 7.0);
        });
    }

    #[test]
    fn gather_collects_every_member_at_root() {
        MockCluster::run(&[0, 1, 2], |rank, transport| {
            let members = vec![0, 1, 2];
            let gathered = transport.gather(0, &members, vec![rank as u8]).unwrap();
            if rank == 0 {
                assert_eq!(gathered, Some(vec![vec![0u8], vec![1u8], vec![2u8]]));
            } else {
                assert!(gathered.is_none());
            }
        });
    }
}
