//! Interface to the host message-passing runtime.
//!
//! The library never talks to MPI directly; every collective and
//! point-to-point operation goes through the [`Communicator`] trait. The
//! default methods build the collectives (barrier, broadcast, gather,
//! all-reduce) from the point-to-point primitives, so a backend only has to
//! provide ordered, buffered send/recv, communicator split and rank
//! translation.
//!
//! [`LocalComm`] is an in-process implementation over crossbeam channels.
//! The test suite uses it to run real N-rank collectives on threads, one
//! "process" per thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Reduction operator for integer all-reduce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    /// Logical AND of nonzero-ness.
    And,
}

impl ReduceOp {
    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::And => ((a != 0) && (b != 0)) as i64,
        }
    }
}

pub trait Communicator: Send + Sync {
    /// My rank within this communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in this communicator.
    fn size(&self) -> usize;

    /// Translate a rank of this communicator to its rank in the world
    /// communicator this one descends from (identity for the world).
    fn global_rank(&self, rank: usize) -> usize;

    /// Buffered send; must not block waiting for the receiver.
    fn send(&self, dest: usize, data: &[u8]) -> Result<(), Error>;

    /// Blocking receive of the next message from `src`.
    fn recv(&self, src: usize) -> Result<Vec<u8>, Error>;

    /// Non-blocking receive probe from `src`.
    fn try_recv(&self, src: usize) -> Result<Option<Vec<u8>>, Error>;

    /// Split into disjoint sub-communicators by `color`, ordered by `key`.
    fn split(&self, color: u64, key: u64) -> Result<Arc<dyn Communicator>, Error>;

    /// Tear down the whole run; only reached through fatal errors.
    fn abort(&self, msg: &str) -> !;

    /// Pairwise exchange where either side may be absent.
    fn sendrecv(
        &self,
        send: Option<(usize, &[u8])>,
        recv_from: Option<usize>,
    ) -> Result<Option<Vec<u8>>, Error> {
        if let Some((dest, data)) = send {
            self.send(dest, data)?;
        }
        match recv_from {
            Some(src) => Ok(Some(self.recv(src)?)),
            None => Ok(None),
        }
    }

    /// Blocking receive from whichever of `sources` delivers first.
    fn recv_any(&self, sources: &[usize]) -> Result<(usize, Vec<u8>), Error> {
        if sources.is_empty() {
            bail!("recv_any called with no sources");
        }
        loop {
            for &src in sources {
                if let Some(data) = self.try_recv(src)? {
                    return Ok((src, data));
                }
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// Gather byte blobs to `root`; returns the per-rank list at the root.
    fn gather(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>, Error> {
        if self.rank() == root {
            let mut out = vec![Vec::new(); self.size()];
            out[root] = data.to_vec();
            for src in 0..self.size() {
                if src != root {
                    out[src] = self.recv(src)?;
                }
            }
            Ok(Some(out))
        } else {
            self.send(root, data)?;
            Ok(None)
        }
    }

    /// Broadcast from `root`; non-roots pass anything and get the root's
    /// payload back.
    fn bcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        if self.rank() == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(dest, &data)?;
                }
            }
            Ok(data)
        } else {
            self.recv(root)
        }
    }

    fn barrier(&self) -> Result<(), Error> {
        self.gather(0, &[])?;
        self.bcast(0, Vec::new())?;
        Ok(())
    }

    fn allreduce_i64(&self, value: i64, op: ReduceOp) -> Result<i64, Error> {
        let gathered = self.gather(0, &value.to_le_bytes())?;
        let result = match gathered {
            Some(parts) => {
                let mut acc = None;
                for part in parts {
                    let v = i64::from_le_bytes(
                        part.as_slice()
                            .try_into()
                            .map_err(|_| format_err!("short allreduce payload"))?,
                    );
                    acc = Some(match acc {
                        None => v,
                        Some(a) => op.apply(a, v),
                    });
                }
                acc.unwrap_or(0).to_le_bytes().to_vec()
            }
            None => Vec::new(),
        };
        let result = self.bcast(0, result)?;
        Ok(i64::from_le_bytes(
            result
                .as_slice()
                .try_into()
                .map_err(|_| format_err!("short allreduce payload"))?,
        ))
    }

    fn allreduce_f64_sum(&self, value: f64) -> Result<f64, Error> {
        let gathered = self.gather(0, &value.to_le_bytes())?;
        let result = match gathered {
            Some(parts) => {
                let mut acc = 0.0;
                for part in parts {
                    acc += f64::from_le_bytes(
                        part.as_slice()
                            .try_into()
                            .map_err(|_| format_err!("short allreduce payload"))?,
                    );
                }
                acc.to_le_bytes().to_vec()
            }
            None => Vec::new(),
        };
        let result = self.bcast(0, result)?;
        Ok(f64::from_le_bytes(
            result
                .as_slice()
                .try_into()
                .map_err(|_| format_err!("short allreduce payload"))?,
        ))
    }
}

/// Every participant reports a local OK flag; only the AND across the
/// communicator commits an operation.
pub fn alltrue(comm: &dyn Communicator, flag: bool) -> Result<bool, Error> {
    Ok(comm.allreduce_i64(flag as i64, ReduceOp::And)? != 0)
}

struct Message {
    comm_id: u64,
    data: Vec<u8>,
}

struct Endpoint {
    rx: Receiver<Message>,
    pending: VecDeque<Message>,
}

impl Endpoint {
    fn take_pending(&mut self, comm_id: u64) -> Option<Vec<u8>> {
        if let Some(pos) = self.pending.iter().position(|m| m.comm_id == comm_id) {
            return Some(self.pending.remove(pos).unwrap().data);
        }
        None
    }

    fn recv(&mut self, comm_id: u64) -> Result<Vec<u8>, Error> {
        if let Some(data) = self.take_pending(comm_id) {
            return Ok(data);
        }
        loop {
            let msg = self
                .rx
                .recv()
                .map_err(|_| format_err!("peer hung up during recv"))?;
            if msg.comm_id == comm_id {
                return Ok(msg.data);
            }
            self.pending.push_back(msg);
        }
    }

    fn try_recv(&mut self, comm_id: u64) -> Result<Option<Vec<u8>>, Error> {
        if let Some(data) = self.take_pending(comm_id) {
            return Ok(Some(data));
        }
        loop {
            match self.rx.try_recv() {
                Ok(msg) if msg.comm_id == comm_id => return Ok(Some(msg.data)),
                Ok(msg) => self.pending.push_back(msg),
                Err(crossbeam_channel::TryRecvError::Empty) => return Ok(None),
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    bail!("peer hung up during try_recv")
                }
            }
        }
    }
}

/// Fully connected channel mesh shared by all communicators of one
/// in-process world.
struct Mesh {
    senders: Vec<Vec<Sender<Message>>>,
    endpoints: Vec<Vec<Mutex<Endpoint>>>,
    next_comm_id: AtomicU64,
}

impl Mesh {
    fn new(n: usize) -> Self {
        let mut senders = vec![Vec::with_capacity(n); n];
        let mut endpoints: Vec<Vec<Mutex<Endpoint>>> = (0..n).map(|_| Vec::new()).collect();
        for dst in 0..n {
            for src in 0..n {
                let (tx, rx) = unbounded();
                senders[src].push(tx);
                endpoints[dst].push(Mutex::new(Endpoint {
                    rx,
                    pending: VecDeque::new(),
                }));
            }
        }
        Self {
            senders,
            endpoints,
            next_comm_id: AtomicU64::new(1),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SplitAssignment {
    comm_id: u64,
    members: Vec<usize>,
    my_rank: usize,
}

/// In-process communicator: one world per [`LocalComm::world`] call, one
/// handle per simulated process.
pub struct LocalComm {
    mesh: Arc<Mesh>,
    comm_id: u64,
    /// group rank -> world rank
    members: Vec<usize>,
    my_rank: usize,
}

impl LocalComm {
    /// Create an `n`-rank world and hand out one communicator per rank.
    pub fn world(n: usize) -> Vec<Arc<dyn Communicator>> {
        let mesh = Arc::new(Mesh::new(n));
        (0..n)
            .map(|rank| {
                Arc::new(LocalComm {
                    mesh: Arc::clone(&mesh),
                    comm_id: 0,
                    members: (0..n).collect(),
                    my_rank: rank,
                }) as Arc<dyn Communicator>
            })
            .collect()
    }

    fn world_rank(&self) -> usize {
        self.members[self.my_rank]
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.my_rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn global_rank(&self, rank: usize) -> usize {
        self.members[rank]
    }

    fn send(&self, dest: usize, data: &[u8]) -> Result<(), Error> {
        let dst = *self
            .members
            .get(dest)
            .ok_or_else(|| format_err!("send to invalid rank {}", dest))?;
        self.mesh.senders[self.world_rank()][dst]
            .send(Message {
                comm_id: self.comm_id,
                data: data.to_vec(),
            })
            .map_err(|_| format_err!("peer {} hung up during send", dest))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>, Error> {
        let src_world = *self
            .members
            .get(src)
            .ok_or_else(|| format_err!("recv from invalid rank {}", src))?;
        let mut endpoint = self.mesh.endpoints[self.world_rank()][src_world]
            .lock()
            .unwrap();
        endpoint.recv(self.comm_id)
    }

    fn try_recv(&self, src: usize) -> Result<Option<Vec<u8>>, Error> {
        let src_world = *self
            .members
            .get(src)
            .ok_or_else(|| format_err!("recv from invalid rank {}", src))?;
        let mut endpoint = self.mesh.endpoints[self.world_rank()][src_world]
            .lock()
            .unwrap();
        endpoint.try_recv(self.comm_id)
    }

    fn split(&self, color: u64, key: u64) -> Result<Arc<dyn Communicator>, Error> {
        // root collects (color, key, world_rank) from everyone, forms the
        // groups, reserves fresh comm ids and scatters the assignments
        let mine = (color, key, self.world_rank());
        let gathered = self.gather(0, &serde_json::to_vec(&mine)?)?;

        if let Some(parts) = gathered {
            let mut entries: Vec<(u64, u64, usize, usize)> = Vec::with_capacity(parts.len());
            for (rank, part) in parts.iter().enumerate() {
                let (color, key, world): (u64, u64, usize) = serde_json::from_slice(part)?;
                entries.push((color, key, world, rank));
            }

            let mut colors: Vec<u64> = entries.iter().map(|e| e.0).collect();
            colors.sort_unstable();
            colors.dedup();

            for color in colors {
                let mut group: Vec<(u64, u64, usize, usize)> = entries
                    .iter()
                    .filter(|e| e.0 == color)
                    .cloned()
                    .collect();
                group.sort_by_key(|e| (e.1, e.2));

                let comm_id = self.mesh.next_comm_id.fetch_add(1, Ordering::SeqCst);
                let members: Vec<usize> = group.iter().map(|e| e.2).collect();

                for (new_rank, entry) in group.iter().enumerate() {
                    let assignment = SplitAssignment {
                        comm_id,
                        members: members.clone(),
                        my_rank: new_rank,
                    };
                    self.send(entry.3, &serde_json::to_vec(&assignment)?)?;
                }
            }
        }

        let assignment: SplitAssignment = serde_json::from_slice(&self.recv(0)?)?;
        Ok(Arc::new(LocalComm {
            mesh: Arc::clone(&self.mesh),
            comm_id: assignment.comm_id,
            members: assignment.members,
            my_rank: assignment.my_rank,
        }))
    }

    fn abort(&self, msg: &str) -> ! {
        log::error!("aborting run: {}", msg);
        panic!("communicator abort: {}", msg);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_world<F>(n: usize, f: F)
    where
        F: Fn(Arc<dyn Communicator>) + Send + Sync + Clone + 'static,
    {
        let comms = LocalComm::world(n);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(comm))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn point_to_point_and_collectives() {
        run_world(4, |comm| {
            let rank = comm.rank();

            // ring shift
            let right = (rank + 1) % comm.size();
            let left = (rank + comm.size() - 1) % comm.size();
            let got = comm
                .sendrecv(Some((right, &[rank as u8])), Some(left))
                .unwrap()
                .unwrap();
            assert_eq!(got, vec![left as u8]);

            assert_eq!(comm.allreduce_i64(rank as i64, ReduceOp::Sum).unwrap(), 6);
            assert_eq!(comm.allreduce_i64(rank as i64, ReduceOp::Max).unwrap(), 3);
            assert!(alltrue(comm.as_ref(), true).unwrap());
            assert!(!alltrue(comm.as_ref(), rank != 2).unwrap());

            let data = comm.bcast(1, if rank == 1 { b"hello".to_vec() } else { Vec::new() }).unwrap();
            assert_eq!(data, b"hello");

            comm.barrier().unwrap();
        });
    }

    #[test]
    fn split_by_color() {
        run_world(6, |comm| {
            let rank = comm.rank();
            let color = (rank % 2) as u64;
            let sub = comm.split(color, rank as u64).unwrap();
            assert_eq!(sub.size(), 3);
            assert_eq!(sub.global_rank(sub.rank()), rank);

            // even ranks 0,2,4 -> sub ranks 0,1,2; odd likewise
            assert_eq!(sub.rank(), rank / 2);

            let sum = sub.allreduce_i64(rank as i64, ReduceOp::Sum).unwrap();
            assert_eq!(sum, if color == 0 { 6 } else { 9 });

            // messages on the subcommunicator do not cross into the parent
            comm.barrier().unwrap();
        });
    }

    #[test]
    fn recv_any_drains_workers() {
        run_world(4, |comm| {
            if comm.rank() == 0 {
                let mut seen = vec![false; 4];
                let sources = [1, 2, 3];
                for _ in 0..3 {
                    let (src, data) = comm.recv_any(&sources).unwrap();
                    assert_eq!(data, vec![src as u8]);
                    seen[src] = true;
                }
                assert!(seen[1] && seen[2] && seen[3]);
            } else {
                comm.send(0, &[comm.rank() as u8]).unwrap();
            }
        });
    }
}
