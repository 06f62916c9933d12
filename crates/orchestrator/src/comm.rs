//! Rank-to-rank message passing for the worker cluster.
//!
//! One worker thread per rank stands in for one process per accelerator;
//! the `Comm` surface is rank/size plus blocking collectives, so a network
//! transport can drop in later without touching protocol code. Each ordered
//! pair of ranks owns a dedicated channel, and every rank executes the same
//! global sequence of collectives, so messages on a channel can never
//! interleave across operations.
//!
//! A message-type mismatch on receive is a protocol bug, not a runtime
//! condition, and panics.

use std::sync::mpsc::{channel, Receiver, Sender};

use kernel::Vec4;

use crate::exchange::ParticlePayload;

/// Everything that travels between ranks.
#[derive(Debug)]
pub enum Wire {
    /// Scalar reduction operand / result.
    U64(u64),
    /// Scalar reduction operand / result.
    F64(f64),
    /// Scalar reduction operand / result.
    F32(f32),
    /// Collective agreement flag.
    Bool(bool),
    /// Per-rank counts (all-to-all count exchange, scatter sizing).
    Counts(Vec<u64>),
    /// Packed point masses (aggregate export, bounds exchange).
    Bodies(Vec<Vec4>),
    /// Migrating particles.
    Payload(ParticlePayload),
}

/// Per-rank communicator handle. Moved into the rank's worker thread.
pub struct Comm {
    rank: usize,
    size: usize,
    /// `tx[j]` sends to rank j; the self slot is unused.
    tx: Vec<Option<Sender<Wire>>>,
    /// `rx[j]` receives from rank j; the self slot is unused.
    rx: Vec<Option<Receiver<Wire>>>,
}

impl Comm {
    /// This rank's index.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the cluster.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Send a message to rank `to`. Panics if the peer has gone away, which
    /// only happens when a worker thread panicked.
    pub fn send(&self, to: usize, msg: Wire) {
        self.tx[to]
            .as_ref()
            .expect("no channel to self")
            .send(msg)
            .expect("peer rank disconnected");
    }

    /// Block until a message from rank `from` arrives.
    pub fn recv(&self, from: usize) -> Wire {
        self.rx[from]
            .as_ref()
            .expect("no channel to self")
            .recv()
            .expect("peer rank disconnected")
    }

    /// Block until every rank has entered the barrier.
    pub fn barrier(&self) {
        self.allreduce_sum_u64(0);
    }

    /// Global sum of a u64, returned on every rank.
    pub fn allreduce_sum_u64(&self, value: u64) -> u64 {
        self.reduce_broadcast(Wire::U64(value), |acc, msg| match msg {
            Wire::U64(v) => Wire::U64(unwrap_u64(acc) + v),
            other => wire_mismatch("U64", &other),
        })
        .into_u64()
    }

    /// Global sum of an f64, returned on every rank.
    pub fn allreduce_sum_f64(&self, value: f64) -> f64 {
        self.reduce_broadcast(Wire::F64(value), |acc, msg| match msg {
            Wire::F64(v) => Wire::F64(unwrap_f64(acc) + v),
            other => wire_mismatch("F64", &other),
        })
        .into_f64()
    }

    /// Global minimum of an f32, returned on every rank.
    pub fn allreduce_min_f32(&self, value: f32) -> f32 {
        self.reduce_broadcast(Wire::F32(value), |acc, msg| match msg {
            Wire::F32(v) => Wire::F32(unwrap_f32(acc).min(v)),
            other => wire_mismatch("F32", &other),
        })
        .into_f32()
    }

    /// Global maximum of an f32, returned on every rank.
    pub fn allreduce_max_f32(&self, value: f32) -> f32 {
        self.reduce_broadcast(Wire::F32(value), |acc, msg| match msg {
            Wire::F32(v) => Wire::F32(unwrap_f32(acc).max(v)),
            other => wire_mismatch("F32", &other),
        })
        .into_f32()
    }

    /// Global OR of a flag, returned on every rank. The backbone of
    /// collective agreement on overflow and fatal conditions.
    pub fn allreduce_or(&self, value: bool) -> bool {
        self.reduce_broadcast(Wire::Bool(value), |acc, msg| match msg {
            Wire::Bool(v) => Wire::Bool(unwrap_bool(acc) | v),
            other => wire_mismatch("Bool", &other),
        })
        .into_bool()
    }

    /// Exchange one count per destination; returns one count per source.
    /// `counts[self]` passes through untouched.
    pub fn all_to_all_counts(&self, counts: &[u64]) -> Vec<u64> {
        assert_eq!(counts.len(), self.size, "one count per destination rank");
        for j in 0..self.size {
            if j != self.rank {
                self.send(j, Wire::U64(counts[j]));
            }
        }
        let mut incoming = vec![0u64; self.size];
        incoming[self.rank] = counts[self.rank];
        for j in 0..self.size {
            if j != self.rank {
                incoming[j] = match self.recv(j) {
                    Wire::U64(v) => v,
                    other => wire_mismatch("U64", &other),
                };
            }
        }
        incoming
    }

    /// Exchange one payload per destination; returns one payload per source.
    /// The self slot passes through untouched.
    pub fn all_to_all_payloads(&self, mut outgoing: Vec<ParticlePayload>) -> Vec<ParticlePayload> {
        assert_eq!(outgoing.len(), self.size, "one payload per destination rank");
        let own = std::mem::take(&mut outgoing[self.rank]);
        for (j, payload) in outgoing.into_iter().enumerate() {
            if j != self.rank {
                self.send(j, Wire::Payload(payload));
            }
        }
        let mut incoming: Vec<ParticlePayload> =
            (0..self.size).map(|_| ParticlePayload::new()).collect();
        incoming[self.rank] = own;
        for (j, slot) in incoming.iter_mut().enumerate() {
            if j != self.rank {
                *slot = match self.recv(j) {
                    Wire::Payload(p) => p,
                    other => wire_mismatch("Payload", &other),
                };
            }
        }
        incoming
    }

    /// Gather payloads on rank 0, in rank order. Non-root ranks get `None`.
    pub fn gather_payloads_to_root(&self, payload: ParticlePayload) -> Option<Vec<ParticlePayload>> {
        if self.rank == 0 {
            let mut all: Vec<ParticlePayload> = Vec::with_capacity(self.size);
            all.push(payload);
            for j in 1..self.size {
                match self.recv(j) {
                    Wire::Payload(p) => all.push(p),
                    other => wire_mismatch("Payload", &other),
                }
            }
            Some(all)
        } else {
            self.send(0, Wire::Payload(payload));
            None
        }
    }

    /// Every rank contributes a body list and receives all of them, indexed
    /// by source rank.
    pub fn allgather_bodies(&self, bodies: Vec<Vec4>) -> Vec<Vec<Vec4>> {
        if self.rank == 0 {
            let mut all: Vec<Vec<Vec4>> = Vec::with_capacity(self.size);
            all.push(bodies);
            for j in 1..self.size {
                match self.recv(j) {
                    Wire::Bodies(b) => all.push(b),
                    other => wire_mismatch("Bodies", &other),
                }
            }
            for j in 1..self.size {
                for list in &all {
                    self.send(j, Wire::Bodies(list.clone()));
                }
            }
            all
        } else {
            self.send(0, Wire::Bodies(bodies));
            (0..self.size)
                .map(|_| match self.recv(0) {
                    Wire::Bodies(b) => b,
                    other => wire_mismatch("Bodies", &other),
                })
                .collect()
        }
    }

    /// Reduce at root, then broadcast the result to every rank.
    fn reduce_broadcast<F>(&self, local: Wire, combine: F) -> Wire
    where
        F: Fn(Wire, Wire) -> Wire,
    {
        if self.rank == 0 {
            let mut acc = local;
            for j in 1..self.size {
                acc = combine(acc, self.recv(j));
            }
            for j in 1..self.size {
                self.send(j, acc.shallow_clone());
            }
            acc
        } else {
            self.send(0, local);
            self.recv(0)
        }
    }
}

impl Wire {
    fn shallow_clone(&self) -> Wire {
        match self {
            Wire::U64(v) => Wire::U64(*v),
            Wire::F64(v) => Wire::F64(*v),
            Wire::F32(v) => Wire::F32(*v),
            Wire::Bool(v) => Wire::Bool(*v),
            other => panic!("only scalar wire messages are broadcast: {other:?}"),
        }
    }

    fn into_u64(self) -> u64 {
        match self {
            Wire::U64(v) => v,
            other => wire_mismatch("U64", &other),
        }
    }

    fn into_f64(self) -> f64 {
        match self {
            Wire::F64(v) => v,
            other => wire_mismatch("F64", &other),
        }
    }

    fn into_f32(self) -> f32 {
        match self {
            Wire::F32(v) => v,
            other => wire_mismatch("F32", &other),
        }
    }

    fn into_bool(self) -> bool {
        match self {
            Wire::Bool(v) => v,
            other => wire_mismatch("Bool", &other),
        }
    }
}

fn unwrap_u64(w: Wire) -> u64 {
    w.into_u64()
}

fn unwrap_f64(w: Wire) -> f64 {
    w.into_f64()
}

fn unwrap_f32(w: Wire) -> f32 {
    w.into_f32()
}

fn unwrap_bool(w: Wire) -> bool {
    w.into_bool()
}

fn wire_mismatch(expected: &str, got: &Wire) -> ! {
    panic!("wire protocol mismatch: expected {expected}, got {got:?}")
}

/// Builder for a fully connected in-process cluster.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` communicator handles with a dedicated channel for each
    /// ordered rank pair.
    pub fn connect(size: usize) -> Vec<Comm> {
        assert!(size >= 1, "cluster needs at least one rank");
        // senders[i][j] sends i -> j; receivers[j][i] receives i -> j.
        let mut senders: Vec<Vec<Option<Sender<Wire>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Wire>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        for i in 0..size {
            for j in 0..size {
                if i == j {
                    continue;
                }
                let (tx, rx) = channel();
                senders[i][j] = Some(tx);
                receivers[j][i] = Some(rx);
            }
        }

        let mut comms = Vec::with_capacity(size);
        for (rank, (tx, rx)) in senders.into_iter().zip(receivers).enumerate() {
            comms.push(Comm {
                rank,
                size,
                tx,
                rx,
            });
        }
        comms
    }
}

/// Run `f` once per rank on its own thread and collect the results in rank
/// order. Panics in any worker propagate.
pub fn run_cluster<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Comm) -> R + Send + Sync,
{
    let comms = LocalCluster::connect(size);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for comm in comms {
            let f = &f;
            handles.push(scope.spawn(move || f(comm)));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("worker rank panicked"))
            .collect()
    })
}
