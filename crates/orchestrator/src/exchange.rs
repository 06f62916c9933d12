//! Particle migration between ranks.
//!
//! Two flavors: the one-time initial scatter from root (chunked so no single
//! message exceeds `max_transfer` particles), and the steady-state ownership
//! exchange run every step. The steady-state exchange works in rounds: a
//! round either commits fully or commits nothing, so a retry after receive
//! overflow replays from an unchanged state.

use kernel::{ClassRanges, ParticleClass, ParticleSet, Vec4};

use crate::comm::{Comm, Wire};
use crate::engine::EngineError;
use crate::orb::DomainBox;

/// Rounds before a non-converging exchange becomes fatal.
pub const MAX_ROUNDS: u32 = 16;

/// Input population as flat arrays, produced by out-of-scope readers.
/// Positions carry mass in `w`; velocities carry softening in `w`.
#[derive(Debug, Clone, Default)]
pub struct InitialConditions {
    /// Positions, mass in `w`.
    pub pos: Vec<Vec4>,
    /// Velocities, softening in `w`.
    pub vel: Vec<Vec4>,
    /// Globally unique ids.
    pub ids: Vec<u32>,
}

/// Population totals per particle class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassCounts {
    /// Disk stars.
    pub disk: usize,
    /// Bulge stars.
    pub bulge: usize,
    /// Dark-matter halo particles.
    pub dark_matter: usize,
    /// Dust tracers.
    pub dust: usize,
}

impl ClassCounts {
    /// Combined population.
    pub fn total(&self) -> usize {
        self.disk + self.bulge + self.dark_matter + self.dust
    }
}

impl InitialConditions {
    /// Number of particles, after checking the arrays agree.
    pub fn len(&self) -> usize {
        assert_eq!(self.pos.len(), self.vel.len(), "pos/vel length mismatch");
        assert_eq!(self.pos.len(), self.ids.len(), "pos/ids length mismatch");
        self.pos.len()
    }

    /// True when no particles are present.
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    /// Tally the population by class, using the configured id thresholds.
    pub fn class_counts(&self, ranges: &ClassRanges) -> ClassCounts {
        let mut counts = ClassCounts::default();
        for &id in &self.ids {
            match ranges.classify(id) {
                ParticleClass::Disk => counts.disk += 1,
                ParticleClass::Bulge => counts.bulge += 1,
                ParticleClass::DarkMatter => counts.dark_matter += 1,
                ParticleClass::Dust => counts.dust += 1,
            }
        }
        counts
    }

    /// Append a secondary population onto this one. Dust arrives as its own
    /// set and is merged into the primary arrays before the scatter; on the
    /// device side the mirrored-buffer append plays the same role.
    pub fn merge(&mut self, mut secondary: InitialConditions) {
        self.pos.append(&mut secondary.pos);
        self.vel.append(&mut secondary.vel);
        self.ids.append(&mut secondary.ids);
    }
}

/// Migrating particles: authoritative state plus accumulated integration
/// state. Predicted mirrors are regenerated on the receiving side.
#[derive(Debug, Clone, Default)]
pub struct ParticlePayload {
    /// Positions, mass in `w`.
    pub pos: Vec<Vec4>,
    /// Velocities, softening in `w`.
    pub vel: Vec<Vec4>,
    /// Previous-step accelerations.
    pub acc0: Vec<Vec4>,
    /// Per-particle `[t_last, dt]`.
    pub time: Vec<[f32; 2]>,
    /// Particle ids.
    pub ids: Vec<u32>,
}

impl ParticlePayload {
    /// An empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of particles carried.
    pub fn len(&self) -> usize {
        self.pos.len()
    }

    /// True when nothing is carried.
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    /// Copy particle `i` of `set` into this payload.
    pub fn push_from(&mut self, set: &ParticleSet, i: usize) {
        self.pos.push(set.pos[i]);
        self.vel.push(set.vel[i]);
        self.acc0.push(set.acc0[i]);
        self.time.push(set.time[i]);
        self.ids.push(set.ids[i]);
    }

    /// Capture the entire local set, e.g. for a snapshot gather.
    pub fn from_set(set: &ParticleSet) -> Self {
        Self {
            pos: set.pos.clone(),
            vel: set.vel.clone(),
            acc0: set.acc0.clone(),
            time: set.time.clone(),
            ids: set.ids.clone(),
        }
    }

    /// Append every carried particle to `set`, seeding predicted mirrors
    /// from the authoritative state.
    pub fn append_to(&self, set: &mut ParticleSet) {
        for i in 0..self.len() {
            set.push_migrant(self.pos[i], self.vel[i], self.acc0[i], self.time[i], self.ids[i]);
        }
    }
}

/// Mutable protocol state that persists across exchanges. Receive capacity
/// only ever grows.
#[derive(Debug, Clone)]
pub struct ExchangeState {
    /// Most particles this rank will accept in one round.
    pub recv_capacity: usize,
}

impl ExchangeState {
    /// Start with the configured initial capacity.
    pub fn new(initial_recv_capacity: usize) -> Self {
        assert!(initial_recv_capacity >= 1);
        Self {
            recv_capacity: initial_recv_capacity,
        }
    }
}

/// Result of one exchange round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The round committed.
    Done(ExchangeStats),
    /// Some rank overflowed; state is unchanged and capacities have grown.
    Retry,
}

/// Commit summary of a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeStats {
    /// Rounds taken, including overflow retries.
    pub rounds: u32,
    /// Particles this rank sent away.
    pub sent: usize,
    /// Particles this rank received.
    pub received: usize,
}

/// Run exchange rounds until one commits, failing after [`MAX_ROUNDS`].
///
/// On success every local particle lies inside `boxes[comm.rank()]` and the
/// global particle count is unchanged; both are checked and a violation is
/// fatal on every rank at once.
pub fn exchange(
    comm: &Comm,
    set: &mut ParticleSet,
    boxes: &[DomainBox],
    state: &mut ExchangeState,
) -> Result<ExchangeStats, EngineError> {
    let global_before = comm.allreduce_sum_u64(set.len() as u64);
    for round in 1..=MAX_ROUNDS {
        match exchange_round(comm, set, boxes, state)? {
            ExchangeOutcome::Done(mut stats) => {
                stats.rounds = round;
                let global_after = comm.allreduce_sum_u64(set.len() as u64);
                if global_after != global_before {
                    return Err(EngineError::CountMismatch {
                        expected: global_before,
                        found: global_after,
                    });
                }
                let misplaced = set
                    .pos
                    .iter()
                    .filter(|p| !boxes[comm.rank()].contains(p))
                    .count();
                if comm.allreduce_or(misplaced > 0) {
                    return Err(EngineError::InvalidPartition(format!(
                        "{misplaced} particles outside their owner box after exchange"
                    )));
                }
                return Ok(stats);
            }
            ExchangeOutcome::Retry => {
                tracing::debug!(round, "exchange overflow, retrying with grown buffers");
            }
        }
    }
    Err(EngineError::ExchangeDiverged { rounds: MAX_ROUNDS })
}

/// One exchange round: classify, agree on fit, then either commit the
/// migration or grow and report `Retry` with nothing changed.
pub fn exchange_round(
    comm: &Comm,
    set: &mut ParticleSet,
    boxes: &[DomainBox],
    state: &mut ExchangeState,
) -> Result<ExchangeOutcome, EngineError> {
    let rank = comm.rank();
    assert_eq!(boxes.len(), comm.size(), "one box per rank");

    // Classify local particles against the box table. The widened table
    // covers all space, so an unclassifiable particle means the table is
    // corrupt; that verdict must be shared before anyone bails.
    let mut movers: Vec<Vec<usize>> = (0..comm.size()).map(|_| Vec::new()).collect();
    let mut unclassified = 0usize;
    for (i, p) in set.pos.iter().enumerate() {
        if boxes[rank].contains(p) {
            continue;
        }
        match boxes.iter().position(|b| b.contains(p)) {
            Some(dest) => movers[dest].push(i),
            None => unclassified += 1,
        }
    }
    if comm.allreduce_or(unclassified > 0) {
        return Err(EngineError::InvalidPartition(format!(
            "{unclassified} particles matched no box in the table"
        )));
    }

    // Count exchange, then collective overflow agreement. An overflowing
    // rank grows at least to the observed demand; growth is strictly
    // monotonic so repeated rounds always converge.
    let out_counts: Vec<u64> = movers.iter().map(|m| m.len() as u64).collect();
    let in_counts = comm.all_to_all_counts(&out_counts);
    let incoming: u64 = in_counts
        .iter()
        .enumerate()
        .filter(|(src, _)| *src != rank)
        .map(|(_, &c)| c)
        .sum();
    let overflow = incoming > state.recv_capacity as u64;
    if comm.allreduce_or(overflow) {
        if overflow {
            let grown = (state.recv_capacity * 2).max(incoming as usize);
            tracing::debug!(
                from = state.recv_capacity,
                to = grown,
                incoming,
                "receive capacity overflow"
            );
            state.recv_capacity = grown;
        }
        return Ok(ExchangeOutcome::Retry);
    }

    // Commit: build payloads, trade them, drop senders, append arrivals.
    let mut outgoing: Vec<ParticlePayload> =
        (0..comm.size()).map(|_| ParticlePayload::new()).collect();
    let mut sent = 0usize;
    for (dest, indices) in movers.iter().enumerate() {
        for &i in indices {
            outgoing[dest].push_from(set, i);
        }
        sent += indices.len();
    }
    let arrived = comm.all_to_all_payloads(outgoing);

    let mut leaving: Vec<usize> = movers.into_iter().flatten().collect();
    leaving.sort_unstable_by(|a, b| b.cmp(a));
    for i in leaving {
        set.remove_swap(i);
    }

    let mut received = 0usize;
    for (src, payload) in arrived.iter().enumerate() {
        if src == rank {
            continue;
        }
        payload.append_to(set);
        received += payload.len();
    }

    Ok(ExchangeOutcome::Done(ExchangeStats {
        rounds: 0,
        sent,
        received,
    }))
}

/// Distribute the root-held input across ranks in contiguous chunks, never
/// carrying more than `max_transfer` particles per message. Root keeps the
/// first chunk. Ranks other than root pass `None`.
pub fn initial_scatter(
    comm: &Comm,
    ic: Option<&InitialConditions>,
    max_transfer: usize,
) -> ParticleSet {
    assert!(max_transfer >= 1);
    let mut set = ParticleSet::new();

    if comm.rank() == 0 {
        let ic = ic.expect("root rank must hold the initial conditions");
        let n = ic.len();
        let size = comm.size();
        let base = n / size;
        let extra = n % size;
        let chunk_len = |r: usize| base + usize::from(r < extra);

        let mut offset = 0usize;
        for r in 0..size {
            let len = chunk_len(r);
            if r == 0 {
                for i in offset..offset + len {
                    set.push(ic.pos[i], ic.vel[i], ic.ids[i]);
                }
            } else {
                comm.send(r, Wire::Counts(vec![len as u64]));
                let mut start = offset;
                while start < offset + len {
                    let end = (start + max_transfer).min(offset + len);
                    let mut payload = ParticlePayload::new();
                    for i in start..end {
                        payload.pos.push(ic.pos[i]);
                        payload.vel.push(ic.vel[i]);
                        payload.acc0.push(Vec4::ZERO);
                        payload.time.push([0.0, 0.0]);
                        payload.ids.push(ic.ids[i]);
                    }
                    comm.send(r, Wire::Payload(payload));
                    start = end;
                }
            }
            offset += len;
        }
        tracing::info!(total = n, ranks = size, "initial scatter complete");
    } else {
        let expected = match comm.recv(0) {
            Wire::Counts(c) => c[0] as usize,
            other => panic!("wire protocol mismatch: expected Counts, got {other:?}"),
        };
        while set.len() < expected {
            match comm.recv(0) {
                Wire::Payload(p) => p.append_to(&mut set),
                other => panic!("wire protocol mismatch: expected Payload, got {other:?}"),
            }
        }
        assert_eq!(set.len(), expected, "scatter chunk accounting broke");
    }
    set
}
