//! The per-rank simulation loop.
//!
//! Each step: predict mirrors, migrate particles to their owner ranks,
//! rebuild or refresh the force index, trade coarse aggregates with the
//! other ranks, evaluate accelerations, commit the corrector, then agree on
//! the next shared step size. The domain decomposition is refreshed on a
//! longer cadence.

use std::error::Error;
use std::fmt;
use std::time::Instant;

use kernel::{integrate, EvalStats, GravityKernel, ParticleSet, Vec4};

use crate::comm::Comm;
use crate::config::SimulationConfig;
use crate::exchange::{exchange, initial_scatter, ExchangeState, InitialConditions, ParticlePayload};
use crate::orb::{decompose, validate_partition, DomainBox};
use crate::snapshot::SnapshotWriter;

/// Aggregation depth of the coarse moments exported to remote ranks.
const EXPORT_DEPTH: u32 = 2;

/// Fatal simulation errors. Every variant is detected collectively, so all
/// ranks fail together rather than deadlocking on a missing peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The global particle count changed where it must be conserved.
    CountMismatch {
        /// Count before the operation.
        expected: u64,
        /// Count after the operation.
        found: u64,
    },
    /// The exchange protocol failed to commit within its round limit.
    ExchangeDiverged {
        /// Rounds attempted.
        rounds: u32,
    },
    /// The domain box table is overlapping, gappy, or failed to classify a
    /// particle.
    InvalidPartition(String),
    /// A particle array invariant broke.
    MirrorMismatch(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::CountMismatch { expected, found } => write!(
                f,
                "global particle count changed: expected {expected}, found {found}"
            ),
            EngineError::ExchangeDiverged { rounds } => {
                write!(f, "particle exchange failed to commit after {rounds} rounds")
            }
            EngineError::InvalidPartition(msg) => write!(f, "invalid domain partition: {msg}"),
            EngineError::MirrorMismatch(msg) => write!(f, "particle state invariant broke: {msg}"),
        }
    }
}

impl Error for EngineError {}

/// What a worker rank hands back when the loop ends.
#[derive(Debug)]
pub struct WorkerOutcome {
    /// The rank's final local particles.
    pub set: ParticleSet,
    /// Steps taken.
    pub steps: u64,
    /// Simulated time reached.
    pub t_final: f64,
    /// Accumulated interaction counts.
    pub eval: EvalStats,
}

/// Run the simulation loop on one rank until `t_end` or until the global
/// population empties. `ic` must be `Some` on rank 0 only; `snapshot` is
/// consulted on rank 0 only.
pub fn run_worker(
    comm: &Comm,
    cfg: &SimulationConfig,
    ic: Option<&InitialConditions>,
    mut kernel: Box<dyn GravityKernel>,
    mut snapshot: Option<&mut dyn SnapshotWriter>,
) -> Result<WorkerOutcome, EngineError> {
    let mut set = initial_scatter(comm, ic, cfg.max_transfer);
    for v in &mut set.vel {
        v.w = cfg.softening;
    }
    for v in &mut set.pvel {
        v.w = cfg.softening;
    }
    let mut global_count = comm.allreduce_sum_u64(set.len() as u64);
    let global_mass = comm.allreduce_sum_f64(set.total_mass());
    tracing::info!(
        rank = comm.rank(),
        local = set.len(),
        global = global_count,
        mass = global_mass,
        "worker initialized"
    );

    let mut exchange_state = ExchangeState::new(cfg.initial_recv_capacity);
    let mut boxes = rebalance(comm, &set, 1.0)?;
    exchange(comm, &mut set, &boxes, &mut exchange_state)?;

    // Bootstrap accelerations at the initial positions so the first
    // predictor step has an acc0 to extrapolate with.
    integrate::predict(&mut set, 0.0);
    kernel.rebuild(&set.ppos);
    let imports = gather_imports(comm, kernel.as_ref());
    let mut scratch = vec![Vec4::ZERO; set.len()];
    let mut eval = kernel.evaluate(&imports, &mut scratch);
    set.acc0.copy_from_slice(&scratch);

    let mut t = 0.0f64;
    let mut dt = cfg.dt_initial;
    let mut steps = 0u64;
    let mut next_snapshot = cfg.snapshot_interval;
    let mut work_timer = Instant::now();

    while t < cfg.t_end && global_count > 0 {
        integrate::predict(&mut set, dt);

        if steps > 0 && steps % cfg.rebalance_interval == 0 {
            let weight =
                observed_work_weight(comm, work_timer.elapsed().as_secs_f64(), set.len());
            boxes = rebalance(comm, &set, weight)?;
            work_timer = Instant::now();
        }
        let stats = exchange(comm, &mut set, &boxes, &mut exchange_state)?;
        if stats.received > 0 {
            // Migrants arrive with authoritative state only; redo the
            // (idempotent) prediction so their mirrors match this step.
            integrate::predict(&mut set, dt);
        }

        if steps % cfg.rebuild_interval == 0 {
            kernel.rebuild(&set.ppos);
        } else {
            kernel.refresh_moments(&set.ppos);
        }
        let imports = gather_imports(comm, kernel.as_ref());

        scratch.clear();
        scratch.resize(set.len(), Vec4::ZERO);
        eval.merge(&kernel.evaluate(&imports, &mut scratch));
        set.acc1.copy_from_slice(&scratch);

        let local_dt = integrate::correct(&mut set, t, dt, cfg.eta, cfg.dt_min, cfg.dt_max);
        t += dt as f64;
        dt = comm.allreduce_min_f32(local_dt);
        steps += 1;

        if let Some(limit) = cfg.remove_distance {
            let removed = remove_distant(&mut set, limit);
            let removed_global = comm.allreduce_sum_u64(removed as u64);
            if removed_global > 0 {
                global_count -= removed_global;
                tracing::info!(removed = removed_global, remaining = global_count, t, "dropped distant particles");
            }
        }

        if comm.allreduce_or(!set.is_coherent()) {
            return Err(EngineError::MirrorMismatch(
                "particle arrays lost parallelism".to_string(),
            ));
        }

        if let Some(interval) = cfg.snapshot_interval {
            while next_snapshot.is_some_and(|at| t >= at) {
                write_snapshot(comm, &set, t, &mut snapshot);
                next_snapshot = Some(next_snapshot.unwrap() + interval);
            }
        }

        if steps % 100 == 0 {
            tracing::debug!(
                rank = comm.rank(),
                steps,
                t,
                dt,
                local = set.len(),
                interactions = eval.total(),
                "progress"
            );
        }
    }

    tracing::info!(rank = comm.rank(), steps, t, local = set.len(), "worker finished");
    Ok(WorkerOutcome {
        set,
        steps,
        t_final: t,
        eval,
    })
}

/// Recompute the domain decomposition and verify the table before anyone
/// classifies against it.
fn rebalance(
    comm: &Comm,
    set: &ParticleSet,
    work_weight: f32,
) -> Result<Vec<DomainBox>, EngineError> {
    let boxes = decompose(comm, &set.pos, work_weight);
    validate_partition(&boxes).map_err(EngineError::InvalidPartition)?;
    Ok(boxes)
}

/// Per-particle cost this rank observed since the previous rebalance,
/// relative to the cluster average. Feeding this into the decomposition
/// spreads expensive particles over smaller box populations.
fn observed_work_weight(comm: &Comm, elapsed_secs: f64, local_count: usize) -> f32 {
    let cost = elapsed_secs / local_count.max(1) as f64;
    let mean = comm.allreduce_sum_f64(cost) / comm.size() as f64;
    if cost > 0.0 && mean > 0.0 {
        (cost / mean) as f32
    } else {
        1.0
    }
}

/// Trade coarse aggregates: every rank receives every other rank's exported
/// moments, flattened into one import list that excludes its own.
fn gather_imports(comm: &Comm, kernel: &dyn GravityKernel) -> Vec<Vec4> {
    let exported = kernel.export_moments(EXPORT_DEPTH);
    let all = comm.allgather_bodies(exported);
    let mut imports = Vec::new();
    for (src, list) in all.into_iter().enumerate() {
        if src != comm.rank() {
            imports.extend(list);
        }
    }
    imports
}

/// Drop particles farther than `limit` from the origin. Returns how many
/// were removed locally.
fn remove_distant(set: &mut ParticleSet, limit: f32) -> usize {
    let limit2 = limit * limit;
    let mut removed = 0;
    let mut i = 0;
    while i < set.len() {
        if set.pos[i].norm2() > limit2 {
            set.remove_swap(i);
            removed += 1;
        } else {
            i += 1;
        }
    }
    removed
}

/// Gather the global population to rank 0 and hand it to the writer. An IO
/// failure is logged, never fatal.
fn write_snapshot(
    comm: &Comm,
    set: &ParticleSet,
    t: f64,
    writer: &mut Option<&mut dyn SnapshotWriter>,
) {
    let gathered = comm.gather_payloads_to_root(ParticlePayload::from_set(set));
    if comm.rank() != 0 {
        return;
    }
    let Some(writer) = writer.as_deref_mut() else {
        return;
    };
    let mut merged = ParticlePayload::new();
    for chunk in gathered.unwrap_or_default() {
        merged.pos.extend_from_slice(&chunk.pos);
        merged.vel.extend_from_slice(&chunk.vel);
        merged.acc0.extend_from_slice(&chunk.acc0);
        merged.time.extend_from_slice(&chunk.time);
        merged.ids.extend_from_slice(&chunk.ids);
    }
    if let Err(e) = writer.write(t, &merged) {
        tracing::warn!(error = %e, t, "snapshot write failed, continuing");
    }
}
