//! Orchestration Layer
//!
//! This crate drives the distributed gravitational simulation, including:
//! - Configuration loading and validation
//! - Rank-to-rank message passing and collectives
//! - Orthogonal recursive bisection of the domain
//! - Particle ownership exchange with overflow retry
//! - The per-rank predict/exchange/evaluate/correct loop
//! - Snapshot output

#![warn(missing_docs)]

pub mod comm;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod orb;
pub mod snapshot;

pub use config::SimulationConfig;
pub use engine::{run_worker, EngineError, WorkerOutcome};
pub use exchange::{ClassCounts, InitialConditions};

use kernel::{CpuKernel, GravityKernel, ParticleSet};

use crate::comm::{run_cluster, Comm};
use crate::snapshot::{AsciiSnapshotWriter, SnapshotWriter};

/// Octree leaf capacity used by the CPU force backend.
const LEAF_CAPACITY: usize = 16;

/// Everything the cluster hands back after the last step.
#[derive(Debug)]
pub struct SimulationResult {
    /// All surviving particles, merged across ranks in rank order.
    pub particles: ParticleSet,
    /// Steps taken (identical on every rank).
    pub steps: u64,
    /// Simulated time reached.
    pub t_final: f64,
    /// Interaction counts summed over ranks.
    pub total_interactions: u64,
}

/// Run a complete simulation on an in-process cluster of `cfg.num_ranks`
/// worker threads, one gravity backend per rank.
///
/// `dust` carries the tracer population as its own set; it is merged into
/// the primary arrays before the scatter so the engine treats it as ordinary
/// low-mass particles, distinguished only by its id range.
///
/// # Example
/// ```no_run
/// use orchestrator::{run_simulation, InitialConditions, SimulationConfig};
///
/// let config = SimulationConfig::load("config/galaxy.json")?;
/// let ic = InitialConditions::default(); // populated by a reader
/// let result = run_simulation(&config, ic, None)?;
/// println!("{} particles after {} steps", result.particles.len(), result.steps);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn run_simulation(
    cfg: &SimulationConfig,
    mut ic: InitialConditions,
    dust: Option<InitialConditions>,
) -> Result<SimulationResult, EngineError> {
    if let Some(dust) = dust {
        ic.merge(dust);
    }
    let classes = ic.class_counts(&cfg.class_ranges);
    tracing::info!(
        name = %cfg.name,
        disk = classes.disk,
        bulge = classes.bulge,
        dark_matter = classes.dark_matter,
        dust = classes.dust,
        ranks = cfg.num_ranks,
        "starting simulation"
    );

    let ic = &ic;
    let outcomes = run_cluster(cfg.num_ranks, |comm: Comm| {
        let kernel = create_kernel(cfg);
        let root_ic = (comm.rank() == 0).then_some(ic);
        let mut writer = (comm.rank() == 0 && cfg.snapshot_interval.is_some())
            .then(|| AsciiSnapshotWriter::new(&cfg.snapshot_base));
        let writer_ref = writer.as_mut().map(|w| w as &mut dyn SnapshotWriter);
        run_worker(&comm, cfg, root_ic, kernel, writer_ref)
    });

    let mut particles = ParticleSet::new();
    let mut steps = 0;
    let mut t_final = 0.0;
    let mut total_interactions = 0;
    for outcome in outcomes {
        let outcome = outcome?;
        particles.append(&outcome.set);
        steps = outcome.steps;
        t_final = outcome.t_final;
        total_interactions += outcome.eval.total();
    }

    tracing::info!(
        steps,
        t_final,
        survivors = particles.len(),
        interactions = total_interactions,
        "simulation complete"
    );
    Ok(SimulationResult {
        particles,
        steps,
        t_final,
        total_interactions,
    })
}

/// Create a gravity backend for one rank. Prefers the GPU when the crate is
/// built with the `gpu` feature and an adapter is present, and falls back to
/// the CPU tree walk otherwise.
pub fn create_kernel(cfg: &SimulationConfig) -> Box<dyn GravityKernel> {
    #[cfg(feature = "gpu")]
    {
        if kernel::gpu_available() {
            match kernel::GpuKernel::new(cfg.softening) {
                Ok(gpu) => {
                    tracing::info!("using GPU gravity backend");
                    return Box::new(gpu);
                }
                Err(e) => {
                    tracing::warn!("GPU init failed ({e}), falling back to CPU");
                }
            }
        } else {
            tracing::info!("no GPU adapter, using CPU gravity backend");
        }
    }
    Box::new(CpuKernel::new(cfg.theta, cfg.softening, LEAF_CAPACITY))
}
