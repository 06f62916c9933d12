//! Gravitational N-Body Simulation Kernel
//!
//! This crate provides the compute core for a hierarchical (Barnes-Hut)
//! gravitational N-body simulation. It is designed to be separable and
//! compute-focused; distribution and orchestration live elsewhere.
//!
//! # Modules
//! - [`particle`] -- Struct-of-arrays particle storage with packed `Vec4` records.
//! - [`tree`] -- Index-arena octree with bottom-up multipole moments.
//! - [`force`] -- Opening-angle tree walk and softened pairwise gravity.
//! - [`integrate`] -- Predictor/corrector integration over the mirror arrays.

#![warn(missing_docs)]

pub mod force;
pub mod integrate;
pub mod particle;
pub mod tree;

#[cfg(feature = "gpu")]
#[allow(missing_docs)]
pub mod gpu;

pub use force::{accelerations, octant_moments, point_mass_accel, EvalStats};
pub use particle::{ClassRanges, ParticleClass, ParticleSet, Vec4};
pub use tree::Octree;

#[cfg(feature = "gpu")]
pub use gpu::{gpu_available, GpuInitError, GpuKernel};

// ---------------------------------------------------------------------------
// GravityKernel trait
// ---------------------------------------------------------------------------

/// Trait that all force-evaluation back-ends (CPU tree walk, GPU compute)
/// must implement.
///
/// A `GravityKernel` holds a derived view of the local bodies (tree topology
/// on the CPU, device buffers on the GPU) and is driven through three
/// operations each step:
///
/// 1. `rebuild` -- index the local bodies from scratch
/// 2. `refresh_moments` -- update aggregates for existing topology
/// 3. `evaluate` -- produce one acceleration per local body
pub trait GravityKernel: Send {
    /// Rebuild the derived view over `bodies` (predicted positions, mass
    /// packed in `w`). Invalidates everything from previous rebuilds.
    fn rebuild(&mut self, bodies: &[Vec4]);

    /// Update aggregates for the current topology after bodies moved. If the
    /// body count changed since the last rebuild, implementations fall back
    /// to a full rebuild.
    fn refresh_moments(&mut self, bodies: &[Vec4]);

    /// Evaluate accelerations for every indexed body, adding direct
    /// contributions from `imports` (remote aggregates, mass in `w`).
    /// `out[i]` receives the acceleration of body `i`, potential in `w`.
    /// `out` must have exactly one slot per indexed body.
    fn evaluate(&mut self, imports: &[Vec4], out: &mut [Vec4]) -> EvalStats;

    /// Export a coarse point-mass view of the local bodies for remote
    /// evaluators, down to `max_depth` levels of aggregation.
    fn export_moments(&self, max_depth: u32) -> Vec<Vec4>;

    /// Number of bodies currently indexed.
    fn body_count(&self) -> usize;
}

// ---------------------------------------------------------------------------
// CpuKernel -- reference tree-walk implementation of GravityKernel
// ---------------------------------------------------------------------------

/// Reference CPU implementation of the gravity kernel.
///
/// Keeps a copy of the indexed bodies next to the octree so evaluation can
/// walk leaves without borrowing caller state. The opening angle and
/// softening length are fixed at construction.
pub struct CpuKernel {
    tree: Octree,
    bodies: Vec<Vec4>,
    theta: f32,
    softening: f32,
}

impl CpuKernel {
    /// Create a CPU kernel with the given opening angle, softening length,
    /// and leaf capacity for the octree.
    pub fn new(theta: f32, softening: f32, leaf_capacity: usize) -> Self {
        Self {
            tree: Octree::new(leaf_capacity),
            bodies: Vec::new(),
            theta,
            softening,
        }
    }

    /// The octree over the most recently indexed bodies.
    pub fn tree(&self) -> &Octree {
        &self.tree
    }
}

impl GravityKernel for CpuKernel {
    fn rebuild(&mut self, bodies: &[Vec4]) {
        self.bodies.clear();
        self.bodies.extend_from_slice(bodies);
        self.tree.rebuild(&self.bodies);
    }

    fn refresh_moments(&mut self, bodies: &[Vec4]) {
        if bodies.len() != self.bodies.len() {
            tracing::debug!(
                old = self.bodies.len(),
                new = bodies.len(),
                "body count changed since last rebuild, rebuilding"
            );
            self.rebuild(bodies);
            return;
        }
        self.bodies.copy_from_slice(bodies);
        self.tree.refresh_moments(&self.bodies);
    }

    fn evaluate(&mut self, imports: &[Vec4], out: &mut [Vec4]) -> EvalStats {
        let mut stats = force::accelerations(
            &self.tree,
            &self.bodies,
            self.softening,
            self.theta,
            out,
        );
        stats.node_interactions +=
            force::point_mass_accel(&self.bodies, imports, self.softening, out);
        stats
    }

    fn export_moments(&self, max_depth: u32) -> Vec<Vec4> {
        self.tree.coarse_moments(max_depth)
    }

    fn body_count(&self) -> usize {
        self.bodies.len()
    }
}
