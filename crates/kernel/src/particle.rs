//! Particle data structures using struct-of-arrays layout for GPU-readiness.
//!
//! All arrays are parallel: index `i` across every array refers to the same
//! particle. Positions pack the particle mass into the fourth lane and
//! velocities pack the softening length, so one `Vec4` maps directly onto a
//! GPU `vec4<f32>` without re-marshalling.

use bytemuck::{Pod, Zeroable};

/// Four packed `f32` lanes, the fundamental particle attribute record.
///
/// `w` carries a per-attribute payload: mass for positions, softening length
/// for velocities, potential for accelerations.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vec4 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// Packed scalar payload (mass / softening / potential)
    pub w: f32,
}

impl Vec4 {
    /// All-zero record.
    pub const ZERO: Vec4 = Vec4 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 0.0,
    };

    /// Construct from explicit lanes.
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Squared spatial distance to `other`, ignoring the `w` lane.
    pub fn dist2(&self, other: &Vec4) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Squared spatial norm, ignoring the `w` lane.
    pub fn norm2(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
}

/// Particle population class, derived from the particle id range.
///
/// The numeric thresholds are a property of the input data set, not of the
/// engine, and are injected through [`ClassRanges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ParticleClass {
    /// Disk stars
    Disk,
    /// Bulge stars
    Bulge,
    /// Dark-matter halo particles
    DarkMatter,
    /// Dust (tracer population merged into the primary buffer)
    Dust,
}

/// Id-range thresholds partitioning the particle population into classes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassRanges {
    /// Ids at or above this value (outside the dust and dark ranges) are bulge stars.
    pub bulge_start: u32,
    /// Ids at or above this value are dark matter.
    pub dark_start: u32,
    /// Inclusive lower bound of the dust id range.
    pub dust_start: u32,
    /// Exclusive upper bound of the dust id range.
    pub dust_end: u32,
}

impl Default for ClassRanges {
    fn default() -> Self {
        Self {
            bulge_start: 10_000_000,
            dark_start: 100_000_000,
            dust_start: 50_000_000,
            dust_end: 100_000_000,
        }
    }
}

impl ClassRanges {
    /// Classify a particle id.
    pub fn classify(&self, id: u32) -> ParticleClass {
        if id >= self.dust_start && id < self.dust_end {
            ParticleClass::Dust
        } else if id >= self.dark_start {
            ParticleClass::DarkMatter
        } else if id >= self.bulge_start {
            ParticleClass::Bulge
        } else {
            ParticleClass::Disk
        }
    }
}

/// Struct-of-arrays particle storage.
///
/// Holds the authoritative state (`pos`, `vel`), the previous and current
/// accelerations (`acc0`, `acc1`) for the corrector, per-particle time state
/// (`time[i] = [t_last, dt]`), ids, and the predicted mirrors (`ppos`,
/// `pvel`) written by the predictor and read by tree construction and force
/// evaluation. Prediction never overwrites the authoritative state.
#[derive(Debug, Clone, Default)]
pub struct ParticleSet {
    /// Positions; mass packed in `w`.
    pub pos: Vec<Vec4>,
    /// Velocities; softening length packed in `w`.
    pub vel: Vec<Vec4>,
    /// Acceleration from the previous step; potential packed in `w`.
    pub acc0: Vec<Vec4>,
    /// Acceleration from the current step; potential packed in `w`.
    pub acc1: Vec<Vec4>,
    /// Per-particle time state: `[last update time, step size]`.
    pub time: Vec<[f32; 2]>,
    /// Globally unique particle ids, never reassigned.
    pub ids: Vec<u32>,
    /// Predicted positions; mass packed in `w`.
    pub ppos: Vec<Vec4>,
    /// Predicted velocities; softening packed in `w`.
    pub pvel: Vec<Vec4>,
}

impl ParticleSet {
    /// Create an empty particle collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of particles currently stored.
    pub fn len(&self) -> usize {
        self.pos.len()
    }

    /// Return `true` if there are no particles.
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    /// Append a particle with fresh integration state.
    ///
    /// Accelerations and time state start at zero; the predicted mirrors are
    /// seeded from the authoritative state so the arrays stay parallel.
    pub fn push(&mut self, pos: Vec4, vel: Vec4, id: u32) {
        self.pos.push(pos);
        self.vel.push(vel);
        self.acc0.push(Vec4::ZERO);
        self.acc1.push(Vec4::ZERO);
        self.time.push([0.0, 0.0]);
        self.ids.push(id);
        self.ppos.push(pos);
        self.pvel.push(vel);
    }

    /// Append a migrated particle, carrying its accumulated integration
    /// state. The predicted mirrors are seeded from the authoritative state
    /// and must be refreshed by the next predictor pass.
    pub fn push_migrant(&mut self, pos: Vec4, vel: Vec4, acc0: Vec4, time: [f32; 2], id: u32) {
        self.pos.push(pos);
        self.vel.push(vel);
        self.acc0.push(acc0);
        self.acc1.push(Vec4::ZERO);
        self.time.push(time);
        self.ids.push(id);
        self.ppos.push(pos);
        self.pvel.push(vel);
    }

    /// Grow or shrink every paired array to `n` particles.
    ///
    /// New slots are zero-initialized. Derived data (tree topology, moments)
    /// is invalid after a resize until the next rebuild.
    pub fn resize(&mut self, n: usize) {
        self.pos.resize(n, Vec4::ZERO);
        self.vel.resize(n, Vec4::ZERO);
        self.acc0.resize(n, Vec4::ZERO);
        self.acc1.resize(n, Vec4::ZERO);
        self.time.resize(n, [0.0, 0.0]);
        self.ids.resize(n, 0);
        self.ppos.resize(n, Vec4::ZERO);
        self.pvel.resize(n, Vec4::ZERO);
    }

    /// Remove particle `i` by swapping in the last particle. O(1), does not
    /// preserve order. Panics if `i` is out of range.
    pub fn remove_swap(&mut self, i: usize) {
        self.pos.swap_remove(i);
        self.vel.swap_remove(i);
        self.acc0.swap_remove(i);
        self.acc1.swap_remove(i);
        self.time.swap_remove(i);
        self.ids.swap_remove(i);
        self.ppos.swap_remove(i);
        self.pvel.swap_remove(i);
    }

    /// Append all particles of `other`, preserving their state. Merges a
    /// secondary population (e.g. dust) into the primary set host-side; the
    /// device-side equivalent is the mirrored-buffer append.
    pub fn append(&mut self, other: &ParticleSet) {
        self.pos.extend_from_slice(&other.pos);
        self.vel.extend_from_slice(&other.vel);
        self.acc0.extend_from_slice(&other.acc0);
        self.acc1.extend_from_slice(&other.acc1);
        self.time.extend_from_slice(&other.time);
        self.ids.extend_from_slice(&other.ids);
        self.ppos.extend_from_slice(&other.ppos);
        self.pvel.extend_from_slice(&other.pvel);
    }

    /// Check the parallel-array invariant: every array has the same length.
    pub fn is_coherent(&self) -> bool {
        let n = self.pos.len();
        self.vel.len() == n
            && self.acc0.len() == n
            && self.acc1.len() == n
            && self.time.len() == n
            && self.ids.len() == n
            && self.ppos.len() == n
            && self.pvel.len() == n
    }

    /// Total mass of the stored particles.
    pub fn total_mass(&self) -> f64 {
        self.pos.iter().map(|p| p.w as f64).sum()
    }
}
