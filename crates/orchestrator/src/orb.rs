//! Orthogonal recursive bisection of the particle population.
//!
//! The rank range is split in half recursively; each cut lies on the longest
//! axis of the current region and is located by bisection driven purely by
//! weighted-count reductions. No particle data ever crosses ranks here, only
//! scalar counts, so a decomposition costs O(ranks * iterations) small
//! messages regardless of population size.

use kernel::Vec4;

use crate::comm::Comm;

/// Faces coinciding with the outer hull are pushed out to this magnitude so
/// the union of boxes covers anywhere a particle can drift.
const HUGE_EXTENT: f32 = 1.0e30;

/// Bisection iterations per cut. 40 halvings of an f32 interval is beyond
/// exhaustion of the mantissa.
const BISECT_ITERS: usize = 40;

/// Half-open axis-aligned region: a point belongs iff `low <= p < high` on
/// every axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainBox {
    /// Inclusive lower corner.
    pub low: [f32; 3],
    /// Exclusive upper corner.
    pub high: [f32; 3],
}

impl DomainBox {
    /// A box covering all representable space.
    pub fn everywhere() -> Self {
        Self {
            low: [-HUGE_EXTENT; 3],
            high: [HUGE_EXTENT; 3],
        }
    }

    /// Half-open membership test, ignoring `w`.
    pub fn contains(&self, p: &Vec4) -> bool {
        let c = [p.x, p.y, p.z];
        (0..3).all(|a| self.low[a] <= c[a] && c[a] < self.high[a])
    }

    /// Axis with the largest extent.
    pub fn longest_axis(&self) -> usize {
        let mut axis = 0;
        let mut best = self.high[0] - self.low[0];
        for a in 1..3 {
            let extent = self.high[a] - self.low[a];
            if extent > best {
                best = extent;
                axis = a;
            }
        }
        axis
    }

    /// Positive-volume intersection test (shared faces do not count).
    pub fn overlaps(&self, other: &DomainBox) -> bool {
        (0..3).all(|a| self.low[a] < other.high[a] && other.low[a] < self.high[a])
    }
}

/// Bounding box of the local particles, if any.
pub fn local_bounds(positions: &[Vec4]) -> Option<DomainBox> {
    if positions.is_empty() {
        return None;
    }
    let mut low = [f32::INFINITY; 3];
    let mut high = [f32::NEG_INFINITY; 3];
    for p in positions {
        let c = [p.x, p.y, p.z];
        for a in 0..3 {
            low[a] = low[a].min(c[a]);
            high[a] = high[a].max(c[a]);
        }
    }
    Some(DomainBox { low, high })
}

/// Decompose the global population into one box per rank.
///
/// `work_weight` is this rank's observed per-particle cost relative to the
/// cluster average; it scales the rank's contribution to the balance counts,
/// so regions holding expensive particles are cut into smaller populations.
/// Every rank runs the same deterministic recursion and arrives at an
/// identical box table.
pub fn decompose(comm: &Comm, positions: &[Vec4], work_weight: f32) -> Vec<DomainBox> {
    let bounds = global_bounds(comm, positions);
    if comm.size() == 1 {
        return vec![DomainBox::everywhere()];
    }

    let mut boxes = Vec::with_capacity(comm.size());
    carve(comm, positions, work_weight as f64, bounds, comm.size(), &mut boxes);
    debug_assert_eq!(boxes.len(), comm.size());
    widen_outer_faces(&mut boxes, &bounds);
    tracing::debug!(ranks = comm.size(), "domain decomposition complete");
    boxes
}

/// Check partition validity: pairwise disjoint and covering the bounding
/// region. Returns a description of the first violation found.
pub fn validate_partition(boxes: &[DomainBox]) -> Result<(), String> {
    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            if boxes[i].overlaps(&boxes[j]) {
                return Err(format!(
                    "boxes {i} and {j} overlap with positive volume: {:?} vs {:?}",
                    boxes[i], boxes[j]
                ));
            }
        }
    }

    // Cover check over a sample grid spanning the finite core of the
    // partition. Bisection cuts make gaps structurally impossible, so a
    // failure here means the table was corrupted.
    let mut low = [f32::INFINITY; 3];
    let mut high = [f32::NEG_INFINITY; 3];
    for b in boxes {
        for a in 0..3 {
            if b.low[a] > -HUGE_EXTENT {
                low[a] = low[a].min(b.low[a]);
            }
            if b.high[a] < HUGE_EXTENT {
                high[a] = high[a].max(b.high[a]);
            }
        }
    }
    const SAMPLES: usize = 5;
    for ix in 0..SAMPLES {
        for iy in 0..SAMPLES {
            for iz in 0..SAMPLES {
                let frac = |k: usize| (k as f32 + 0.5) / SAMPLES as f32;
                let p = Vec4::new(
                    sample_coord(low[0], high[0], frac(ix)),
                    sample_coord(low[1], high[1], frac(iy)),
                    sample_coord(low[2], high[2], frac(iz)),
                    0.0,
                );
                let owners = boxes.iter().filter(|b| b.contains(&p)).count();
                if owners != 1 {
                    return Err(format!(
                        "point ({}, {}, {}) owned by {owners} boxes",
                        p.x, p.y, p.z
                    ));
                }
            }
        }
    }
    Ok(())
}

fn sample_coord(low: f32, high: f32, frac: f32) -> f32 {
    if low.is_finite() && high.is_finite() && low < high {
        low + frac * (high - low)
    } else {
        0.0
    }
}

/// Global particle bounding box via six scalar reductions. All-empty ranks
/// fall back to a unit box around the origin.
fn global_bounds(comm: &Comm, positions: &[Vec4]) -> DomainBox {
    let local = local_bounds(positions);
    let (lo, hi) = match local {
        Some(b) => (b.low, b.high),
        None => ([f32::INFINITY; 3], [f32::NEG_INFINITY; 3]),
    };
    let mut low = [0.0f32; 3];
    let mut high = [0.0f32; 3];
    for a in 0..3 {
        low[a] = comm.allreduce_min_f32(lo[a]);
        high[a] = comm.allreduce_max_f32(hi[a]);
    }
    if !low[0].is_finite() || low[0] > high[0] {
        return DomainBox {
            low: [-0.5; 3],
            high: [0.5; 3],
        };
    }
    // Nudge the top faces so boundary particles sit strictly inside the
    // half-open region.
    for a in 0..3 {
        let pad = (high[a] - low[a]).max(1e-3) * 1e-4;
        high[a] += pad;
    }
    DomainBox { low, high }
}

/// Recursively carve `region` into `n_ranks` boxes, appending them in rank
/// order. Every rank participates in every reduction.
fn carve(
    comm: &Comm,
    positions: &[Vec4],
    weight: f64,
    region: DomainBox,
    n_ranks: usize,
    out: &mut Vec<DomainBox>,
) {
    if n_ranks == 1 {
        out.push(region);
        return;
    }

    let left_ranks = n_ranks / 2;
    let axis = region.longest_axis();
    let total = weighted_count(comm, positions, weight, &region, axis, region.high[axis]);
    let target = total * (left_ranks as f64) / (n_ranks as f64);

    let mut lo = region.low[axis];
    let mut hi = region.high[axis];
    for _ in 0..BISECT_ITERS {
        let mid = 0.5 * (lo + hi);
        let below = weighted_count(comm, positions, weight, &region, axis, mid);
        if below < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let cut = 0.5 * (lo + hi);

    let mut left = region;
    left.high[axis] = cut;
    let mut right = region;
    right.low[axis] = cut;

    carve(comm, positions, weight, left, left_ranks, out);
    carve(comm, positions, weight, right, n_ranks - left_ranks, out);
}

/// Global weighted count of particles inside `region` with coordinate on
/// `axis` below `cut`.
fn weighted_count(
    comm: &Comm,
    positions: &[Vec4],
    weight: f64,
    region: &DomainBox,
    axis: usize,
    cut: f32,
) -> f64 {
    let local: f64 = positions
        .iter()
        .filter(|p| region.contains(p) && [p.x, p.y, p.z][axis] < cut)
        .count() as f64
        * weight;
    comm.allreduce_sum_f64(local)
}

/// Push faces that coincide with the hull of the decomposed region out to
/// ±huge, so ownership classification covers drifting particles.
fn widen_outer_faces(boxes: &mut [DomainBox], bounds: &DomainBox) {
    for b in boxes.iter_mut() {
        for a in 0..3 {
            if b.low[a] <= bounds.low[a] {
                b.low[a] = -HUGE_EXTENT;
            }
            if b.high[a] >= bounds.high[a] {
                b.high[a] = HUGE_EXTENT;
            }
        }
    }
}
