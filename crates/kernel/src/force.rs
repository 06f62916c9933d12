//! Softened gravitational force evaluation against the octree.
//!
//! Each particle walks the tree once. A cell whose angular size passes the
//! opening-angle test contributes as a single point mass at its center of
//! mass; otherwise its children are visited, down to exact pairwise terms at
//! the leaves. The pairwise kernel is Plummer-softened:
//! `a = m * dr / (r^2 + eps^2)^(3/2)`, with the potential accumulated in the
//! `w` lane.

use crate::particle::Vec4;
use crate::tree::Octree;

/// Interaction counters for one evaluation pass.
///
/// Tightening the opening angle can only move interactions from the node
/// counter to the (more numerous) leaf counter, so the total never drops as
/// theta decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Cell-as-aggregate interactions.
    pub node_interactions: u64,
    /// Exact particle-particle interactions.
    pub leaf_interactions: u64,
}

impl EvalStats {
    /// Combined interaction count.
    pub fn total(&self) -> u64 {
        self.node_interactions + self.leaf_interactions
    }

    /// Fold another pass's counters into this one.
    pub fn merge(&mut self, other: &EvalStats) {
        self.node_interactions += other.node_interactions;
        self.leaf_interactions += other.leaf_interactions;
    }
}

/// Evaluate accelerations for every body against the tree built over the
/// same `bodies` slice. `out[i]` receives the acceleration of body `i` with
/// its potential in `w`; previous contents are overwritten.
pub fn accelerations(
    tree: &Octree,
    bodies: &[Vec4],
    softening: f32,
    theta: f32,
    out: &mut [Vec4],
) -> EvalStats {
    assert_eq!(bodies.len(), out.len(), "output slice must match body count");
    let eps2 = softening * softening;
    let mut stats = EvalStats::default();
    let nodes = tree.nodes();
    let order = tree.order();
    if nodes.is_empty() {
        out.fill(Vec4::ZERO);
        return stats;
    }

    let mut stack: Vec<u32> = Vec::with_capacity(64);
    for (i, target) in bodies.iter().enumerate() {
        let mut acc = Vec4::ZERO;
        stack.clear();
        stack.push(0);
        while let Some(idx) = stack.pop() {
            let node = &nodes[idx as usize];
            if node.mass <= 0.0 {
                continue;
            }
            let dx = node.com[0] - target.x;
            let dy = node.com[1] - target.y;
            let dz = node.com[2] - target.z;
            let dist2 = dx * dx + dy * dy + dz * dz;
            let size = node.half * 2.0;
            if !node.is_leaf() && size * size >= theta * theta * dist2 {
                for c in 0..node.child_count as u32 {
                    stack.push(node.first_child + c);
                }
                continue;
            }
            if node.is_leaf() {
                let start = node.body_start as usize;
                let end = start + node.body_count as usize;
                for &b in &order[start..end] {
                    if b as usize == i {
                        continue;
                    }
                    add_pair(&mut acc, target, &bodies[b as usize], eps2);
                    stats.leaf_interactions += 1;
                }
            } else {
                let r2 = dist2 + eps2;
                let inv = 1.0 / r2.sqrt();
                let inv3 = inv * inv * inv;
                acc.x += node.mass * inv3 * dx;
                acc.y += node.mass * inv3 * dy;
                acc.z += node.mass * inv3 * dz;
                acc.w -= node.mass * inv;
                stats.node_interactions += 1;
            }
        }
        out[i] = acc;
    }
    stats
}

/// Add direct point-mass contributions from `sources` (mass in `w`) to every
/// target's acceleration. Used for aggregates imported from remote domains,
/// which by construction are never the target itself. Returns the number of
/// interactions added.
pub fn point_mass_accel(targets: &[Vec4], sources: &[Vec4], softening: f32, out: &mut [Vec4]) -> u64 {
    assert_eq!(targets.len(), out.len(), "output slice must match target count");
    let eps2 = softening * softening;
    for (target, acc) in targets.iter().zip(out.iter_mut()) {
        for source in sources {
            add_pair(acc, target, source, eps2);
        }
    }
    (targets.len() as u64) * (sources.len() as u64)
}

/// Coarse one-level octant aggregation of a body slice, used by evaluators
/// without tree topology to export remote aggregates.
pub fn octant_moments(bodies: &[Vec4]) -> Vec<Vec4> {
    if bodies.is_empty() {
        return Vec::new();
    }
    let mut center = [0.0f64; 3];
    let mut total = 0.0f64;
    for p in bodies {
        let w = p.w as f64;
        total += w;
        center[0] += w * p.x as f64;
        center[1] += w * p.y as f64;
        center[2] += w * p.z as f64;
    }
    if total > 0.0 {
        for c in &mut center {
            *c /= total;
        }
    }
    let mut moments = [[0.0f64; 4]; 8];
    for p in bodies {
        let o = usize::from(p.x as f64 >= center[0])
            | (usize::from(p.y as f64 >= center[1]) << 1)
            | (usize::from(p.z as f64 >= center[2]) << 2);
        let w = p.w as f64;
        moments[o][0] += w * p.x as f64;
        moments[o][1] += w * p.y as f64;
        moments[o][2] += w * p.z as f64;
        moments[o][3] += w;
    }
    moments
        .iter()
        .filter(|m| m[3] > 0.0)
        .map(|m| {
            Vec4::new(
                (m[0] / m[3]) as f32,
                (m[1] / m[3]) as f32,
                (m[2] / m[3]) as f32,
                m[3] as f32,
            )
        })
        .collect()
}

#[inline]
fn add_pair(acc: &mut Vec4, target: &Vec4, source: &Vec4, eps2: f32) {
    let dx = source.x - target.x;
    let dy = source.y - target.y;
    let dz = source.z - target.z;
    let r2 = dx * dx + dy * dy + dz * dz + eps2;
    let inv = 1.0 / r2.sqrt();
    let inv3 = inv * inv * inv;
    acc.x += source.w * inv3 * dx;
    acc.y += source.w * inv3 * dy;
    acc.z += source.w * inv3 * dz;
    acc.w -= source.w * inv;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_bodies_attract_symmetrically() {
        let bodies = vec![
            Vec4::new(0.0, 0.0, 0.0, 2.0),
            Vec4::new(1.0, 0.0, 0.0, 3.0),
        ];
        let mut tree = Octree::new(8);
        tree.rebuild(&bodies);
        let mut acc = vec![Vec4::ZERO; 2];
        accelerations(&tree, &bodies, 0.1, 0.5, &mut acc);

        let r2: f32 = 1.0 + 0.01;
        let expected = r2.powf(-1.5);
        assert!((acc[0].x - 3.0 * expected).abs() < 1e-5);
        assert!((acc[1].x + 2.0 * expected).abs() < 1e-5);
        // Momentum: m0*a0 + m1*a1 = 0
        assert!((2.0 * acc[0].x + 3.0 * acc[1].x).abs() < 1e-4);
        assert_eq!(acc[0].y, 0.0);
        assert_eq!(acc[0].z, 0.0);
    }

    #[test]
    fn potential_accumulates_in_w() {
        let bodies = vec![
            Vec4::new(0.0, 0.0, 0.0, 1.0),
            Vec4::new(2.0, 0.0, 0.0, 1.0),
        ];
        let mut tree = Octree::new(8);
        tree.rebuild(&bodies);
        let mut acc = vec![Vec4::ZERO; 2];
        accelerations(&tree, &bodies, 0.0, 0.5, &mut acc);
        assert!((acc[0].w + 0.5).abs() < 1e-6);
        assert!((acc[1].w + 0.5).abs() < 1e-6);
    }

    #[test]
    fn imports_contribute_to_every_target() {
        let targets = vec![Vec4::new(0.0, 0.0, 0.0, 1.0)];
        let sources = vec![Vec4::new(0.0, 3.0, 0.0, 4.0)];
        let mut acc = vec![Vec4::ZERO; 1];
        let n = point_mass_accel(&targets, &sources, 0.0, &mut acc);
        assert_eq!(n, 1);
        assert!((acc[0].y - 4.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn octant_moments_conserve_mass() {
        let bodies = vec![
            Vec4::new(-1.0, -1.0, -1.0, 1.0),
            Vec4::new(1.0, 1.0, 1.0, 2.0),
            Vec4::new(-1.0, 1.0, -1.0, 0.5),
        ];
        let moments = octant_moments(&bodies);
        let total: f32 = moments.iter().map(|m| m.w).sum();
        assert!((total - 3.5).abs() < 1e-6);
        assert!(moments.len() <= 8 && !moments.is_empty());
    }
}
