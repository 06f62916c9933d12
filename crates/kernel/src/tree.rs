//! Octree construction over packed particle positions.
//!
//! Nodes live in a flat arena (`Vec<Node>`) and reference their children by
//! index, with each node's child block stored contiguously. The arena is
//! rebuilt from scratch every rebuild cycle; nothing outside the arena holds
//! node references, so stale topology cannot outlive a rebuild.

use crate::particle::Vec4;

/// Hard recursion cap; coincident particles would otherwise split forever.
const MAX_DEPTH: u32 = 24;

/// One octree cell.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    /// Geometric center of the cell.
    pub center: [f32; 3],
    /// Half extent of the cubic cell.
    pub half: f32,
    /// Total mass of the particles below this cell.
    pub mass: f32,
    /// Center of mass of the particles below this cell.
    pub com: [f32; 3],
    /// Arena index of the first child; children occupy a contiguous block.
    pub first_child: u32,
    /// Number of children (0 for leaves, up to 8 for internal nodes).
    pub child_count: u8,
    /// Start of this cell's particle range in the permutation array.
    pub body_start: u32,
    /// Number of particles in this cell's range.
    pub body_count: u32,
}

impl Node {
    /// Leaves carry particles directly; internal nodes delegate to children.
    pub fn is_leaf(&self) -> bool {
        self.child_count == 0
    }
}

/// Index-arena octree with bottom-up multipole moments.
#[derive(Debug)]
pub struct Octree {
    nodes: Vec<Node>,
    order: Vec<u32>,
    leaf_capacity: usize,
}

impl Octree {
    /// Create an empty tree. `leaf_capacity` bounds the particles per leaf.
    pub fn new(leaf_capacity: usize) -> Self {
        assert!(leaf_capacity >= 1, "leaf capacity must be at least 1");
        Self {
            nodes: Vec::new(),
            order: Vec::new(),
            leaf_capacity,
        }
    }

    /// The node arena; index 0 is the root when the tree is non-empty.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Permutation of particle indices; each leaf owns a contiguous range.
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    /// Number of particles the tree was built over.
    pub fn body_count(&self) -> usize {
        self.order.len()
    }

    /// Root node, if any particles were indexed.
    pub fn root(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Rebuild topology and moments from scratch over `bodies` (mass in `w`).
    pub fn rebuild(&mut self, bodies: &[Vec4]) {
        self.nodes.clear();
        self.order.clear();
        self.order.extend(0..bodies.len() as u32);
        if bodies.is_empty() {
            return;
        }

        let (center, half) = bounding_cube(bodies);
        self.nodes.push(blank_node(center, half, 0, bodies.len() as u32));
        let mut scratch = vec![0u32; bodies.len()];
        self.split(0, 0, bodies.len(), center, half, 0, bodies, &mut scratch);
        self.refresh_moments(bodies);
    }

    /// Recompute mass and center of mass for the existing topology.
    ///
    /// Used on steps between full rebuilds, after particles have drifted but
    /// before drift invalidates the spatial sorting enough to matter. The
    /// caller must pass the same number of bodies the tree was built over.
    pub fn refresh_moments(&mut self, bodies: &[Vec4]) {
        assert_eq!(
            bodies.len(),
            self.order.len(),
            "moment refresh requires unchanged particle count"
        );
        // Children always follow their parent in the arena, so a reverse
        // sweep sees every child before its parent.
        for idx in (0..self.nodes.len()).rev() {
            let node = self.nodes[idx];
            let mut mass = 0.0f32;
            let mut com = [0.0f32; 3];
            if node.is_leaf() {
                let start = node.body_start as usize;
                let end = start + node.body_count as usize;
                for &b in &self.order[start..end] {
                    let p = bodies[b as usize];
                    mass += p.w;
                    com[0] += p.w * p.x;
                    com[1] += p.w * p.y;
                    com[2] += p.w * p.z;
                }
            } else {
                let first = node.first_child as usize;
                for child in &self.nodes[first..first + node.child_count as usize] {
                    mass += child.mass;
                    com[0] += child.mass * child.com[0];
                    com[1] += child.mass * child.com[1];
                    com[2] += child.mass * child.com[2];
                }
            }
            if mass > 0.0 {
                com[0] /= mass;
                com[1] /= mass;
                com[2] /= mass;
            } else {
                com = node.center;
            }
            self.nodes[idx].mass = mass;
            self.nodes[idx].com = com;
        }
    }

    /// Coarse aggregate view of the tree: every node at `max_depth`, plus
    /// leaves above it, as point masses (center of mass, mass in `w`).
    /// These are the aggregates exported to remote evaluators.
    pub fn coarse_moments(&self, max_depth: u32) -> Vec<Vec4> {
        let mut out = Vec::new();
        if self.nodes.is_empty() {
            return out;
        }
        let mut stack = vec![(0u32, 0u32)];
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx as usize];
            if node.mass <= 0.0 {
                continue;
            }
            if node.is_leaf() || depth >= max_depth {
                out.push(Vec4::new(node.com[0], node.com[1], node.com[2], node.mass));
            } else {
                for c in 0..node.child_count as u32 {
                    stack.push((node.first_child + c, depth + 1));
                }
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn split(
        &mut self,
        idx: usize,
        start: usize,
        end: usize,
        center: [f32; 3],
        half: f32,
        depth: u32,
        bodies: &[Vec4],
        scratch: &mut [u32],
    ) {
        let count = end - start;
        if count <= self.leaf_capacity || depth >= MAX_DEPTH {
            return;
        }

        // Bucket the range into octants, stable, via the scratch buffer.
        let mut counts = [0usize; 8];
        for &b in &self.order[start..end] {
            counts[octant(&bodies[b as usize], &center)] += 1;
        }
        let mut offsets = [0usize; 8];
        let mut acc = 0;
        for (o, c) in counts.iter().enumerate() {
            offsets[o] = acc;
            acc += c;
        }
        let mut cursors = offsets;
        for &b in &self.order[start..end] {
            let o = octant(&bodies[b as usize], &center);
            scratch[cursors[o]] = b;
            cursors[o] += 1;
        }
        self.order[start..end].copy_from_slice(&scratch[..count]);

        // Reserve the child block contiguously, then recurse into each slot.
        let first_child = self.nodes.len();
        let quarter = half * 0.5;
        let mut slots: Vec<(usize, usize, usize, [f32; 3])> = Vec::new();
        for o in 0..8 {
            if counts[o] == 0 {
                continue;
            }
            let child_center = [
                center[0] + quarter * if o & 1 != 0 { 1.0 } else { -1.0 },
                center[1] + quarter * if o & 2 != 0 { 1.0 } else { -1.0 },
                center[2] + quarter * if o & 4 != 0 { 1.0 } else { -1.0 },
            ];
            let child_start = start + offsets[o];
            let node_idx = self.nodes.len();
            self.nodes
                .push(blank_node(child_center, quarter, child_start as u32, counts[o] as u32));
            slots.push((node_idx, child_start, child_start + counts[o], child_center));
        }
        self.nodes[idx].first_child = first_child as u32;
        self.nodes[idx].child_count = slots.len() as u8;

        for (node_idx, s, e, c) in slots {
            self.split(node_idx, s, e, c, quarter, depth + 1, bodies, scratch);
        }
    }
}

fn blank_node(center: [f32; 3], half: f32, body_start: u32, body_count: u32) -> Node {
    Node {
        center,
        half,
        mass: 0.0,
        com: center,
        first_child: 0,
        child_count: 0,
        body_start,
        body_count,
    }
}

fn octant(p: &Vec4, center: &[f32; 3]) -> usize {
    (usize::from(p.x >= center[0]))
        | (usize::from(p.y >= center[1]) << 1)
        | (usize::from(p.z >= center[2]) << 2)
}

/// Smallest cube enclosing all bodies, slightly inflated so boundary
/// particles fall strictly inside.
fn bounding_cube(bodies: &[Vec4]) -> ([f32; 3], f32) {
    let mut lo = [f32::INFINITY; 3];
    let mut hi = [f32::NEG_INFINITY; 3];
    for p in bodies {
        lo[0] = lo[0].min(p.x);
        lo[1] = lo[1].min(p.y);
        lo[2] = lo[2].min(p.z);
        hi[0] = hi[0].max(p.x);
        hi[1] = hi[1].max(p.y);
        hi[2] = hi[2].max(p.z);
    }
    let center = [
        0.5 * (lo[0] + hi[0]),
        0.5 * (lo[1] + hi[1]),
        0.5 * (lo[2] + hi[2]),
    ];
    let extent = (hi[0] - lo[0]).max(hi[1] - lo[1]).max(hi[2] - lo[2]);
    let half = (0.5 * extent * 1.0001).max(1e-6);
    (center, half)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_bodies(n_per_axis: usize) -> Vec<Vec4> {
        let mut bodies = Vec::new();
        for i in 0..n_per_axis {
            for j in 0..n_per_axis {
                for k in 0..n_per_axis {
                    bodies.push(Vec4::new(i as f32, j as f32, k as f32, 1.0));
                }
            }
        }
        bodies
    }

    #[test]
    fn empty_tree_has_no_root() {
        let mut tree = Octree::new(8);
        tree.rebuild(&[]);
        assert!(tree.root().is_none());
        assert!(tree.coarse_moments(2).is_empty());
    }

    #[test]
    fn root_moments_match_totals() {
        let bodies = grid_bodies(4);
        let mut tree = Octree::new(4);
        tree.rebuild(&bodies);
        let root = tree.root().expect("non-empty tree has a root");
        assert_eq!(root.body_count as usize, bodies.len());
        assert!((root.mass - bodies.len() as f32).abs() < 1e-3);
        // Uniform grid: center of mass at the geometric center.
        for axis in 0..3 {
            assert!(
                (root.com[axis] - 1.5).abs() < 1e-4,
                "axis {} com {} expected 1.5",
                axis,
                root.com[axis]
            );
        }
    }

    #[test]
    fn order_is_a_permutation() {
        let bodies = grid_bodies(3);
        let mut tree = Octree::new(2);
        tree.rebuild(&bodies);
        let mut seen = vec![false; bodies.len()];
        for &b in tree.order() {
            assert!(!seen[b as usize], "index {} appears twice", b);
            seen[b as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn leaves_respect_capacity() {
        let bodies = grid_bodies(4);
        let mut tree = Octree::new(4);
        tree.rebuild(&bodies);
        for node in tree.nodes() {
            if node.is_leaf() {
                assert!(node.body_count <= 4, "leaf holds {} bodies", node.body_count);
            }
        }
    }

    #[test]
    fn refresh_tracks_moved_masses() {
        let mut bodies = grid_bodies(2);
        let mut tree = Octree::new(1);
        tree.rebuild(&bodies);
        for p in &mut bodies {
            p.x += 0.25;
        }
        tree.refresh_moments(&bodies);
        let root = tree.root().unwrap();
        assert!((root.com[0] - 0.75).abs() < 1e-4);
        assert!((root.mass - bodies.len() as f32).abs() < 1e-4);
    }

    #[test]
    fn coincident_particles_terminate() {
        let bodies = vec![Vec4::new(0.5, 0.5, 0.5, 1.0); 64];
        let mut tree = Octree::new(1);
        tree.rebuild(&bodies);
        let root = tree.root().unwrap();
        assert_eq!(root.body_count, 64);
    }

    #[test]
    fn coarse_moments_conserve_mass() {
        let bodies = grid_bodies(4);
        let mut tree = Octree::new(2);
        tree.rebuild(&bodies);
        for depth in 0..4 {
            let total: f32 = tree.coarse_moments(depth).iter().map(|m| m.w).sum();
            assert!(
                (total - bodies.len() as f32).abs() < 1e-3,
                "depth {} lost mass: {}",
                depth,
                total
            );
        }
    }
}
