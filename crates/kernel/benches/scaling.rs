//! Tree-walk scaling -- interaction counts and wall time across particle
//! counts and opening angles.
//!
//! Run with: cargo bench -p nbody-kernel --bench scaling

use std::time::Instant;

use kernel::{CpuKernel, GravityKernel, Vec4};

fn centrally_condensed_cloud(n: usize) -> Vec<Vec4> {
    // Deterministic cloud, denser toward the center.
    let mut bodies = Vec::with_capacity(n);
    let mut state = 0x9e3779b97f4a7c15u64;
    let mut next = || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 11) as f32 / (1u64 << 53) as f32 * 2.0 - 1.0
    };
    for _ in 0..n {
        let (x, y, z) = (next(), next(), next());
        let shrink = 0.2 + 0.8 * (x * x + y * y + z * z);
        bodies.push(Vec4::new(x * shrink, y * shrink, z * shrink, 1.0 / n as f32));
    }
    bodies
}

fn main() {
    println!(
        "{:>10} {:>6} {:>12} {:>12} {:>10} {:>12}",
        "n", "theta", "node_int", "leaf_int", "ms/eval", "int/body"
    );

    for &n in &[1_000usize, 10_000, 50_000, 200_000] {
        let bodies = centrally_condensed_cloud(n);
        for &theta in &[0.5f32, 0.75, 1.0] {
            let mut kernel = CpuKernel::new(theta, 0.05, 16);
            kernel.rebuild(&bodies);
            let mut acc = vec![Vec4::ZERO; n];

            // Warmup
            kernel.evaluate(&[], &mut acc);

            let reps = if n <= 10_000 { 5 } else { 2 };
            let start = Instant::now();
            let mut stats = kernel.evaluate(&[], &mut acc);
            for _ in 1..reps {
                stats = kernel.evaluate(&[], &mut acc);
            }
            let ms = start.elapsed().as_secs_f64() * 1000.0 / reps as f64;

            println!(
                "{:>10} {:>6.2} {:>12} {:>12} {:>10.2} {:>12.1}",
                n,
                theta,
                stats.node_interactions,
                stats.leaf_interactions,
                ms,
                stats.total() as f64 / n as f64
            );
        }
    }
}
