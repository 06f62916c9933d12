//! Opening-angle behavior over a random particle cloud.
//!
//! Tightening theta must never decrease the total interaction count, and in
//! the limit theta -> 0 the tree walk degenerates to direct summation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kernel::{CpuKernel, GravityKernel, Vec4};

fn random_cloud(n: usize, seed: u64) -> Vec<Vec4> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vec4::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(0.5..1.5),
            )
        })
        .collect()
}

#[test]
fn interactions_monotonic_in_theta() {
    let bodies = random_cloud(500, 42);
    let softening = 0.05;

    let mut previous_total = 0u64;
    for &theta in &[1.2f32, 0.9, 0.6, 0.3, 0.05] {
        let mut kernel = CpuKernel::new(theta, softening, 8);
        kernel.rebuild(&bodies);
        let mut acc = vec![Vec4::ZERO; bodies.len()];
        let stats = kernel.evaluate(&[], &mut acc);
        let total = stats.total();
        println!(
            "theta={theta}: {} node + {} leaf = {} interactions",
            stats.node_interactions, stats.leaf_interactions, total
        );
        assert!(
            total >= previous_total,
            "theta={theta} produced {total} interactions, fewer than {previous_total} at a looser angle"
        );
        previous_total = total;
    }
}

#[test]
fn tight_theta_approaches_direct_summation() {
    let bodies = random_cloud(200, 7);
    let softening = 0.05;

    // Reference: exact direct summation, minus self-interaction.
    let mut direct = vec![Vec4::ZERO; bodies.len()];
    for (i, target) in bodies.iter().enumerate() {
        let mut a = Vec4::ZERO;
        for (j, source) in bodies.iter().enumerate() {
            if i == j {
                continue;
            }
            let dx = source.x - target.x;
            let dy = source.y - target.y;
            let dz = source.z - target.z;
            let r2 = dx * dx + dy * dy + dz * dz + softening * softening;
            let inv = 1.0 / r2.sqrt();
            let inv3 = inv * inv * inv;
            a.x += source.w * inv3 * dx;
            a.y += source.w * inv3 * dy;
            a.z += source.w * inv3 * dz;
            a.w -= source.w * inv;
        }
        direct[i] = a;
    }

    let mut kernel = CpuKernel::new(1e-3, softening, 1);
    kernel.rebuild(&bodies);
    let mut acc = vec![Vec4::ZERO; bodies.len()];
    kernel.evaluate(&[], &mut acc);

    for i in 0..bodies.len() {
        let err = ((acc[i].x - direct[i].x).powi(2)
            + (acc[i].y - direct[i].y).powi(2)
            + (acc[i].z - direct[i].z).powi(2))
        .sqrt();
        let scale = direct[i].norm2().sqrt().max(1e-3);
        assert!(
            err / scale < 1e-3,
            "particle {i}: tree acc deviates from direct by {err} (scale {scale})"
        );
    }
}

#[test]
fn loose_theta_stays_close_to_direct() {
    let bodies = random_cloud(300, 99);
    let softening = 0.05;

    let mut tight = CpuKernel::new(1e-3, softening, 1);
    tight.rebuild(&bodies);
    let mut reference = vec![Vec4::ZERO; bodies.len()];
    tight.evaluate(&[], &mut reference);

    let mut loose = CpuKernel::new(0.75, softening, 8);
    loose.rebuild(&bodies);
    let mut approx = vec![Vec4::ZERO; bodies.len()];
    loose.evaluate(&[], &mut approx);

    // Standard accuracy expectation for theta = 0.75: a few percent RMS.
    let mut rms = 0.0f64;
    for i in 0..bodies.len() {
        let num = reference[i].dist2(&approx[i]) as f64;
        let den = (reference[i].norm2() as f64).max(1e-12);
        rms += num / den;
    }
    rms = (rms / bodies.len() as f64).sqrt();
    println!("relative RMS force error at theta=0.75: {rms:.4}");
    assert!(rms < 0.05, "force error too large: {rms}");
}
