//! Two-body force checks against the closed-form softened kernel.
//!
//! Verifies the acceleration magnitude `m * d / (d^2 + eps^2)^(3/2)`,
//! Newton's 3rd law, and momentum conservation over a few integration
//! steps.

use kernel::{integrate, CpuKernel, GravityKernel, ParticleSet, Vec4};

/// Create two particles separated by `d` along the x-axis.
fn setup_two_bodies(d: f32, m0: f32, m1: f32, softening: f32) -> ParticleSet {
    let mut set = ParticleSet::new();
    set.push(
        Vec4::new(0.0, 0.0, 0.0, m0),
        Vec4::new(0.0, 0.0, 0.0, softening),
        0,
    );
    set.push(
        Vec4::new(d, 0.0, 0.0, m1),
        Vec4::new(0.0, 0.0, 0.0, softening),
        1,
    );
    set
}

#[test]
fn matches_closed_form() {
    let d = 2.0;
    let softening = 0.05;
    let set = setup_two_bodies(d, 1.5, 0.5, softening);

    let mut kernel = CpuKernel::new(0.75, softening, 8);
    kernel.rebuild(&set.ppos);
    let mut acc = vec![Vec4::ZERO; 2];
    kernel.evaluate(&[], &mut acc);

    let denom = (d * d + softening * softening).powf(1.5);
    let expected0 = 0.5 * d / denom;
    let expected1 = 1.5 * d / denom;

    assert!(
        (acc[0].x - expected0).abs() < 1e-6,
        "body 0: expected ax={expected0}, got {}",
        acc[0].x
    );
    assert!(
        (acc[1].x + expected1).abs() < 1e-6,
        "body 1: expected ax={}, got {}",
        -expected1,
        acc[1].x
    );
    // Off-axis components vanish by symmetry.
    assert!(acc[0].y.abs() < 1e-7 && acc[0].z.abs() < 1e-7);
}

#[test]
fn forces_equal_and_opposite() {
    let softening = 0.1;
    let set = setup_two_bodies(1.0, 2.0, 3.0, softening);

    let mut kernel = CpuKernel::new(0.75, softening, 8);
    kernel.rebuild(&set.ppos);
    let mut acc = vec![Vec4::ZERO; 2];
    kernel.evaluate(&[], &mut acc);

    // Newton's 3rd law: m0*a0 + m1*a1 = 0
    let fx = 2.0 * acc[0].x + 3.0 * acc[1].x;
    let fy = 2.0 * acc[0].y + 3.0 * acc[1].y;
    let fz = 2.0 * acc[0].z + 3.0 * acc[1].z;
    assert!(fx.abs() < 1e-5, "net x force {fx} should vanish");
    assert!(fy.abs() < 1e-5, "net y force {fy} should vanish");
    assert!(fz.abs() < 1e-5, "net z force {fz} should vanish");
}

#[test]
fn momentum_conserved_over_steps() {
    let softening = 0.05;
    let mut set = setup_two_bodies(1.0, 1.0, 1.0, softening);
    let mut kernel = CpuKernel::new(0.5, softening, 8);

    // Bootstrap acc0 from the initial configuration.
    kernel.rebuild(&set.ppos);
    let mut acc = vec![Vec4::ZERO; 2];
    kernel.evaluate(&[], &mut acc);
    set.acc0.copy_from_slice(&acc);

    let dt = 1.0 / 64.0;
    let mut t = 0.0f64;
    for _ in 0..20 {
        integrate::predict(&mut set, dt);
        kernel.rebuild(&set.ppos);
        kernel.evaluate(&[], &mut set.acc1);
        integrate::correct(&mut set, t, dt, 0.1, dt, dt);
        t += dt as f64;
    }

    let px: f32 = (0..2).map(|i| set.pos[i].w * set.vel[i].x).sum();
    let py: f32 = (0..2).map(|i| set.pos[i].w * set.vel[i].y).sum();
    let pz: f32 = (0..2).map(|i| set.pos[i].w * set.vel[i].z).sum();
    assert!(px.abs() < 1e-4, "px not conserved: {px}");
    assert!(py.abs() < 1e-4, "py not conserved: {py}");
    assert!(pz.abs() < 1e-4, "pz not conserved: {pz}");

    // The bodies should have fallen toward each other.
    assert!(
        set.pos[1].x - set.pos[0].x < 1.0,
        "separation should shrink, got {}",
        set.pos[1].x - set.pos[0].x
    );
}
