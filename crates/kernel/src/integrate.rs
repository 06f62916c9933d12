//! Predictor/corrector time integration.
//!
//! The predictor writes only the `ppos`/`pvel` mirrors; authoritative state
//! is committed by the corrector after the new accelerations are in. Running
//! the predictor twice with the same `dt` is harmless, which lets the engine
//! refresh mirrors for particles that migrated in mid-step.

use crate::particle::ParticleSet;

/// Second-order prediction of positions and first-order prediction of
/// velocities over `dt`, written into the mirrors. Mass and softening stay
/// packed in the `w` lanes.
pub fn predict(set: &mut ParticleSet, dt: f32) {
    let half_dt2 = 0.5 * dt * dt;
    for i in 0..set.len() {
        let p = set.pos[i];
        let v = set.vel[i];
        let a = set.acc0[i];
        set.ppos[i].x = p.x + v.x * dt + a.x * half_dt2;
        set.ppos[i].y = p.y + v.y * dt + a.y * half_dt2;
        set.ppos[i].z = p.z + v.z * dt + a.z * half_dt2;
        set.ppos[i].w = p.w;
        set.pvel[i].x = v.x + a.x * dt;
        set.pvel[i].y = v.y + a.y * dt;
        set.pvel[i].z = v.z + a.z * dt;
        set.pvel[i].w = v.w;
    }
}

/// Commit the step: positions from the predicted mirrors, velocities from
/// the averaged-acceleration corrector, `acc1` rotated into `acc0`, and the
/// per-particle time state advanced to `t + dt`.
///
/// Each particle's next step size is adapted from `eta * sqrt(eps / |a|)`
/// clamped to `[dt_min, dt_max]`; the minimum over local particles is
/// returned so the caller can reduce it globally. An empty set yields
/// `dt_max`.
pub fn correct(
    set: &mut ParticleSet,
    t: f64,
    dt: f32,
    eta: f32,
    dt_min: f32,
    dt_max: f32,
) -> f32 {
    let half_dt = 0.5 * dt;
    let mut min_dt = dt_max;
    for i in 0..set.len() {
        let a0 = set.acc0[i];
        let a1 = set.acc1[i];
        set.pos[i] = set.ppos[i];
        set.vel[i].x += (a0.x + a1.x) * half_dt;
        set.vel[i].y += (a0.y + a1.y) * half_dt;
        set.vel[i].z += (a0.z + a1.z) * half_dt;

        let eps = set.vel[i].w;
        let a_mag = a1.norm2().sqrt();
        let dt_i = if a_mag > 0.0 && eps > 0.0 {
            (eta * (eps / a_mag).sqrt()).clamp(dt_min, dt_max)
        } else {
            dt_max
        };
        set.acc0[i] = a1;
        set.time[i] = [(t + dt as f64) as f32, dt_i];
        min_dt = min_dt.min(dt_i);
    }
    min_dt
}
