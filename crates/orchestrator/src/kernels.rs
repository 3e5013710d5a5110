//! Built-in particle kernel.
//!
//! The WGSL source runs on wgpu; [`update_particles_host`] is the
//! equivalent body for the CPU reference backend, registered under the same
//! entry point name.

use interop::cpu::CpuArgs;
use interop::CpuBackend;

/// Entry point of the built-in kernel.
pub const UPDATE_PARTICLES: &str = "update_particles";

/// WGSL source of the built-in kernel.
pub const PARTICLES_WGSL: &str = include_str!("kernels/particles.wgsl");

/// Gravity along z (m/s^2).
pub const GRAVITY_Z: f32 = -9.8;

/// Argument slots of [`UPDATE_PARTICLES`].
#[allow(missing_docs)]
pub mod slot {
    pub const POSITION: u32 = 0;
    pub const COLOR: u32 = 1;
    pub const VELOCITY: u32 = 2;
    pub const SPAWN_POSITION: u32 = 3;
    pub const SPAWN_VELOCITY: u32 = 4;
    pub const TIME_STEP: u32 = 5;
}

/// Host twin of `update_particles` for one particle.
pub fn update_particles_host(gid: usize, args: &mut CpuArgs) {
    let dt = args.scalar_f32(slot::TIME_STEP);
    let mut p = args.vec4(slot::POSITION, gid);
    let mut v = args.vec4(slot::VELOCITY, gid);
    let mut life = v[3] - dt;

    if life <= 0.0 {
        p = args.vec4(slot::SPAWN_POSITION, gid);
        v = args.vec4(slot::SPAWN_VELOCITY, gid);
        life = 1.0;
    }

    v[2] += GRAVITY_Z * dt;
    p[0] += v[0] * dt;
    p[1] += v[1] * dt;
    p[2] += v[2] * dt;
    v[3] = life;

    let mut c = args.vec4(slot::COLOR, gid);
    c[3] = life;

    args.set_vec4(slot::POSITION, gid, p);
    args.set_vec4(slot::VELOCITY, gid, v);
    args.set_vec4(slot::COLOR, gid, c);
}

/// Register every built-in kernel on a CPU backend.
pub fn register_cpu_kernels(backend: &mut CpuBackend) {
    backend.register_kernel(UPDATE_PARTICLES, update_particles_host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop::{reflect_wgsl, ArgKind, ScalarType};

    #[test]
    fn test_builtin_kernel_reflects_six_slots() {
        let info = reflect_wgsl(PARTICLES_WGSL).unwrap();
        let entry = info.entry_point(UPDATE_PARTICLES).unwrap();
        let slots: Vec<u32> = entry.args.iter().map(|a| a.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);

        assert_eq!(entry.arg(slot::POSITION).unwrap().kind, ArgKind::Buffer { writable: true });
        assert_eq!(entry.arg(slot::SPAWN_POSITION).unwrap().kind, ArgKind::Buffer { writable: false });
        assert_eq!(entry.arg(slot::TIME_STEP).unwrap().kind, ArgKind::Scalar(ScalarType::F32));
    }
}
