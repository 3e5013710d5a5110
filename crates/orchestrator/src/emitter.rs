//! Initial particle emission on a ring around the z axis.

use interop::{ParticleRecord, ParticleSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;

use crate::config::EmitterConfig;

/// Emit `count` particles.
///
/// Particle `i` sits at angle `2*pi*i/count` on the ring with a random radius
/// in `[radius[0], radius[1])`, `z = 0` and `w = 1`. Its velocity is the
/// configured initial velocity with a random remaining life in `[0, 1)` in
/// `w`. The same seed always produces the same set.
pub fn emit_ring(count: usize, config: &EmitterConfig) -> ParticleSet {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let [r_min, r_max] = config.radius;
    let [vx, vy, vz] = config.initial_velocity;
    let color = ParticleRecord::from(config.color);

    let mut set = ParticleSet::with_capacity(count);
    for i in 0..count {
        let angle = TAU * i as f32 / count as f32;
        let radius = rng.gen_range(r_min..r_max);
        let life = rng.gen_range(0.0..1.0f32);
        set.push(
            ParticleRecord::new(radius * angle.cos(), radius * angle.sin(), 0.0, 1.0),
            ParticleRecord::new(vx, vy, vz, life),
            color,
        );
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emission_is_deterministic_per_seed() {
        let config = EmitterConfig::default();
        let a = emit_ring(64, &config);
        let b = emit_ring(64, &config);
        assert_eq!(a, b);

        let other = emit_ring(64, &EmitterConfig { seed: 1, ..config });
        assert_ne!(a.position, other.position);
    }

    #[test]
    fn test_positions_lie_on_ring() {
        let config = EmitterConfig::default();
        let set = emit_ring(500, &config);
        assert_eq!(set.len(), 500);
        for p in &set.position {
            let r = (p.x * p.x + p.y * p.y).sqrt();
            assert!(r >= 0.2 - 1e-5 && r < 0.5 + 1e-5, "radius {r}");
            assert_eq!(p.z, 0.0);
            assert_eq!(p.w, 1.0);
        }
        // First particle is on the +x axis.
        assert!(set.position[0].y.abs() < 1e-6);
        assert!(set.position[0].x > 0.0);
    }

    #[test]
    fn test_velocity_and_color() {
        let set = emit_ring(100, &EmitterConfig::default());
        for (v, c) in set.velocity.iter().zip(&set.color) {
            assert_eq!([v.x, v.y, v.z], [0.0, 0.0, 3.0]);
            assert!((0.0..1.0).contains(&v.w));
            assert_eq!(c.to_array(), [1.0, 0.0, 0.0, 1.0]);
        }
    }
}
