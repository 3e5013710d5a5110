//! Particle record layout shared between host, compute and rasterizer.
//!
//! Every buffer in the handshake is an array of [`ParticleRecord`]s: four
//! packed `f32`s. Positions use `xyz` plus `w = 1`; velocities use `xyz`
//! plus the remaining life in `w`; colors are RGBA.

use bytemuck::{Pod, Zeroable};

/// Bytes per record.
pub const RECORD_SIZE: usize = std::mem::size_of::<ParticleRecord>();

/// Four packed single-precision values.
///
/// Layout must match `vec4<f32>` in WGSL storage and vertex buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleRecord {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl ParticleRecord {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }

    /// Bit-level equality (distinguishes `-0.0` from `0.0`, equal NaNs match).
    pub fn bits_eq(&self, other: &Self) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl From<[f32; 4]> for ParticleRecord {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Host-side particle state: three parallel record arrays.
///
/// Index `i` in every array refers to the same particle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleSet {
    /// Positions (`w` = 1).
    pub position: Vec<ParticleRecord>,
    /// Velocities (`w` = remaining life).
    pub velocity: Vec<ParticleRecord>,
    /// RGBA colors.
    pub color: Vec<ParticleRecord>,
}

impl ParticleSet {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            position: Vec::with_capacity(n),
            velocity: Vec::with_capacity(n),
            color: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    pub fn push(&mut self, position: ParticleRecord, velocity: ParticleRecord, color: ParticleRecord) {
        self.position.push(position);
        self.velocity.push(velocity);
        self.color.push(color);
    }
}

/// View records as raw bytes for upload.
pub fn as_bytes(records: &[ParticleRecord]) -> &[u8] {
    bytemuck::cast_slice(records)
}

/// Decode raw bytes into records. Trailing bytes short of a record are ignored.
pub fn from_bytes(bytes: &[u8]) -> Vec<ParticleRecord> {
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(bytemuck::pod_read_unaligned::<ParticleRecord>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_sixteen_bytes() {
        assert_eq!(RECORD_SIZE, 16);
        assert_eq!(std::mem::align_of::<ParticleRecord>(), 4);
    }

    #[test]
    fn test_byte_view_matches_field_order() {
        let recs = [ParticleRecord::new(1.0, 2.0, 3.0, 4.0)];
        let bytes = as_bytes(&recs);
        assert_eq!(&bytes[..4], &1.0f32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &4.0f32.to_ne_bytes());
        assert_eq!(from_bytes(bytes), recs.to_vec());
    }

    #[test]
    fn test_bits_eq_distinguishes_signed_zero() {
        let a = ParticleRecord::new(0.0, 0.0, 0.0, 0.0);
        let b = ParticleRecord::new(-0.0, 0.0, 0.0, 0.0);
        assert_eq!(a, b);
        assert!(!a.bits_eq(&b));
    }

    #[test]
    fn test_particle_set_parallel_arrays() {
        let mut set = ParticleSet::with_capacity(2);
        assert!(set.is_empty());
        set.push(ParticleRecord::default(), ParticleRecord::default(), ParticleRecord::default());
        assert_eq!(set.len(), 1);
        assert_eq!(set.velocity.len(), 1);
        assert_eq!(set.color.len(), 1);
    }
}
