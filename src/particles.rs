//! Particles
//!
//! Double-buffered GPU particle storage with host-side emission.
//!
//! Emission only samples particles on the host. The next frame to record,
//! after its slot's fence has signalled, writes them into that slot's staging
//! buffer and appends them to the input buffer; the resident range is then
//! carried over to the output buffer and the two storage buffers swap roles. Simulation and drawing are not part of the frame graph
//! yet; the buffers are laid out for a compute step that reads the input and
//! writes the output.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::errors::Result;
use crate::gpu::{BufferDesc, BufferHandle, CommandRecorder, GpuDevice};

const EMISSION_SEED: u64 = 0x5EED_0F_E4B3;

/// One particle as laid out in the storage buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuParticle {
    pub position: [f32; 3],
    pub size: f32,
    pub color: [f32; 4],
    pub direction: [f32; 3],
    pub speed: f32,
    pub duration: f32,
    pub _pad: [f32; 3],
}

pub const GPU_PARTICLE_SIZE: u64 = std::mem::size_of::<GpuParticle>() as u64;

/// Ranges sampled uniformly for every emitted particle.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleEmitter {
    pub number: u32,
    pub position_range: [Vec3; 2],
    pub size_range: [f32; 2],
    pub color_range: [Vec4; 2],
    /// Pitch (x) and yaw (y) offsets in radians applied to `base_direction`.
    pub rotation_range: [Vec3; 2],
    pub base_direction: Vec3,
    pub speed_range: [f32; 2],
    pub duration_range: [f32; 2],
}

impl Default for ParticleEmitter {
    fn default() -> Self {
        Self {
            number: 0,
            position_range: [Vec3::ZERO; 2],
            size_range: [1.0; 2],
            color_range: [Vec4::ONE; 2],
            rotation_range: [Vec3::ZERO; 2],
            base_direction: Vec3::Y,
            speed_range: [1.0; 2],
            duration_range: [1.0; 2],
        }
    }
}

/// Rotates `base` by a pitch/yaw offset, returning a unit direction.
#[must_use]
pub fn rotated_direction(base: Vec3, rotation: Vec3) -> Vec3 {
    let base = base.normalize_or(Vec3::Y);
    let yaw = base.z.atan2(base.x);
    let pitch = -base.y.clamp(-1.0, 1.0).asin();
    let (p, y) = (pitch + rotation.x, yaw + rotation.y);
    Vec3::new(p.cos() * y.cos(), -p.sin(), p.cos() * y.sin()).normalize_or(base)
}

fn sample(rng: &mut StdRng, range: [f32; 2]) -> f32 {
    range[0] + (range[1] - range[0]) * rng.random_range(0.0..1.0f32)
}

fn sample_vec3(rng: &mut StdRng, range: [Vec3; 2]) -> Vec3 {
    Vec3::new(
        sample(rng, [range[0].x, range[1].x]),
        sample(rng, [range[0].y, range[1].y]),
        sample(rng, [range[0].z, range[1].z]),
    )
}

fn sample_vec4(rng: &mut StdRng, range: [Vec4; 2]) -> Vec4 {
    sample_vec3(rng, [range[0].truncate(), range[1].truncate()])
        .extend(sample(rng, [range[0].w, range[1].w]))
}

pub struct ParticleSubsystem {
    buffers: [BufferHandle; 2],
    input: usize,
    /// One host-visible staging buffer per frame slot.
    staging: Vec<BufferHandle>,
    /// Emitted since the last recorded frame, not yet on the device.
    pending: Vec<GpuParticle>,
    /// Particles already copied into the input buffer.
    resident: u32,
    capacity: u32,
    rng: StdRng,
}

impl ParticleSubsystem {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        capacity: u32,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let size = u64::from(capacity.max(1)) * GPU_PARTICLE_SIZE;
        let mut storage = |label: &str| {
            device.create_buffer(&BufferDesc {
                label,
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                host_visible: false,
            })
        };
        let buffers = [storage("Particle Buffer A")?, storage("Particle Buffer B")?];
        let staging = (0..frames_in_flight)
            .map(|_| {
                device.create_buffer(&BufferDesc {
                    label: "Particle Staging Buffer",
                    size,
                    usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::MAP_WRITE,
                    host_visible: true,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            buffers,
            input: 0,
            staging,
            pending: Vec::new(),
            resident: 0,
            capacity,
            rng: StdRng::seed_from_u64(EMISSION_SEED),
        })
    }

    /// Generates `emitter.number` particles for the next recorded frame.
    /// Returns how many were accepted; the rest exceed capacity.
    pub fn emit(&mut self, emitter: &ParticleEmitter) -> u32 {
        let free = self.capacity - self.reserved();
        let count = emitter.number.min(free);
        if count < emitter.number {
            warn!(
                "Particle capacity {} reached; dropping {} of {} particles",
                self.capacity,
                emitter.number - count,
                emitter.number
            );
        }
        for _ in 0..count {
            let particle = self.generate(emitter);
            self.pending.push(particle);
        }
        count
    }

    fn generate(&mut self, emitter: &ParticleEmitter) -> GpuParticle {
        let rng = &mut self.rng;
        let position = sample_vec3(rng, emitter.position_range);
        let size = sample(rng, emitter.size_range);
        let color = sample_vec4(rng, emitter.color_range);
        let rotation = sample_vec3(rng, emitter.rotation_range);
        let speed = sample(rng, emitter.speed_range);
        let duration = sample(rng, emitter.duration_range);
        GpuParticle {
            position: position.to_array(),
            size,
            color: color.to_array(),
            direction: rotated_direction(emitter.base_direction, rotation).to_array(),
            speed,
            duration,
            _pad: [0.0; 3],
        }
    }

    /// Uploads pending particles through `slot`'s staging buffer and records
    /// their transfer. The slot's fence must already have been waited on.
    pub fn record<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        recorder: &mut CommandRecorder,
        slot: usize,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let staging = self.staging[slot];
        device.write_buffer(staging, 0, bytemuck::cast_slice(&self.pending))?;
        let staged = self.pending.len() as u32;
        self.pending.clear();

        let (input, output) = (self.buffers[self.input], self.buffers[1 - self.input]);
        recorder.copy_buffer(
            staging,
            0,
            input,
            u64::from(self.resident) * GPU_PARTICLE_SIZE,
            u64::from(staged) * GPU_PARTICLE_SIZE,
        );
        self.resident += staged;
        recorder.copy_buffer(input, 0, output, 0, u64::from(self.resident) * GPU_PARTICLE_SIZE);
        self.input = 1 - self.input;
        debug!("Staged {staged} particles ({} resident)", self.resident);
        Ok(())
    }

    #[must_use]
    pub fn input_buffer(&self) -> BufferHandle {
        self.buffers[self.input]
    }

    #[must_use]
    pub fn output_buffer(&self) -> BufferHandle {
        self.buffers[1 - self.input]
    }

    #[must_use]
    pub fn resident(&self) -> u32 {
        self.resident
    }

    /// Emitted particles waiting for the next recorded frame.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.len() as u32
    }

    /// Resident plus pending.
    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.resident + self.pending()
    }

    #[must_use]
    pub fn staging_buffer(&self, slot: usize) -> BufferHandle {
        self.staging[slot]
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for staging in self.staging {
            device.destroy_buffer(staging)?;
        }
        for buffer in self.buffers {
            device.destroy_buffer(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn particle_record_is_four_vec4() {
        assert_eq!(GPU_PARTICLE_SIZE, 64);
    }

    #[test]
    fn zero_rotation_keeps_base_direction() {
        for base in [Vec3::X, Vec3::Z, Vec3::new(1.0, 1.0, 0.0), Vec3::new(0.3, -0.4, 0.8)] {
            let d = rotated_direction(base, Vec3::ZERO);
            assert!((d - base.normalize()).length() < EPSILON, "{base} -> {d}");
        }
    }

    #[test]
    fn yaw_rotates_around_up() {
        let d = rotated_direction(Vec3::X, Vec3::new(0.0, std::f32::consts::FRAC_PI_2, 0.0));
        assert!((d - Vec3::Z).length() < EPSILON);
    }

    #[test]
    fn samples_stay_inside_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..256 {
            let v = sample(&mut rng, [2.0, 3.0]);
            assert!((2.0..=3.0).contains(&v));
        }
        assert_eq!(sample(&mut rng, [4.0, 4.0]), 4.0);
    }
}
