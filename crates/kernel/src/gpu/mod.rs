//! GPU (Metal/Vulkan via wgpu) implementation of the gravity kernel.
//!
//! `GpuKernel` implements `GravityKernel` with a direct-summation compute
//! shader over the mirrored particle store. Local bodies are uploaded at
//! rebuild; remote import aggregates are appended device-to-device behind
//! the local block so one dispatch covers both source populations.
//!
//! # Bind group layout
//! - Group 0: params (uniform) + bodies (read) + accelerations (read_write)

pub mod buffers;

use buffers::MirroredBuffer;
use wgpu::util::DeviceExt;

use crate::force::{octant_moments, EvalStats};
use crate::particle::Vec4;
use crate::GravityKernel;

/// Uniform parameters for the gravity shader. Must match the `Params`
/// struct in `shaders/gravity.wgsl` exactly.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GravityParams {
    n_targets: u32,
    n_sources: u32,
    softening2: f32,
    _pad: u32,
}

/// Error returned when GPU initialization fails.
#[derive(Debug)]
pub struct GpuInitError(pub String);

impl std::fmt::Display for GpuInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GPU initialization failed: {}", self.0)
    }
}

impl std::error::Error for GpuInitError {}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

/// GPU-accelerated gravity kernel using a wgpu compute shader.
pub struct GpuKernel {
    device: wgpu::Device,
    queue: wgpu::Queue,

    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,

    /// Local bodies plus, transiently, appended import aggregates.
    bodies: MirroredBuffer,
    /// Staging area for import uploads, source of the device append.
    imports: MirroredBuffer,
    /// Accelerations, written by the shader and read back per evaluation.
    acc: MirroredBuffer,

    softening: f32,
    workgroup_size: u32,
}

impl GpuKernel {
    /// Create a GPU gravity kernel.
    ///
    /// Returns `Err(GpuInitError)` if no suitable adapter is found, allowing
    /// callers to fall back to `CpuKernel`.
    pub fn new(softening: f32) -> Result<Self, GpuInitError> {
        // --- Device initialization ---
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GpuInitError("No suitable GPU adapter found".into()))?;

        tracing::info!("GPU adapter: {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gravity_gpu_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| GpuInitError(format!("Failed to create device: {e}")))?;

        // --- Shader and pipeline ---
        let workgroup_size = 256u32;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("gravity"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/gravity.wgsl").into()),
        });

        let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gravity_bgl"),
            entries: &[
                bgl_uniform(0),    // params
                bgl_storage_ro(1), // bodies
                bgl_storage_rw(2), // acc
            ],
        });
        let pl_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("gravity_pl"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("gravity"),
            layout: Some(&pl_layout),
            module: &shader,
            entry_point: Some("compute_gravity"),
            compilation_options: Default::default(),
            cache: None,
        });

        let params = GravityParams {
            n_targets: 0,
            n_sources: 0,
            softening2: softening * softening,
            _pad: 0,
        };
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gravity_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let bodies = MirroredBuffer::new(&device, "bodies", Vec::new());
        let imports = MirroredBuffer::new(&device, "imports", Vec::new());
        let acc = MirroredBuffer::new(&device, "acc", Vec::new());

        Ok(Self {
            device,
            queue,
            pipeline,
            bgl,
            params_buffer,
            bodies,
            imports,
            acc,
            softening,
            workgroup_size,
        })
    }

    /// The mirrored body store, exposed for transfer-discipline tests.
    pub fn bodies(&self) -> &MirroredBuffer {
        &self.bodies
    }
}

impl GravityKernel for GpuKernel {
    fn rebuild(&mut self, bodies: &[Vec4]) {
        self.bodies.discard_device();
        {
            let host = self.bodies.host_mut();
            host.clear();
            host.extend_from_slice(bodies);
        }
        self.bodies.to_device(&self.device, &self.queue);

        self.acc.discard_device();
        self.acc.host_mut().resize(bodies.len(), Vec4::ZERO);
        self.acc.ensure_capacity(&self.device, bodies.len());
    }

    fn refresh_moments(&mut self, bodies: &[Vec4]) {
        // Direct summation keeps no topology; a refresh is a re-upload.
        self.rebuild(bodies);
    }

    fn evaluate(&mut self, imports: &[Vec4], out: &mut [Vec4]) -> EvalStats {
        let n = self.bodies.len();
        assert_eq!(out.len(), n, "output slice must match body count");
        if n == 0 {
            return EvalStats::default();
        }

        // Stage imports and make room for them behind the local block.
        self.imports.discard_device();
        {
            let host = self.imports.host_mut();
            host.clear();
            host.extend_from_slice(imports);
        }
        self.imports.to_device(&self.device, &self.queue);
        let n_sources = n + imports.len();
        self.bodies.ensure_capacity(&self.device, n_sources);
        self.bodies.to_device(&self.device, &self.queue);

        let params = GravityParams {
            n_targets: n as u32,
            n_sources: n_sources as u32,
            softening2: self.softening * self.softening,
            _pad: 0,
        };
        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gravity_bg"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.bodies.raw().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.acc.raw().as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gravity_step"),
            });
        if !imports.is_empty() {
            // Device-to-device append of the import block at offset n.
            self.bodies
                .copy_from_device(&mut encoder, &self.imports, imports.len(), n);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("gravity"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dispatch_size(n as u32, self.workgroup_size), 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        self.acc.mark_device_written(n);
        self.acc.to_host(&self.device, &self.queue);
        out.copy_from_slice(self.acc.host());

        // The appended import block was scratch; the host copy of the local
        // bodies stays authoritative.
        self.bodies.discard_device();

        EvalStats {
            node_interactions: (n as u64) * (imports.len() as u64),
            leaf_interactions: (n as u64) * (n as u64 - 1),
        }
    }

    fn export_moments(&self, _max_depth: u32) -> Vec<Vec4> {
        octant_moments(self.bodies.host())
    }

    fn body_count(&self) -> usize {
        self.bodies.len()
    }
}

fn dispatch_size(n: u32, workgroup_size: u32) -> u32 {
    n.div_ceil(workgroup_size)
}

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
