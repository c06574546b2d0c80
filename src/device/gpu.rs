use std::{mem, sync::Arc};

use bytemuck::{Pod, Zeroable};
use wgpu::*;

use crate::{
    error::{Error, Result},
    metadata::UnitCapacity,
};

use super::{check_transfer, readback::Readback, BufferName, DevicePool, Program};

const WORKGROUP_SIZE: u32 = 64;

/// An open handle to a GPU.
pub struct Gpu {
    pub(crate) device: Arc<Device>,
    pub(crate) queue: Arc<Queue>,
}

impl Gpu {
    pub fn device_descriptor(adapter_limits: &Limits) -> DeviceDescriptor<'static> {
        DeviceDescriptor {
            label: Some("jpegpool"),
            features: Features::PUSH_CONSTANTS,
            limits: Limits {
                max_push_constant_size: mem::size_of::<Params>() as u32,
                max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                max_buffer_size: adapter_limits.max_buffer_size,
                ..Default::default()
            },
        }
    }

    pub async fn open() -> Result<Self> {
        let instance = Instance::new(InstanceDescriptor {
            // The OpenGL backend has no push constant support in compute shaders.
            backends: Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&RequestAdapterOptions::default())
            .await
            .ok_or_else(|| Error::device("no supported graphics adapter found"))?;
        log::info!("using adapter {:?}", adapter.get_info().name);
        let (device, queue) = adapter
            .request_device(&Self::device_descriptor(&adapter.limits()), None)
            .await
            .map_err(|e| Error::device(format!("no supported graphics device found: {e}")))?;

        Ok(Self::from_wgpu(device.into(), queue.into()))
    }

    pub fn from_wgpu(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self { device, queue }
    }

    /// Runs `f` inside a validation error scope and turns any captured error into a device error.
    fn scoped<R>(&self, what: &str, f: impl FnOnce() -> R) -> Result<R> {
        self.device.push_error_scope(ErrorFilter::Validation);
        let result = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(Error::device(format!("{what}: {e}"))),
            None => Ok(result),
        }
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Params {
    groups_per_unit: u32,
    total_groups: u32,
}

/// A device pool whose units are slices of GPU storage buffers.
///
/// Each named buffer is one storage buffer covering all units back to back. [`DevicePool::run`]
/// dispatches one shader invocation per quad-group of the whole pool.
pub struct GpuPool {
    gpu: Arc<Gpu>,
    units: usize,
    capacity: UnitCapacity,
    metadata: Buffer,
    mcus: Buffer,
    bind_group_layout: BindGroupLayout,
    bind_group: BindGroup,
    pipeline: Option<ComputePipeline>,
    readback: Readback,
}

impl GpuPool {
    pub fn new(gpu: Arc<Gpu>, units: usize, capacity: UnitCapacity) -> Result<Self> {
        if units == 0 {
            return Err(Error::device("cannot allocate a pool of 0 units"));
        }
        let total_groups = units * capacity.quad_groups();
        let workgroups = (total_groups + WORKGROUP_SIZE as usize - 1) / WORKGROUP_SIZE as usize;
        let limits = gpu.device.limits();
        if workgroups > limits.max_compute_workgroups_per_dimension as usize {
            return Err(Error::device(format!(
                "{units} units of {} quad-groups exceed the dispatch limit",
                capacity.quad_groups()
            )));
        }
        let mcus_size = (units * BufferName::Mcus.unit_bytes(capacity)) as u64;
        if mcus_size > u64::from(limits.max_storage_buffer_binding_size) {
            return Err(Error::device(format!(
                "coefficient buffer of {mcus_size} bytes exceeds the device limit of {} bytes",
                limits.max_storage_buffer_binding_size
            )));
        }
        log::debug!(
            "allocating {} GPU units of {} macroblocks ({} bytes of coefficients)",
            units,
            capacity.macroblocks(),
            mcus_size
        );

        let metadata = gpu.device.create_buffer(&BufferDescriptor {
            label: Some(BufferName::Metadata.as_str()),
            size: (units * BufferName::Metadata.unit_bytes(capacity)) as u64,
            usage: BufferUsages::COPY_DST | BufferUsages::COPY_SRC | BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let mcus = gpu.device.create_buffer(&BufferDescriptor {
            label: Some(BufferName::Mcus.as_str()),
            size: mcus_size,
            usage: BufferUsages::COPY_DST | BufferUsages::COPY_SRC | BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let bind_group_layout = gpu
            .device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("pool_bind_group_layout"),
                entries: &[
                    // `metadata`
                    BindGroupLayoutEntry {
                        binding: 0,
                        visibility: ShaderStages::COMPUTE,
                        ty: BindingType::Buffer {
                            ty: BufferBindingType::Storage { read_only: true },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    // `mcus`
                    BindGroupLayoutEntry {
                        binding: 1,
                        visibility: ShaderStages::COMPUTE,
                        ty: BindingType::Buffer {
                            ty: BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });
        let bind_group = gpu.device.create_bind_group(&BindGroupDescriptor {
            label: Some("pool_bind_group"),
            layout: &bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: metadata.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: mcus.as_entire_binding(),
                },
            ],
        });
        let readback = Readback::new(&gpu, mcus_size.max(metadata.size()));

        Ok(Self {
            gpu,
            units,
            capacity,
            metadata,
            mcus,
            bind_group_layout,
            bind_group,
            pipeline: None,
            readback,
        })
    }

    fn buffer(&self, name: BufferName) -> &Buffer {
        match name {
            BufferName::Metadata => &self.metadata,
            BufferName::Mcus => &self.mcus,
        }
    }
}

impl DevicePool for GpuPool {
    fn unit_count(&self) -> usize {
        self.units
    }

    fn unit_capacity(&self) -> UnitCapacity {
        self.capacity
    }

    fn load_program(&mut self, program: &Program) -> Result<()> {
        let device = &self.gpu.device;
        let layout = &self.bind_group_layout;
        let pipeline = self.gpu.scoped("failed to load program", || {
            let shader = device.create_shader_module(ShaderModuleDescriptor {
                label: Some(program.label()),
                source: ShaderSource::Wgsl(program.source().into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some("pool_pipeline_layout"),
                bind_group_layouts: &[layout],
                push_constant_ranges: &[PushConstantRange {
                    stages: ShaderStages::COMPUTE,
                    range: 0..mem::size_of::<Params>() as u32,
                }],
            });
            device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(program.label()),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Program::ENTRY_POINT,
            })
        })?;
        log::debug!("loaded program '{}'", program.label());
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn copy_to_device(&mut self, buffer: BufferName, units: &[&[u8]]) -> Result<()> {
        check_transfer(&*self, buffer, units.iter().map(|u| u.len()))?;
        let target = self.buffer(buffer);
        let stride = buffer.unit_bytes(self.capacity) as u64;
        self.gpu.scoped("host to device copy failed", || {
            for (i, unit) in units.iter().enumerate() {
                self.gpu.queue.write_buffer(target, i as u64 * stride, unit);
            }
        })
    }

    fn run(&mut self) -> Result<()> {
        let Some(pipeline) = &self.pipeline else {
            return Err(Error::device("no program loaded"));
        };

        let params = Params {
            groups_per_unit: self.capacity.quad_groups() as u32,
            total_groups: (self.units * self.capacity.quad_groups()) as u32,
        };
        let workgroups = (params.total_groups + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
        log::trace!(
            "dispatching {} workgroups ({} quad-groups)",
            workgroups,
            params.total_groups
        );

        self.gpu.scoped("program execution failed", || {
            let mut enc = self
                .gpu
                .device
                .create_command_encoder(&CommandEncoderDescriptor::default());
            let mut compute = enc.begin_compute_pass(&ComputePassDescriptor::default());
            compute.set_pipeline(pipeline);
            compute.set_bind_group(0, &self.bind_group, &[]);
            compute.set_push_constants(0, bytemuck::bytes_of(&params));
            compute.dispatch_workgroups(workgroups, 1, 1);
            drop(compute);
            self.gpu.queue.submit([enc.finish()]);
            self.gpu.device.poll(Maintain::Wait);
        })
    }

    fn copy_from_device(&mut self, buffer: BufferName, units: &mut [&mut [u8]]) -> Result<()> {
        check_transfer(&*self, buffer, units.iter().map(|u| u.len()))?;
        let stride = buffer.unit_bytes(self.capacity);
        let mapped = self.readback.download(&self.gpu, self.buffer(buffer))?;
        for (dest, src) in units.iter_mut().zip(mapped.chunks_exact(stride)) {
            dest.copy_from_slice(src);
        }
        Ok(())
    }
}
