//! GPU implementation of [`ComputeBackend`] built on [`wgpu`].
//!
//! Programs are compiled from WGSL at runtime. Storage buffers live on the
//! device for as long as their handle does. Dispatches are recorded into a
//! command encoder that is submitted on the next barrier, upload, read or
//! draw, so writes are always ordered behind the work that precedes them.
//! Initialization fails if no compatible adapter is found.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use wgpu::util::DeviceExt;

use crate::backend::{
    BufferHandle, BufferUsage, ComputeBackend, ContextId, DeviceLimits, DispatchCall, ProgramDesc,
    ProgramHandle, ShaderLanguage, ShaderSource,
};
use crate::layout::{self, Access};
use crate::{ComputeError, Kernel, PointVertex};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1 << 32);

const FRAME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct ComputeProgram {
    kernel: Kernel,
    pipeline: wgpu::ComputePipeline,
    storage_layout: wgpu::BindGroupLayout,
    uniform_layout: Option<wgpu::BindGroupLayout>,
}

enum GpuProgram {
    Compute(ComputeProgram),
    Points(wgpu::RenderPipeline),
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

/// GPU-backed implementation of [`ComputeBackend`] built on `wgpu`.
pub struct WgpuBackend {
    id: ContextId,
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: HashMap<BufferHandle, GpuBuffer>,
    programs: HashMap<ProgramHandle, GpuProgram>,
    next_handle: u64,
    encoder: Option<wgpu::CommandEncoder>,
    frame: Option<(wgpu::Texture, u32, u32)>,
    viewport: (u32, u32),
}

impl WgpuBackend {
    /// Creates a backend on the system's default high-performance GPU.
    pub fn try_new() -> Result<Self, ComputeError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or(ComputeError::BackendUnavailable)?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("ssbo device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|e| {
            tracing::warn!("request_device failed: {e}");
            ComputeError::BackendUnavailable
        })?;

        let info = adapter.get_info();
        tracing::info!("wgpu adapter: {} ({:?})", info.name, info.backend);

        Ok(Self {
            id: ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)),
            device,
            queue,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            next_handle: 0,
            encoder: None,
            frame: None,
            viewport: (1, 1),
        })
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer, ComputeError> {
        self.buffers
            .get(&handle)
            .ok_or(ComputeError::UnknownBuffer(handle))
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("ssbo commands"),
                })
        })
    }

    /// Submits everything recorded so far.
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
    }

    fn module(&self, source: &ShaderSource) -> Result<wgpu::ShaderModule, String> {
        if source.language != ShaderLanguage::Wgsl {
            return Err(format!(
                "{:?} sources are not supported by the wgpu backend",
                source.language
            ));
        }
        Ok(self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&source.name),
                source: wgpu::ShaderSource::Wgsl(source.text.as_str().into()),
            }))
    }

    fn compute_program(
        &self,
        kernel: Kernel,
        source: &ShaderSource,
    ) -> Result<ComputeProgram, String> {
        let module = self.module(source)?;
        let storage_entries: Vec<_> = layout::bindings(&kernel)
            .iter()
            .map(|decl| wgpu::BindGroupLayoutEntry {
                binding: decl.slot,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: decl.access == Access::ReadOnly,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let storage_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("storage slots"),
                entries: &storage_entries,
            });

        let uniform_layout = (!layout::uniforms(&kernel).is_empty()).then(|| {
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("uniform block"),
                    entries: &[wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    }],
                })
        });

        let mut groups = vec![&storage_layout];
        groups.extend(uniform_layout.as_ref());
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(kernel.name()),
                bind_group_layouts: &groups,
                push_constant_ranges: &[],
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.name()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });

        Ok(ComputeProgram {
            kernel,
            pipeline,
            storage_layout,
            uniform_layout,
        })
    }

    fn points_program(
        &self,
        vertex: &ShaderSource,
        fragment: &ShaderSource,
    ) -> Result<wgpu::RenderPipeline, String> {
        let vs = self.module(vertex)?;
        let fs = self.module(fragment)?;
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("points"),
                bind_group_layouts: &[],
                push_constant_ranges: &[],
            });
        let attributes = wgpu::vertex_attr_array![0 => Float32x4, 1 => Float32x4];
        Ok(self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("points"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vs,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<PointVertex>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &fs,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: FRAME_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::PointList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            }))
    }

    /// Makes sure the offscreen frame matches the viewport.
    fn ensure_frame(&mut self) -> &wgpu::Texture {
        let (width, height) = self.viewport;
        if !matches!(&self.frame, Some((_, w, h)) if (*w, *h) == (width, height)) {
            self.frame = None;
        }
        let device = &self.device;
        &self
            .frame
            .get_or_insert_with(|| {
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("frame"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: FRAME_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                (texture, width, height)
            })
            .0
    }

    fn record_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        call: &DispatchCall<'_>,
    ) -> Result<(), ComputeError> {
        let Some(GpuProgram::Compute(program)) = self.programs.get(&call.program) else {
            return Err(ComputeError::InvalidProgram(call.program));
        };
        if program.kernel != call.kernel {
            return Err(ComputeError::InvalidProgram(call.program));
        }

        let mut entries = Vec::with_capacity(call.bindings.len());
        for &(slot, handle) in call.bindings {
            let gpu = self
                .buffers
                .get(&handle)
                .ok_or(ComputeError::UnknownBuffer(handle))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot,
                resource: gpu.buffer.as_entire_binding(),
            });
        }
        let storage = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("storage slots"),
            layout: &program.storage_layout,
            entries: &entries,
        });

        let uniforms = program.uniform_layout.as_ref().map(|layout| {
            let mut block: Vec<u8> = call.uniforms.iter().flat_map(|u| u.to_bytes()).collect();
            block.resize(block.len().next_multiple_of(16), 0);
            let buffer = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("uniform block"),
                    contents: &block,
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("uniform block"),
                layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            })
        });

        let [x, y, z] = call.groups;
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(call.kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &storage, &[]);
            if let Some(uniforms) = &uniforms {
                pass.set_bind_group(1, uniforms, &[]);
            }
            pass.dispatch_workgroups(x, y, z);
        }
        Ok(())
    }

    /// Blocks until `staging` is mapped and copies `range` out of it.
    fn read_mapped(
        &self,
        staging: &wgpu::Buffer,
        range: std::ops::Range<usize>,
    ) -> Result<Vec<u8>, ComputeError> {
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("map_async failed: {e}");
                return Err(ComputeError::BackendUnavailable);
            }
            Err(_) => return Err(ComputeError::BackendUnavailable),
        }
        let bytes = slice.get_mapped_range()[range].to_vec();
        staging.unmap();
        Ok(bytes)
    }

    /// Reads back the last drawn frame as tightly packed RGBA8 rows, top to
    /// bottom.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, ComputeError> {
        self.flush();
        let (width, height) = self.viewport;
        let row = width as usize * 4;
        let padded = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame read-back"),
            size: (padded * height as usize) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.ensure_frame();
        let Some((texture, _, _)) = &self.frame else {
            return Err(ComputeError::BackendUnavailable);
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));
        let raw = self.read_mapped(&staging, 0..padded * height as usize)?;
        Ok(raw
            .chunks_exact(padded)
            .flat_map(|r| r[..row].iter().copied())
            .collect())
    }
}

impl ComputeBackend for WgpuBackend {
    fn current_context(&self) -> Option<ContextId> {
        Some(self.id)
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width.max(1), height.max(1));
    }

    fn limits(&self) -> DeviceLimits {
        let limits = self.device.limits();
        DeviceLimits {
            max_work_group_count: [limits.max_compute_workgroups_per_dimension; 3],
            max_work_group_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_work_group_invocations: limits.max_compute_invocations_per_workgroup,
            max_storage_block_size: u64::from(limits.max_storage_buffer_binding_size),
        }
    }

    fn preferred_language(&self) -> ShaderLanguage {
        ShaderLanguage::Wgsl
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramHandle, ComputeError> {
        let name = desc.name();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let built = match desc {
            ProgramDesc::Compute { kernel, source } => {
                self.compute_program(*kernel, source).map(GpuProgram::Compute)
            }
            ProgramDesc::Points { vertex, fragment } => {
                self.points_program(vertex, fragment).map(GpuProgram::Points)
            }
        };
        let scope = pollster::block_on(self.device.pop_error_scope());
        let program = match (built, scope) {
            (Err(log), _) => return Err(ComputeError::ProgramCompileFailed { program: name, log }),
            (Ok(_), Some(error)) => {
                return Err(ComputeError::ProgramCompileFailed {
                    program: name,
                    log: error.to_string(),
                })
            }
            (Ok(program), None) => program,
        };
        let handle = ProgramHandle(self.handle());
        self.programs.insert(handle, program);
        tracing::debug!("wgpu: built program {name} as {handle:?}");
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn create_buffer(
        &mut self,
        capacity: usize,
        usage: BufferUsage,
    ) -> Result<BufferHandle, ComputeError> {
        let size = capacity as u64;
        if size > u64::from(self.device.limits().max_storage_buffer_binding_size) {
            return Err(ComputeError::InvalidCapacity(capacity));
        }
        let handle = BufferHandle(self.handle());
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match usage {
                BufferUsage::Static => "static storage",
                BufferUsage::Dynamic => "dynamic storage",
            }),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::VERTEX,
            mapped_at_creation: false,
        });
        self.buffers.insert(handle, GpuBuffer { buffer, size });
        Ok(handle)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_some() {
            self.flush();
        }
    }

    fn write_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), ComputeError> {
        let size = self.buffer(buffer)?.size;
        if bytes.len() as u64 != size {
            return Err(ComputeError::UploadSizeMismatch {
                expected: usize::try_from(size).unwrap_or(usize::MAX),
                actual: bytes.len(),
            });
        }
        self.flush();
        self.queue.write_buffer(&self.buffer(buffer)?.buffer, 0, bytes);
        Ok(())
    }

    fn dispatch(&mut self, call: &DispatchCall<'_>) -> Result<(), ComputeError> {
        let mut encoder = self.take_encoder();
        let recorded = self.record_dispatch(&mut encoder, call);
        self.encoder = Some(encoder);
        recorded
    }

    fn memory_barrier(&mut self) {
        self.flush();
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, ComputeError> {
        let size = self.buffer(buffer)?.size;
        let capacity = usize::try_from(size).unwrap_or(usize::MAX);
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= capacity)
            .ok_or(ComputeError::MapOutOfRange {
                offset,
                len,
                capacity,
            })?;
        if len == 0 {
            return Ok(Vec::new());
        }
        self.flush();

        // Copies must start and end on 4-byte boundaries.
        let start = offset & !3;
        let stop = end.next_multiple_of(4).min(capacity);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read-back"),
            size: (stop - start) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(
            &self.buffer(buffer)?.buffer,
            start as u64,
            &staging,
            0,
            (stop - start) as u64,
        );
        self.queue.submit(Some(encoder.finish()));
        self.read_mapped(&staging, offset - start..end - start)
    }

    fn draw_points(
        &mut self,
        program: ProgramHandle,
        vertices: BufferHandle,
        count: u32,
    ) -> Result<(), ComputeError> {
        if !matches!(self.programs.get(&program), Some(GpuProgram::Points(_))) {
            return Err(ComputeError::InvalidProgram(program));
        }
        let size = self.buffer(vertices)?.size;
        let needed = u64::from(count) * std::mem::size_of::<PointVertex>() as u64;
        if needed > size {
            return Err(ComputeError::DrawOutOfRange {
                count,
                capacity: usize::try_from(size).unwrap_or(usize::MAX),
            });
        }
        self.flush();
        let view = self
            .ensure_frame()
            .create_view(&wgpu::TextureViewDescriptor::default());

        let Some(GpuProgram::Points(pipeline)) = self.programs.get(&program) else {
            return Err(ComputeError::InvalidProgram(program));
        };
        let vertex_buffer = &self.buffer(vertices)?.buffer;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("points"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("points"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_vertex_buffer(0, vertex_buffer.slice(..needed.max(4)));
            pass.draw(0..count, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}
