use crate::backend::{ComputeBackend, KernelParams, RenderError};
use crate::enums::Kernel;
use crate::volume::Volume;

use std::borrow::Cow;
use std::collections::HashMap;
use wgpu::{PollType, util::DeviceExt};

const WORKGROUP_SIZE: u32 = 8;

pub struct WGPU {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// 3D `R16Uint` texture holding one volume. Dropping it releases the texture.
pub struct GpuImage {
    view: wgpu::TextureView,
    texture: wgpu::Texture,
    /// (depth, height, width)
    dim: (usize, usize, usize),
}

/// Storage buffer the kernels write to plus the staging buffer used to read
/// it back. Samples are stored as `u32` since WGSL has no 16 bit storage.
pub struct GpuBuffer {
    storage: wgpu::Buffer,
    staging: wgpu::Buffer,
    width: u32,
    height: u32,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: HashMap<Kernel, wgpu::ComputePipeline>,
}

impl WgpuBackend {
    /// Select an adapter and build the kernel pipelines.
    ///
    /// `device_index` picks from the adapters in order of preference:
    /// 0 is the high performance adapter, 1 the low power one and 2 the
    /// software fallback.
    pub async fn new(device_index: usize) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let (power_preference, force_fallback_adapter) = match device_index {
            0 => (wgpu::PowerPreference::HighPerformance, false),
            1 => (wgpu::PowerPreference::LowPower, false),
            2 => (wgpu::PowerPreference::None, true),
            _ => return Err(RenderError::NoAdapter(device_index)),
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .map_err(|_| RenderError::NoAdapter(device_index))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Volume Render Device"),
                ..Default::default()
            })
            .await
            .map_err(|err| RenderError::Backend(err.to_string()))?;

        let name = adapter.get_info().name;
        log::info!("using GPU adapter {} (index {})", name, device_index);
        Ok(Self::from_device(WGPU { device, queue }, name))
    }

    /// Build the pipelines on an existing device.
    pub fn from_device(wgpu: WGPU, name: String) -> Self {
        let WGPU { device, queue } = wgpu;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume Render Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/volume_render.wgsl"
            ))),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume Render Bind Group Layout"),
            entries: &[
                // 3D texture
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Uint,
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                // Output buffer
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Params
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Volume Render Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipelines = Kernel::ALL
            .iter()
            .map(|&kernel| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.entry_point()),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some(kernel.entry_point()),
                    compilation_options: Default::default(),
                    cache: None,
                });
                (kernel, pipeline)
            })
            .collect();

        Self {
            device,
            queue,
            name,
            bind_group_layout,
            pipelines,
        }
    }
}

impl ComputeBackend for WgpuBackend {
    type Image = GpuImage;
    type Buffer = GpuBuffer;
    type ParamBuffer = wgpu::Buffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_image(&mut self, dim: (usize, usize, usize)) -> Result<GpuImage, RenderError> {
        check_image_dim(dim, self.device.limits().max_texture_dimension_3d)?;
        let (depth, height, width) = dim;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size: wgpu::Extent3d {
                width: width as u32,
                height: height as u32,
                depth_or_array_layers: depth as u32,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::R16Uint,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuImage {
            view,
            texture,
            dim,
        })
    }

    fn write_image(&mut self, image: &mut GpuImage, volume: &Volume) -> Result<(), RenderError> {
        if volume.dim() != image.dim {
            return Err(RenderError::DimensionMismatch {
                expected: image.dim,
                actual: volume.dim(),
            });
        }
        let (depth, height, width) = image.dim;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(volume.as_slice()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(2 * width as u32),
                rows_per_image: Some(height as u32),
            },
            wgpu::Extent3d {
                width: width as u32,
                height: height as u32,
                depth_or_array_layers: depth as u32,
            },
        );
        Ok(())
    }

    fn create_output(&mut self, width: u32, height: u32) -> Result<GpuBuffer, RenderError> {
        // Zero sized buffers can not be bound, keep at least one sample.
        let size = (width as u64 * height as u64).max(1) * std::mem::size_of::<u32>() as u64;
        let limit = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > limit {
            return Err(RenderError::Backend(format!(
                "output of {}x{} pixels exceeds the storage limit of {} bytes",
                width, height, limit
            )));
        }
        let storage = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Output Buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(GpuBuffer {
            storage,
            staging,
            width,
            height,
        })
    }

    fn create_params(&mut self) -> Result<wgpu::Buffer, RenderError> {
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params Buffer"),
                contents: bytemuck::bytes_of(&KernelParams::default()),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            }))
    }

    fn write_params(&mut self, buffer: &mut wgpu::Buffer, params: &KernelParams) -> Result<(), RenderError> {
        self.queue.write_buffer(buffer, 0, bytemuck::bytes_of(params));
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        grid: (u32, u32),
        params: &wgpu::Buffer,
        image: &GpuImage,
        output: &mut GpuBuffer,
    ) -> Result<(), RenderError> {
        if grid != (output.width, output.height) {
            return Err(RenderError::GridMismatch {
                expected: (output.width, output.height),
                actual: grid,
            });
        }
        let pipeline = self
            .pipelines
            .get(&kernel)
            .ok_or_else(|| RenderError::Backend(format!("no pipeline for {}", kernel.entry_point())))?;

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume Render Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&image.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output.storage.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Volume Render Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let dispatch_x = grid.0.div_ceil(WORKGROUP_SIZE);
            let dispatch_y = grid.1.div_ceil(WORKGROUP_SIZE);
            compute_pass.dispatch_workgroups(dispatch_x, dispatch_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output.storage, 0, &output.staging, 0, output.storage.size());
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_output(&mut self, output: &GpuBuffer, dst: &mut [u16]) -> Result<(), RenderError> {
        let samples = output.width as usize * output.height as usize;
        if dst.len() != samples {
            return Err(RenderError::GridMismatch {
                expected: (output.width, output.height),
                actual: (dst.len() as u32, 1),
            });
        }

        let buffer_slice = output.staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| RenderError::Backend(err.to_string()))?;
        futures::executor::block_on(receiver)
            .map_err(|_| RenderError::Backend("readback was cancelled".to_string()))?
            .map_err(|err| RenderError::Backend(err.to_string()))?;

        {
            let data = buffer_slice.get_mapped_range();
            let u32_data: &[u32] = bytemuck::cast_slice(&data);
            for (dst, &src) in dst.iter_mut().zip(u32_data) {
                *dst = src.min(u16::MAX as u32) as u16;
            }
        }
        output.staging.unmap();
        Ok(())
    }
}

/// Device textures reject empty extents and axes above `limit` with a
/// validation error, so catch both up front.
fn check_image_dim(dim: (usize, usize, usize), limit: u32) -> Result<(), RenderError> {
    let (depth, height, width) = dim;
    let fits = |n: usize| n > 0 && n <= limit as usize;
    if fits(depth) && fits(height) && fits(width) {
        Ok(())
    } else {
        Err(RenderError::UnsupportedSize { dim, limit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_backend::CpuBackend;
    use crate::enums::RenderMode;
    use crate::renderer::RenderEngine;
    use crate::transform;
    use crate::volume_loader::{DemoLoader, VolumeLoader};
    use std::sync::Arc;

    #[test]
    fn test_image_dim_limits() {
        assert!(check_image_dim((50, 100, 2048), 2048).is_ok());
        assert!(matches!(
            check_image_dim((50, 100, 4096), 2048),
            Err(RenderError::UnsupportedSize { limit: 2048, .. })
        ));
        assert!(check_image_dim((0, 4, 4), 2048).is_err());
    }

    #[test]
    fn test_oversized_volume_blanks_frame() {
        let Ok(backend) = futures::executor::block_on(WgpuBackend::new(0)) else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let limit = backend.device.limits().max_texture_dimension_3d as usize;
        let mut engine = RenderEngine::new(backend, 8, 8).expect("gpu engine");
        let volume = Volume::new(ndarray::Array3::zeros((1, 1, limit + 1)), (1.0, 1.0, 1.0));
        engine.set_volume(Arc::new(volume));
        assert!(engine.render(RenderMode::MaxProjection).is_blank());
        assert!(matches!(
            engine.last_error(),
            Some(RenderError::UnsupportedSize { .. })
        ));
    }

    #[test]
    fn test_matches_cpu_backend() {
        let Ok(backend) = futures::executor::block_on(WgpuBackend::new(0)) else {
            eprintln!("no GPU adapter available, skipping");
            return;
        };
        let volume = Arc::new(DemoLoader::new(32, 4).load(1).expect("demo frame"));

        let mut gpu = RenderEngine::new(backend, 48, 40).expect("gpu engine");
        let mut cpu = RenderEngine::new(CpuBackend::new(), 48, 40).expect("cpu engine");
        for engine_mode in [RenderMode::MaxProjection, RenderMode::TestProjection] {
            gpu.set_volume(Arc::clone(&volume));
            cpu.set_volume(Arc::clone(&volume));
            gpu.set_transform(transform::rotate_y(0.4), None);
            cpu.set_transform(transform::rotate_y(0.4), None);
            let a = gpu.render(engine_mode).pixels().to_vec();
            let b = cpu.render(engine_mode).pixels().to_vec();
            let differing = a.iter().zip(&b).filter(|(x, y)| x != y).count();
            // Texel lookups right on a voxel border may round differently.
            assert!(differing * 100 <= a.len(), "{engine_mode:?}: {differing} pixels differ");
        }
    }
}
