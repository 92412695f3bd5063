//! Reference implementation of the projection kernels on the CPU.
//!
//! Rows of the output are marched in parallel with rayon. The ray setup and
//! sampling mirror `shaders/volume_render.wgsl` step for step so both
//! backends produce the same rasters up to float rounding.

use crate::backend::{ComputeBackend, KernelParams, RenderError};
use crate::enums::Kernel;
use crate::volume::Volume;

use glam::{Mat4, Vec3, Vec4};
use rayon::prelude::*;

/// Samples taken along the part of a ray inside the volume.
pub const STEPS: u32 = 256;
/// Accumulated opacity at which compositing stops early.
pub const OPACITY_CUTOFF: f32 = 0.99;
/// Longest chord through the `[-1, 1]` cube.
const MAX_CHORD: f32 = 3.464_101_6;

pub struct CpuImage {
    dim: (usize, usize, usize),
    data: Vec<u16>,
}

pub struct CpuBuffer {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for CpuBackend {
    type Image = CpuImage;
    type Buffer = CpuBuffer;
    type ParamBuffer = KernelParams;

    fn name(&self) -> &str {
        "cpu"
    }

    fn create_image(&mut self, dim: (usize, usize, usize)) -> Result<CpuImage, RenderError> {
        Ok(CpuImage {
            dim,
            data: vec![0; dim.0 * dim.1 * dim.2],
        })
    }

    fn write_image(&mut self, image: &mut CpuImage, volume: &Volume) -> Result<(), RenderError> {
        if volume.dim() != image.dim {
            return Err(RenderError::DimensionMismatch {
                expected: image.dim,
                actual: volume.dim(),
            });
        }
        image.data.copy_from_slice(volume.as_slice());
        Ok(())
    }

    fn create_output(&mut self, width: u32, height: u32) -> Result<CpuBuffer, RenderError> {
        Ok(CpuBuffer {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        })
    }

    fn create_params(&mut self) -> Result<KernelParams, RenderError> {
        Ok(KernelParams::default())
    }

    fn write_params(&mut self, buffer: &mut KernelParams, params: &KernelParams) -> Result<(), RenderError> {
        *buffer = *params;
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        grid: (u32, u32),
        params: &KernelParams,
        image: &CpuImage,
        output: &mut CpuBuffer,
    ) -> Result<(), RenderError> {
        if grid != (output.width, output.height) {
            return Err(RenderError::GridMismatch {
                expected: (output.width, output.height),
                actual: grid,
            });
        }
        let (width, height) = grid;
        if width == 0 || height == 0 {
            return Ok(());
        }
        let sampler = Sampler::new(image);
        let inverse = Mat4::from_cols_array(&params.inv_matrix).transpose();

        output
            .data
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, pixel) in row.iter_mut().enumerate() {
                    let (u, v) = pixel_coords(x as u32, y as u32, width, height);
                    *pixel = match kernel {
                        Kernel::MaxProjectShort => max_project(params, &sampler, u, v),
                        Kernel::TestProjection => test_project(params, u, v),
                        Kernel::CompositingRender => composite(params, &inverse, &sampler, u, v),
                    };
                }
            });
        Ok(())
    }

    fn read_output(&mut self, output: &CpuBuffer, dst: &mut [u16]) -> Result<(), RenderError> {
        if dst.len() != output.data.len() {
            return Err(RenderError::GridMismatch {
                expected: (output.width, output.height),
                actual: (dst.len() as u32, 1),
            });
        }
        dst.copy_from_slice(&output.data);
        Ok(())
    }
}

/// Nearest neighbour lookups into a volume occupying the `[-1, 1]` cube.
struct Sampler<'a> {
    data: &'a [u16],
    // (width, height, depth)
    size: Vec3,
    dim: (usize, usize, usize),
}

impl<'a> Sampler<'a> {
    fn new(image: &'a CpuImage) -> Self {
        let (depth, height, width) = image.dim;
        Self {
            data: &image.data,
            size: Vec3::new(width as f32, height as f32, depth as f32),
            dim: image.dim,
        }
    }

    fn sample(&self, p: Vec3) -> u16 {
        let (depth, height, width) = self.dim;
        if self.data.is_empty() {
            return 0;
        }
        let texel = ((p + Vec3::ONE) * 0.5 * self.size).floor();
        let x = (texel.x.max(0.0) as usize).min(width - 1);
        let y = (texel.y.max(0.0) as usize).min(height - 1);
        let z = (texel.z.max(0.0) as usize).min(depth - 1);
        self.data[(z * height + y) * width + x]
    }
}

fn pixel_coords(x: u32, y: u32, width: u32, height: u32) -> (f32, f32) {
    (
        2.0 * (x as f32 + 0.5) / width as f32 - 1.0,
        2.0 * (y as f32 + 0.5) / height as f32 - 1.0,
    )
}

/// Parameter interval of `origin + t * dir` inside the `[-1, 1]` cube.
fn intersect_box(origin: Vec3, dir: Vec3) -> Option<(f32, f32)> {
    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    for axis in 0..3 {
        let (o, d) = (origin[axis], dir[axis]);
        if d.abs() < 1e-8 {
            if !(-1.0..=1.0).contains(&o) {
                return None;
            }
            continue;
        }
        let t0 = (-1.0 - o) / d;
        let t1 = (1.0 - o) / d;
        t_near = t_near.max(t0.min(t1));
        t_far = t_far.min(t0.max(t1));
    }
    if !t_near.is_finite() || !t_far.is_finite() || t_far <= t_near {
        return None;
    }
    Some((t_near, t_far))
}

/// Ray of a transposing kernel: orthographic, origin `R·(u, v, 0, 1)` and
/// direction `R·(0, 0, 1, 0)`.
fn transposed_ray(params: &KernelParams, u: f32, v: f32) -> (Vec3, Vec3) {
    let m = &params.inv_matrix;
    let row = |k: usize| Vec4::new(m[4 * k], m[4 * k + 1], m[4 * k + 2], m[4 * k + 3]);
    let eye = Vec4::new(u, v, 0.0, 1.0);
    let origin = Vec3::new(row(0).dot(eye), row(1).dot(eye), row(2).dot(eye));
    let dir = Vec3::new(m[2], m[6], m[10]);
    (origin, dir)
}

fn step_point(origin: Vec3, dir: Vec3, t_near: f32, t_far: f32, i: u32) -> Vec3 {
    let t = t_near + (i as f32 + 0.5) / STEPS as f32 * (t_far - t_near);
    origin + dir * t
}

fn max_project(params: &KernelParams, sampler: &Sampler, u: f32, v: f32) -> u16 {
    let (origin, dir) = transposed_ray(params, u, v);
    let Some((t_near, t_far)) = intersect_box(origin, dir) else {
        return 0;
    };
    (0..STEPS)
        .map(|i| sampler.sample(step_point(origin, dir, t_near, t_far, i)))
        .max()
        .unwrap_or(0)
}

fn test_project(params: &KernelParams, u: f32, v: f32) -> u16 {
    let (origin, dir) = transposed_ray(params, u, v);
    let Some((t_near, t_far)) = intersect_box(origin, dir) else {
        return 0;
    };
    let chord = dir.length() * (t_far - t_near);
    to_sample(chord / MAX_CHORD)
}

fn composite(params: &KernelParams, inverse: &Mat4, sampler: &Sampler, u: f32, v: f32) -> u16 {
    let mut near = *inverse * Vec4::new(u, v, -1.0, 1.0);
    let mut far = *inverse * Vec4::new(u, v, 1.0, 1.0);
    if params.is_perspective != 0 {
        if near.w.abs() < 1e-12 || far.w.abs() < 1e-12 {
            return 0;
        }
        near /= near.w;
        far /= far.w;
    }
    let origin = near.truncate();
    let dir = far.truncate() - origin;
    let Some((t_near, t_far)) = intersect_box(origin, dir) else {
        return 0;
    };
    let (t_near, t_far) = (t_near.max(0.0), t_far.min(1.0));
    if t_far <= t_near {
        return 0;
    }

    let mut color = 0.0f32;
    let mut alpha = 0.0f32;
    for i in 0..STEPS {
        let value = sampler.sample(step_point(origin, dir, t_near, t_far, i)) as f32 / 65535.0;
        let s = (params.scale * (value - params.offset)).clamp(0.0, 1.0);
        let s = if s > 0.0 { s.powf(params.gamma) } else { 0.0 };
        let a = (params.density * s).clamp(0.0, 1.0);
        color += (1.0 - alpha) * a * s;
        alpha += (1.0 - alpha) * a;
        if alpha >= OPACITY_CUTOFF {
            break;
        }
    }
    to_sample(color)
}

/// Maps `[0, 1]` onto the `u16` range, rounding half up like the shader.
fn to_sample(x: f32) -> u16 {
    (65535.0 * x + 0.5).floor().clamp(0.0, 65535.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn identity_3x4() -> [f32; 12] {
        [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
    }

    fn render(kernel: Kernel, params: &KernelParams, volume: &Volume) -> Vec<u16> {
        let mut backend = CpuBackend::new();
        let mut image = backend.create_image(volume.dim()).expect("image");
        backend.write_image(&mut image, volume).expect("upload");
        let mut output = backend.create_output(params.width, params.height).expect("output");
        backend
            .dispatch(kernel, (params.width, params.height), params, &image, &mut output)
            .expect("dispatch");
        let mut raster = vec![0; (params.width * params.height) as usize];
        backend.read_output(&output, &mut raster).expect("readback");
        raster
    }

    #[test]
    fn test_intersect_box_axis_ray() {
        let (near, far) = intersect_box(Vec3::new(0.5, 0.0, -3.0), Vec3::Z).expect("hits cube");
        assert!((near - 2.0).abs() < 1e-6);
        assert!((far - 4.0).abs() < 1e-6);
        assert!(intersect_box(Vec3::new(1.5, 0.0, 0.0), Vec3::Z).is_none());
        assert!(intersect_box(Vec3::ZERO, Vec3::ZERO).is_none());
    }

    #[test]
    fn test_max_projection_finds_single_voxel() {
        let mut data = Array3::<u16>::zeros((8, 8, 8));
        // Every z in column (x = 2, y = 5) is empty except one.
        data[[6, 5, 2]] = 900;
        let volume = Volume::new(data, (1.0, 1.0, 1.0));
        let params = KernelParams::with_matrix_3x4(identity_3x4(), 8, 8);
        let raster = render(Kernel::MaxProjectShort, &params, &volume);
        assert_eq!(raster[5 * 8 + 2], 900);
        assert_eq!(raster.iter().filter(|&&v| v != 0).count(), 1);
    }

    #[test]
    fn test_projection_chord_length() {
        let volume = Volume::new(Array3::zeros((4, 4, 4)), (1.0, 1.0, 1.0));
        let params = KernelParams::with_matrix_3x4(identity_3x4(), 4, 4);
        let raster = render(Kernel::TestProjection, &params, &volume);
        let expected = to_sample(2.0 / MAX_CHORD);
        assert!(raster.iter().all(|&v| v == expected));
    }

    #[test]
    fn test_compositing_empty_volume_is_black() {
        let volume = Volume::new(Array3::zeros((4, 4, 4)), (1.0, 1.0, 1.0));
        let mut params = KernelParams::default();
        params.inv_matrix = Mat4::IDENTITY.transpose().to_cols_array();
        params.width = 4;
        params.height = 4;
        assert!(render(Kernel::CompositingRender, &params, &volume).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_compositing_saturates_on_dense_volume() {
        let volume = Volume::new(Array3::from_elem((4, 4, 4), u16::MAX), (1.0, 1.0, 1.0));
        let mut params = KernelParams::default();
        params.inv_matrix = Mat4::IDENTITY.transpose().to_cols_array();
        params.width = 2;
        params.height = 2;
        params.density = 1.0;
        let raster = render(Kernel::CompositingRender, &params, &volume);
        assert!(raster.iter().all(|&v| v == u16::MAX), "{raster:?}");
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut backend = CpuBackend::new();
        let mut image = backend.create_image((2, 2, 2)).expect("image");
        let volume = Volume::new(Array3::zeros((2, 2, 3)), (1.0, 1.0, 1.0));
        assert!(matches!(
            backend.write_image(&mut image, &volume),
            Err(RenderError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_grid_mismatch() {
        let mut backend = CpuBackend::new();
        let image = backend.create_image((1, 1, 1)).expect("image");
        let mut output = backend.create_output(4, 4).expect("output");
        let params = KernelParams::default();
        assert!(matches!(
            backend.dispatch(Kernel::MaxProjectShort, (2, 2), &params, &image, &mut output),
            Err(RenderError::GridMismatch { .. })
        ));
    }
}
