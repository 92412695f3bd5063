//! Compute backend interface used by the [`RenderEngine`](crate::renderer::RenderEngine).
//!
//! A backend owns device memory for three resources: a 3D volume image, an
//! output raster buffer and a small constant-parameter buffer. The three
//! kernels (`max_projectShort`, `compositing_render`, `test_projection`) read
//! the parameters and the image and write one `u16` per output pixel.

use crate::enums::Kernel;
use crate::volume::Volume;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Singular view matrix (determinant {determinant})")]
    SingularMatrix { determinant: f32 },

    #[error("Volume of {actual:?} voxels does not fit an image of {expected:?}")]
    DimensionMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },

    #[error("Output buffer of {expected:?} pixels used with a grid of {actual:?}")]
    GridMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Volume of {dim:?} voxels is empty or exceeds the device limit of {limit} per axis")]
    UnsupportedSize {
        dim: (usize, usize, usize),
        limit: u32,
    },

    #[error("No GPU adapter at index {0}")]
    NoAdapter(usize),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<crate::transform::TransformError> for RenderError {
    fn from(err: crate::transform::TransformError) -> Self {
        match err {
            crate::transform::TransformError::SingularMatrix { determinant } => {
                RenderError::SingularMatrix { determinant }
            }
        }
    }
}

/// Constant parameters shared by all kernels. The layout matches the
/// `Params` struct of the WGSL source.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    /// Row-major. The transposing kernels use the first 12 entries as a 3x4
    /// matrix, the compositing kernel the full 4x4 inverse.
    pub inv_matrix: [f32; 16],
    pub width: u32,
    pub height: u32,
    pub is_perspective: u32,
    pub _padding: u32,
    pub density: f32,
    pub gamma: f32,
    pub offset: f32,
    pub scale: f32,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            inv_matrix: [0.0; 16],
            width: 0,
            height: 0,
            is_perspective: 0,
            _padding: 0,
            density: 0.1,
            gamma: 1.0,
            offset: 0.0,
            scale: 1.0,
        }
    }
}

impl KernelParams {
    /// Parameters for a transposing kernel.
    pub fn with_matrix_3x4(matrix: [f32; 12], width: u32, height: u32) -> Self {
        let mut inv_matrix = [0.0; 16];
        inv_matrix[..12].copy_from_slice(&matrix);
        Self {
            inv_matrix,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn matrix_3x4(&self) -> [f32; 12] {
        let mut out = [0.0; 12];
        out.copy_from_slice(&self.inv_matrix[..12]);
        out
    }
}

/// Device resources and kernel dispatch.
///
/// All calls are synchronous: `write_*` calls may be queued, but
/// [`ComputeBackend::read_output`] blocks until every preceding dispatch has
/// finished and the raster has been copied back.
pub trait ComputeBackend {
    type Image;
    type Buffer;
    type ParamBuffer;

    fn name(&self) -> &str;

    /// A 3D image for volumes of `dim` = (depth, height, width) voxels.
    fn create_image(&mut self, dim: (usize, usize, usize)) -> Result<Self::Image, RenderError>;

    /// Upload `volume`, which has to match the dimensions the image was
    /// created with.
    fn write_image(&mut self, image: &mut Self::Image, volume: &Volume) -> Result<(), RenderError>;

    fn create_output(&mut self, width: u32, height: u32) -> Result<Self::Buffer, RenderError>;

    fn create_params(&mut self) -> Result<Self::ParamBuffer, RenderError>;

    fn write_params(&mut self, buffer: &mut Self::ParamBuffer, params: &KernelParams) -> Result<(), RenderError>;

    /// Run `kernel` over a `grid` of (width, height) work items.
    fn dispatch(
        &mut self,
        kernel: Kernel,
        grid: (u32, u32),
        params: &Self::ParamBuffer,
        image: &Self::Image,
        output: &mut Self::Buffer,
    ) -> Result<(), RenderError>;

    /// Copy the raster of `output` into `dst`, which holds `width * height`
    /// samples.
    fn read_output(&mut self, output: &Self::Buffer, dst: &mut [u16]) -> Result<(), RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_layout() {
        // 16 floats + 4 u32 + 4 floats, a multiple of 16 bytes for uniforms.
        assert_eq!(std::mem::size_of::<KernelParams>(), 96);
        assert_eq!(std::mem::size_of::<KernelParams>() % 16, 0);
    }

    #[test]
    fn test_matrix_3x4_round_trip() {
        let m: [f32; 12] = std::array::from_fn(|i| i as f32);
        let params = KernelParams::with_matrix_3x4(m, 4, 2);
        assert_eq!(params.matrix_3x4(), m);
        assert_eq!(params.inv_matrix[12..], [0.0; 4]);
        assert_eq!((params.width, params.height), (4, 2));
    }
}
