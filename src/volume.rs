use glam::Mat4;
use ndarray::Array3;

use crate::enums::KernelFamily;

/// A single time point: a 3D intensity grid plus its physical voxel spacing.
///
/// Volumes are immutable once a loader produced them; the cache and the
/// renderer share them through `Arc<Volume>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<u16>,
    spacing: (f32, f32, f32),
}

impl Volume {
    /// `data` is indexed `[z, y, x]`, `spacing` is `(dx, dy, dz)`.
    pub fn new(data: Array3<u16>, spacing: (f32, f32, f32)) -> Self {
        // Kernels and uploads index the raw slice, so keep a standard layout.
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data, spacing }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    /// Voxel spacing `(dx, dy, dz)`
    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    /// The samples in `z, y, x` order.
    pub fn as_slice(&self) -> &[u16] {
        // Invariant upheld by `new`.
        self.data.as_slice().unwrap_or(&[])
    }

    pub fn max_value(&self) -> u16 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// Physical extent of each axis, `(dx·Nx, dy·Ny, dz·Nz)`.
    pub fn extent(&self) -> (f32, f32, f32) {
        let (depth, height, width) = self.dim();
        let (dx, dy, dz) = self.spacing;
        (dx * width as f32, dy * height as f32, dz * depth as f32)
    }

    /// Diagonal matrix stretching the unit cube the volume is rendered in to
    /// the volume's physical proportions, relative to the x axis:
    /// `diag(1, dy·Ny / (dx·Nx), dz·Nz / (dx·Nx))`.
    pub fn normalization_scale(&self) -> Mat4 {
        let (ex, ey, ez) = self.extent();
        if ex <= 0.0 || ey <= 0.0 || ez <= 0.0 {
            return Mat4::IDENTITY;
        }
        crate::transform::scale(1.0, ey / ex, ez / ex)
    }

    /// The normalization scale in the form a kernel family expects.
    ///
    /// The transpose based kernels read their matrix as an already inverted
    /// view, so they receive the inverse of [`Volume::normalization_scale`].
    pub fn normalization_scale_for(&self, family: KernelFamily) -> Mat4 {
        let forward = self.normalization_scale();
        match family {
            KernelFamily::Inverting => forward,
            KernelFamily::Transposing => {
                let (ex, ey, ez) = self.extent();
                if ex <= 0.0 || ey <= 0.0 || ez <= 0.0 {
                    return Mat4::IDENTITY;
                }
                crate::transform::scale(1.0, ex / ey, ex / ez)
            }
        }
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::new(Array3::zeros((1, 1, 1)), (1.0, 1.0, 1.0))
    }
}
