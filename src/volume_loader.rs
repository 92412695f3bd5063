use crate::dicom_series::DicomSeriesLoader;
use crate::enums::SortBy;
use crate::spim_folder::SpimFolderLoader;
use crate::volume::Volume;

use ndarray::{Array3, Array4, Axis, Zip};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Time index {index} is outside of [0, {frame_count})")]
    IndexOutOfRange { index: usize, frame_count: usize },

    #[error("No valid images found in {0}")]
    NoValidImages(String),

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Malformed {file}: {reason}")]
    Malformed { file: String, reason: String },

    #[error("Expected {expected} bytes for frame {index}, found {actual}")]
    Truncated {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// A source of time-point volumes.
///
/// Implementations must report corrupt or missing data as a [`LoadError`]
/// rather than producing an empty volume. They are shared with the prefetch
/// thread, hence `Send + Sync`.
pub trait VolumeLoader: Send + Sync {
    /// Produce the volume for time point `index`.
    fn load(&self, index: usize) -> Result<Volume, LoadError>;

    /// Number of time points.
    fn frame_count(&self) -> usize;

    /// Voxel spacing `(dx, dy, dz)` shared by all time points.
    fn voxel_spacing(&self) -> (f32, f32, f32);

    /// Human readable name of the source.
    fn name(&self) -> &str {
        "unnamed"
    }

    fn check_index(&self, index: usize) -> Result<(), LoadError> {
        let frame_count = self.frame_count();
        if index >= frame_count {
            return Err(LoadError::IndexOutOfRange { index, frame_count });
        }
        Ok(())
    }
}

/// Pick the loader for a folder on disk: a SPIM folder when it carries a
/// `metadata.txt`, a DICOM series otherwise.
pub fn open_path(path: impl AsRef<Path>, sort_by: SortBy) -> Result<Arc<dyn VolumeLoader>, LoadError> {
    let path = path.as_ref();
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
    if ["tif", "tiff"].iter().any(|tif| extension.eq_ignore_ascii_case(tif)) {
        return Err(LoadError::Malformed {
            file: path.display().to_string(),
            reason: "TIFF stacks are not supported".to_string(),
        });
    }
    if path.join("metadata.txt").is_file() {
        Ok(Arc::new(SpimFolderLoader::open(path)?))
    } else {
        Ok(Arc::new(DicomSeriesLoader::open(path, sort_by)?))
    }
}

/// Frames that already live in memory, indexed `[t, z, y, x]`.
pub struct InMemoryLoader {
    frames: Array4<u16>,
    spacing: (f32, f32, f32),
}

impl InMemoryLoader {
    pub fn new(frames: Array4<u16>, spacing: (f32, f32, f32)) -> Self {
        Self { frames, spacing }
    }

    /// A single time point.
    pub fn from_volume(data: Array3<u16>, spacing: (f32, f32, f32)) -> Self {
        Self::new(data.insert_axis(Axis(0)), spacing)
    }
}

impl VolumeLoader for InMemoryLoader {
    fn load(&self, index: usize) -> Result<Volume, LoadError> {
        self.check_index(index)?;
        let frame = self.frames.index_axis(Axis(0), index).to_owned();
        Ok(Volume::new(frame, self.spacing))
    }

    fn frame_count(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    fn voxel_spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Synthetic time series: a speckled spherical shell plus a gaussian blob
/// circling inside it. Frames are computed on demand.
pub struct DemoLoader {
    size: usize,
    frame_count: usize,
}

impl DemoLoader {
    /// Volumes of `size × size × size/2` voxels (x, y, z).
    pub fn new(size: usize, frame_count: usize) -> Self {
        Self {
            size: size.max(2),
            frame_count: frame_count.max(1),
        }
    }
}

impl Default for DemoLoader {
    fn default() -> Self {
        Self::new(100, 100)
    }
}

impl VolumeLoader for DemoLoader {
    fn load(&self, index: usize) -> Result<Volume, LoadError> {
        self.check_index(index)?;
        let n = self.size;
        let depth = (n / 2).max(1);
        let phase = std::f32::consts::TAU * index as f32 / self.frame_count as f32;
        let (blob_x, blob_y) = (0.4 * phase.cos(), 0.4 * phase.sin());

        let coord = |i: usize, len: usize| {
            if len <= 1 {
                0.0
            } else {
                2.0 * i as f32 / (len - 1) as f32 - 1.0
            }
        };

        let mut data = Array3::<u16>::zeros((depth, n, n));
        Zip::indexed(&mut data).par_for_each(|(z, y, x), value| {
            let (x, y, z) = (coord(x, n), coord(y, n), coord(z, depth));
            let r = (x * x + y * y + z * z).sqrt();
            let theta = x.atan2((y * y + z * z).sqrt());
            let shell = (-500.0 * (r - 0.9).powi(2)).exp() * (0.5 + 0.5 * (12.0 * theta).cos());
            let r2 = (x - blob_x).powi(2) + (y - blob_y).powi(2) + z * z;
            let blob = (-7.0 * r2).exp();
            *value = (10000.0 * (shell * (1.0 + z) + 2.0 * blob)).clamp(0.0, 65535.0) as u16;
        });

        Ok(Volume::new(data, self.voxel_spacing()))
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn voxel_spacing(&self) -> (f32, f32, f32) {
        (1.0, 1.0, 1.0)
    }

    fn name(&self) -> &str {
        "demo"
    }
}

/// A single empty voxel, useful as a placeholder source.
#[derive(Default)]
pub struct EmptyLoader;

impl VolumeLoader for EmptyLoader {
    fn load(&self, index: usize) -> Result<Volume, LoadError> {
        self.check_index(index)?;
        Ok(Volume::default())
    }

    fn frame_count(&self) -> usize {
        1
    }

    fn voxel_spacing(&self) -> (f32, f32, f32) {
        (1.0, 1.0, 1.0)
    }

    fn name(&self) -> &str {
        "empty"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_frames() {
        let frames = Array4::<u16>::from_shape_fn((3, 2, 2, 2), |(t, _, _, _)| t as u16);
        let loader = InMemoryLoader::new(frames, (1.0, 1.0, 3.0));
        assert_eq!(loader.frame_count(), 3);
        let volume = loader.load(2).expect("frame 2 exists");
        assert!(volume.data().iter().all(|&v| v == 2));
        assert_eq!(volume.spacing(), (1.0, 1.0, 3.0));
    }

    #[test]
    fn test_in_memory_out_of_range() {
        let loader = InMemoryLoader::from_volume(Array3::zeros((1, 1, 1)), (1.0, 1.0, 1.0));
        assert!(matches!(
            loader.load(1),
            Err(LoadError::IndexOutOfRange {
                index: 1,
                frame_count: 1
            })
        ));
    }

    #[test]
    fn test_demo_frames_are_deterministic() {
        let loader = DemoLoader::new(16, 4);
        let a = loader.load(1).expect("demo frame");
        let b = loader.load(1).expect("demo frame");
        assert_eq!(a, b);
        assert_eq!(a.dim(), (8, 16, 16));
        assert!(a.max_value() > 0);
        assert_ne!(a, loader.load(2).expect("demo frame"));
    }

    #[test]
    fn test_empty_loader() {
        let volume = EmptyLoader.load(0).expect("single frame");
        assert_eq!(volume.dim(), (1, 1, 1));
        assert!(EmptyLoader.load(1).is_err());
    }

    #[test]
    fn test_open_path_rejects_tiff() {
        assert!(matches!(
            open_path("stack.TIF", SortBy::default()),
            Err(LoadError::Malformed { .. })
        ));
        assert!(matches!(
            open_path(std::env::temp_dir().join("spim-render-no-such-source"), SortBy::default()),
            Err(LoadError::Io(_))
        ));
    }
}
