//! Folder-of-binary-stacks container.
//!
//! ```text
//! folder/
//! |-- metadata.txt      voxel spacing
//! |-- data/
//!     |-- index.txt     one line per time point, ending in `z y x`
//!     |-- data.bin      little-endian u16 stacks, back to back
//! ```
//!
//! An optional `data/darkstack.bin` holds camera dark frames with the same
//! `y x` size as the stacks.
//!
//! `metadata.txt` holds `dx = ..`, `dy = ..`, `dz = ..` entries (`:` works as
//! separator too). A line of three bare numbers is accepted as `dx dy dz`.

use crate::volume::Volume;
use crate::volume_loader::{LoadError, VolumeLoader};

use ndarray::Array3;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub struct SpimFolderLoader {
    data_path: PathBuf,
    name: String,
    frame_count: usize,
    /// (depth, height, width)
    stack_dim: (usize, usize, usize),
    stack_bytes: usize,
    spacing: (f32, f32, f32),
    dark_stack: Option<Array3<u16>>,
}

impl SpimFolderLoader {
    /// Parses the index and metadata files of `folder`. The stack data
    /// itself is only read by [`VolumeLoader::load`].
    pub fn open(folder: impl AsRef<Path>) -> Result<Self, LoadError> {
        let folder = folder.as_ref();
        let index_path = folder.join("data").join("index.txt");
        let meta_path = folder.join("metadata.txt");
        let data_path = folder.join("data").join("data.bin");

        let (frame_count, stack_dim) = parse_index(&fs::read_to_string(&index_path)?, &index_path)?;
        let stack_bytes = stack_bytes(stack_dim).ok_or_else(|| LoadError::Malformed {
            file: index_path.display().to_string(),
            reason: format!("stack of {:?} voxels is too large", stack_dim),
        })?;
        let spacing = parse_metadata(&fs::read_to_string(&meta_path)?)?;

        if !data_path.is_file() {
            return Err(LoadError::NoValidImages(data_path.display().to_string()));
        }

        let dark_stack = match read_dark_stack(&folder.join("data").join("darkstack.bin"), stack_dim) {
            Ok(dark_stack) => dark_stack,
            Err(err) => {
                log::warn!("ignoring dark stack of {}: {}", folder.display(), err);
                None
            }
        };

        log::info!(
            "opened {}: {} frames of {:?} voxels, spacing {:?}",
            folder.display(),
            frame_count,
            stack_dim,
            spacing
        );

        Ok(Self {
            data_path,
            name: folder.display().to_string(),
            frame_count,
            stack_dim,
            stack_bytes,
            spacing,
            dark_stack,
        })
    }

    /// (depth, height, width) of each stack
    pub fn stack_dim(&self) -> (usize, usize, usize) {
        self.stack_dim
    }

    /// Dark frames `[z, y, x]`, if the folder has any.
    pub fn dark_stack(&self) -> Option<&Array3<u16>> {
        self.dark_stack.as_ref()
    }
}

/// Reads the dark frames; a missing file is not an error. The frame count
/// follows from the file size.
fn read_dark_stack(path: &Path, (_, height, width): (usize, usize, usize)) -> Result<Option<Array3<u16>>, LoadError> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let frame_bytes = stack_bytes((1, height, width)).ok_or(LoadError::InconsistentDimensions)?;
    if bytes.is_empty() || bytes.len() % frame_bytes != 0 {
        return Err(LoadError::Malformed {
            file: path.display().to_string(),
            reason: format!("{} bytes is not a whole number of {}x{} frames", bytes.len(), height, width),
        });
    }
    let samples: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let depth = bytes.len() / frame_bytes;
    Array3::from_shape_vec((depth, height, width), samples)
        .map(Some)
        .map_err(|_| LoadError::InconsistentDimensions)
}

/// Size of one `u16` stack in bytes, `None` on overflow.
fn stack_bytes((depth, height, width): (usize, usize, usize)) -> Option<usize> {
    depth
        .checked_mul(height)?
        .checked_mul(width)?
        .checked_mul(2)
}

impl VolumeLoader for SpimFolderLoader {
    fn load(&self, index: usize) -> Result<Volume, LoadError> {
        self.check_index(index)?;
        let expected = self.stack_bytes;
        let offset = (expected as u64)
            .checked_mul(index as u64)
            .ok_or_else(|| LoadError::Malformed {
                file: self.data_path.display().to_string(),
                reason: format!("offset of frame {} overflows", index),
            })?;

        let mut file = File::open(&self.data_path)?;
        let file_len = file.metadata()?.len();
        let available = file_len.saturating_sub(offset).min(expected as u64) as usize;
        if available < expected {
            return Err(LoadError::Truncated {
                index,
                expected,
                actual: available,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; expected];
        file.read_exact(&mut bytes)?;

        let samples: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let data = Array3::from_shape_vec(self.stack_dim, samples)
            .map_err(|_| LoadError::InconsistentDimensions)?;

        Ok(Volume::new(data, self.spacing))
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn voxel_spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn parse_index(content: &str, path: &Path) -> Result<(usize, (usize, usize, usize)), LoadError> {
    let malformed = |reason: String| LoadError::Malformed {
        file: path.display().to_string(),
        reason,
    };

    let mut stack_dim = None;
    let mut frame_count = 0;
    for (line_no, line) in content.lines().enumerate() {
        let fields: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|field| !field.is_empty())
            .collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 3 {
            return Err(malformed(format!("line {} has fewer than 3 fields", line_no + 1)));
        }
        let mut dim = [0usize; 3];
        for (slot, field) in dim.iter_mut().zip(&fields[fields.len() - 3..]) {
            *slot = field
                .parse()
                .map_err(|_| malformed(format!("line {}: '{}' is not a size", line_no + 1, field)))?;
        }
        let dim = (dim[0], dim[1], dim[2]);
        if dim.0 == 0 || dim.1 == 0 || dim.2 == 0 {
            return Err(malformed(format!("line {} has an empty stack", line_no + 1)));
        }
        match stack_dim {
            None => stack_dim = Some(dim),
            Some(first) if first != dim => return Err(LoadError::InconsistentDimensions),
            Some(_) => {}
        }
        frame_count += 1;
    }

    stack_dim
        .map(|dim| (frame_count, dim))
        .ok_or_else(|| LoadError::NoValidImages(path.display().to_string()))
}

fn parse_metadata(content: &str) -> Result<(f32, f32, f32), LoadError> {
    let (mut dx, mut dy, mut dz) = (None, None, None);
    let mut bare = None;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((key, value)) = line.split_once(['=', ':']) {
            let value = value.trim().parse::<f32>().ok();
            match key.trim().to_ascii_lowercase().as_str() {
                "dx" => dx = value,
                "dy" => dy = value,
                "dz" => dz = value,
                _ => {}
            }
        } else if bare.is_none() {
            let numbers: Vec<f32> = line
                .split_whitespace()
                .filter_map(|field| field.parse().ok())
                .collect();
            if let [x, y, z] = numbers[..] {
                bare = Some((x, y, z));
            }
        }
    }

    let spacing = match (dx, dy, dz) {
        (Some(x), Some(y), Some(z)) => (x, y, z),
        _ => bare.ok_or(LoadError::MissingSpacing)?,
    };
    if spacing.0 <= 0.0 || spacing.1 <= 0.0 || spacing.2 <= 0.0 {
        return Err(LoadError::MissingSpacing);
    }
    Ok(spacing)
}
