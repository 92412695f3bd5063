use crate::backend::{ComputeBackend, KernelParams, RenderError};
use crate::cache::{CacheError, VolumeCache};
use crate::enums::{KernelFamily, RenderMode};
use crate::transform;
use crate::volume::Volume;

use glam::Mat4;
use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// A `width × height` image of `u16` samples, stored row by row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<u16>,
}

impl Raster {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    pub fn max(&self) -> u16 {
        self.pixels.iter().copied().max().unwrap_or(0)
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|&v| v == 0)
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
    }

    pub fn to_image(&self) -> Option<ImageBuffer<Luma<u16>, Vec<u16>>> {
        ImageBuffer::from_raw(self.width, self.height, self.pixels.clone())
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> image::ImageResult<()> {
        let image = self.to_image().ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;
        image.save(path)
    }
}

/// Tuning of the compositing accumulation curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositingParams {
    pub density: f32,
    pub gamma: f32,
    /// Subtracted from the normalized intensity before scaling.
    pub offset: f32,
    pub scale: f32,
}

impl Default for CompositingParams {
    fn default() -> Self {
        Self {
            density: 0.1,
            gamma: 1.0,
            offset: 0.0,
            scale: 1.0,
        }
    }
}

/// Renders projections of one volume at a time through a [`ComputeBackend`].
///
/// The engine owns every device resource: the output buffer sized by
/// [`RenderEngine::configure`], the volume image (rebuilt whenever the volume
/// dimensions change) and the constant-parameter buffer. Rendering failures
/// never escape [`RenderEngine::render`]; they are logged and kept in
/// [`RenderEngine::last_error`].
pub struct RenderEngine<B: ComputeBackend> {
    backend: B,
    raster: Raster,
    output: B::Buffer,
    params_buffer: B::ParamBuffer,
    image: Option<B::Image>,
    image_dim: Option<(usize, usize, usize)>,
    volume: Option<Arc<Volume>>,
    needs_upload: bool,
    modelview: Mat4,
    projection: Option<Mat4>,
    compositing: CompositingParams,
    last_error: Option<RenderError>,
}

impl<B: ComputeBackend> RenderEngine<B> {
    pub fn new(mut backend: B, width: u32, height: u32) -> Result<Self, RenderError> {
        let output = backend.create_output(width, height)?;
        let params_buffer = backend.create_params()?;
        log::debug!("render engine on {} with {}x{} output", backend.name(), width, height);
        Ok(Self {
            backend,
            raster: Raster::new(width, height),
            output,
            params_buffer,
            image: None,
            image_dim: None,
            volume: None,
            needs_upload: false,
            modelview: Mat4::IDENTITY,
            projection: None,
            compositing: CompositingParams::default(),
            last_error: None,
        })
    }

    /// Reallocate the output for `width × height` pixels. The previous
    /// output buffer is released.
    pub fn configure(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        if (width, height) == (self.raster.width, self.raster.height) {
            return Ok(());
        }
        self.output = self.backend.create_output(width, height)?;
        self.raster = Raster::new(width, height);
        Ok(())
    }

    /// Replace the active volume. The volume image is rebuilt when the
    /// dimensions differ from the current one and re-uploaded on the next
    /// render; passing the volume that is already active does nothing.
    pub fn set_volume(&mut self, volume: Arc<Volume>) {
        if self.volume.as_ref().is_some_and(|current| Arc::ptr_eq(current, &volume)) {
            return;
        }
        self.volume = Some(volume);
        self.needs_upload = true;
    }

    /// Swap in a volume of the same dimensions as the current image and
    /// upload it right away, without reallocating the image.
    pub fn update_volume(&mut self, volume: Arc<Volume>) -> Result<(), RenderError> {
        let Some(image) = self.image.as_mut() else {
            self.set_volume(volume);
            return Ok(());
        };
        self.backend.write_image(image, &volume)?;
        self.volume = Some(volume);
        self.needs_upload = false;
        Ok(())
    }

    pub fn clear_volume(&mut self) {
        self.volume = None;
        self.image = None;
        self.image_dim = None;
        self.needs_upload = false;
    }

    /// Fetch time point `index` from `cache` and make it the active volume.
    pub fn show_frame(&mut self, cache: &VolumeCache, index: usize) -> Result<(), CacheError> {
        let volume = cache.get(index)?;
        self.set_volume(volume);
        Ok(())
    }

    /// Store the view. The normalization scale of the active volume is
    /// composed in at render time, so later volume swaps are picked up.
    pub fn set_transform(&mut self, modelview: Mat4, projection: Option<Mat4>) {
        self.modelview = modelview;
        self.projection = projection;
    }

    pub fn set_modelview(&mut self, modelview: Mat4) {
        self.modelview = modelview;
    }

    pub fn set_compositing_params(&mut self, params: CompositingParams) {
        self.compositing = params;
    }

    pub fn compositing_params(&self) -> CompositingParams {
        self.compositing
    }

    pub fn modelview(&self) -> Mat4 {
        self.modelview
    }

    pub fn projection(&self) -> Option<Mat4> {
        self.projection
    }

    pub fn volume(&self) -> Option<&Arc<Volume>> {
        self.volume.as_ref()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.raster.width, self.raster.height)
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The failure of the most recent render, if it failed.
    pub fn last_error(&self) -> Option<&RenderError> {
        self.last_error.as_ref()
    }

    /// Render the active volume with `mode`.
    ///
    /// Without a volume the raster is blank. A singular view keeps the
    /// previous raster, any other failure blanks it.
    pub fn render(&mut self, mode: RenderMode) -> &Raster {
        match self.try_render(mode) {
            Ok(()) => self.last_error = None,
            Err(err) => {
                log::warn!("{:?} render failed: {}", mode, err);
                if !matches!(err, RenderError::SingularMatrix { .. }) {
                    self.raster.clear();
                }
                self.last_error = Some(err);
            }
        }
        &self.raster
    }

    fn try_render(&mut self, mode: RenderMode) -> Result<(), RenderError> {
        let Some(volume) = self.volume.clone() else {
            self.raster.clear();
            return Ok(());
        };

        let params = self.kernel_params(mode, &volume)?;
        self.upload(&volume)?;
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| RenderError::Backend("volume image missing after upload".to_string()))?;

        let grid = (self.raster.width, self.raster.height);
        self.backend.write_params(&mut self.params_buffer, &params)?;
        self.backend
            .dispatch(mode.kernel(), grid, &self.params_buffer, image, &mut self.output)?;
        self.backend.read_output(&self.output, &mut self.raster.pixels)?;
        Ok(())
    }

    fn upload(&mut self, volume: &Volume) -> Result<(), RenderError> {
        if self.image_dim != Some(volume.dim()) {
            // Release the old image before allocating the new one.
            self.image = None;
            self.image_dim = None;
            self.image = Some(self.backend.create_image(volume.dim())?);
            self.image_dim = Some(volume.dim());
            self.needs_upload = true;
        }
        if self.needs_upload {
            if let Some(image) = self.image.as_mut() {
                self.backend.write_image(image, volume)?;
            }
            self.needs_upload = false;
        }
        Ok(())
    }

    /// Compose `modelview × normalization` and derive the matrix the kernel
    /// of `mode` expects.
    pub(crate) fn kernel_params(&self, mode: RenderMode, volume: &Volume) -> Result<KernelParams, RenderError> {
        let family = mode.family();
        let model = transform::multiply(&self.modelview, &volume.normalization_scale_for(family));
        let (width, height) = (self.raster.width, self.raster.height);

        match family {
            KernelFamily::Transposing => Ok(KernelParams::with_matrix_3x4(
                transform::truncate_transposed(&model),
                width,
                height,
            )),
            KernelFamily::Inverting => {
                let view = match &self.projection {
                    Some(projection) => transform::multiply(projection, &model),
                    None => model,
                };
                let inverse = transform::invert(&view)?;
                Ok(KernelParams {
                    inv_matrix: transform::to_kernel_array(&inverse),
                    width,
                    height,
                    is_perspective: u32::from(self.projection.is_some()),
                    _padding: 0,
                    density: self.compositing.density,
                    gamma: self.compositing.gamma,
                    offset: self.compositing.offset,
                    scale: self.compositing.scale,
                })
            }
        }
    }
}
