//! Time series of DICOM stacks.
//!
//! The series root holds one directory per time point, each containing the
//! `.dcm` slices of that time point. Time points are ordered by directory
//! name. Slices are assumed to be single frame images from the same
//! acquisition; the first frame of multiframe objects is used.

use crate::enums::SortBy;
use crate::volume::Volume;
use crate::volume_loader::{LoadError, VolumeLoader};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, Axis, s};
use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
};

pub struct DicomSeriesLoader {
    name: String,
    time_points: Vec<PathBuf>,
    sort_by: SortBy,
    spacing: (f32, f32, f32),
}

impl DicomSeriesLoader {
    /// Scan `root` for time point directories. The spacing is read from the
    /// first time point, which therefore has to be a valid stack.
    pub fn open(root: impl AsRef<Path>, sort_by: SortBy) -> Result<Self, LoadError> {
        let root = root.as_ref();
        let mut time_points: Vec<PathBuf> = fs::read_dir(root)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && !Self::slice_paths(path).is_empty())
            .collect();
        time_points.sort();

        let first = time_points
            .first()
            .ok_or_else(|| LoadError::NoValidImages(root.display().to_string()))?;
        let objects = Self::open_objects(&Self::slice_paths(first))?;
        let spacing = Self::get_spacing(&objects).ok_or(LoadError::MissingSpacing)?;

        log::info!(
            "opened DICOM series {} with {} time points",
            root.display(),
            time_points.len()
        );

        Ok(Self {
            name: root.display().to_string(),
            time_points,
            sort_by,
            spacing,
        })
    }

    fn slice_paths(dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect()
    }

    fn open_objects(paths: &[PathBuf]) -> Result<Vec<FileDicomObject<InMemDicomObject>>, LoadError> {
        paths
            .iter()
            .map(|path| open_file(path).map_err(LoadError::from))
            .collect()
    }

    /// Spacing of the first object carrying both PixelSpacing and
    /// SliceThickness.
    fn get_spacing(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<(f32, f32, f32)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;
            let slice_thickness = dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float32()
                .ok()?;

            // PixelSpacing is (row, column) = (dy, dx)
            Some((*pixel_spacing.get(1)?, *pixel_spacing.first()?, slice_thickness))
        })
    }
}

/// One decoded slice and the key it is stacked by.
struct Slice {
    key: Option<f32>,
    pixels: Array2<u16>,
}

impl Slice {
    /// `None` if the object has no decodable image or lacks the sort tag.
    fn decode(dicom_object: &FileDicomObject<InMemDicomObject>, sort_by: SortBy) -> Option<Self> {
        let key = sort_key(dicom_object, sort_by)?;
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        // Keep raw detector counts, no windowing.
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        let frames = pixel_data.to_ndarray_with_options::<u16>(&options).ok()?;
        Some(Self {
            key,
            pixels: frames.slice_move(s![0, .., .., 0]),
        })
    }
}

fn sort_key(dicom_object: &FileDicomObject<InMemDicomObject>, sort_by: SortBy) -> Option<Option<f32>> {
    let element = move |tag| dicom_object.element(tag).ok();
    match sort_by {
        SortBy::ImagePositionPatient => {
            let position = element(tags::IMAGE_POSITION_PATIENT)?.to_multi_float32().ok()?;
            Some(position.get(2).copied())
        }
        SortBy::TablePosition => Some(element(tags::TABLE_POSITION)?.to_float32().ok()),
        SortBy::InstanceNumber => Some(
            element(tags::INSTANCE_NUMBER)?
                .to_int::<i32>()
                .ok()
                .map(|n| n as f32),
        ),
        SortBy::None => Some(None),
    }
}

/// Order slices along z. Patient positions run head first, so they are
/// stacked in descending order.
fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
    match sort_by {
        SortBy::None => {}
        SortBy::ImagePositionPatient => {
            slices.sort_by(|a, b| b.key.partial_cmp(&a.key).unwrap_or(Ordering::Equal))
        }
        SortBy::TablePosition | SortBy::InstanceNumber => {
            slices.sort_by(|a, b| a.key.partial_cmp(&b.key).unwrap_or(Ordering::Equal))
        }
    }
}

/// Decode, sort and stack the slices of one time point into a `[z, y, x]`
/// array. Objects without a usable image are skipped.
fn stack_slices(
    dicom_objects: &[FileDicomObject<InMemDicomObject>],
    sort_by: SortBy,
) -> Result<Array3<u16>, LoadError> {
    let mut slices: Vec<Slice> = dicom_objects
        .iter()
        .filter_map(|dicom_object| Slice::decode(dicom_object, sort_by))
        .collect();
    if slices.is_empty() {
        return Err(LoadError::NoValidImages("DICOM objects".to_string()));
    }
    sort_slices(&mut slices, sort_by);

    let views: Vec<_> = slices.iter().map(|slice| slice.pixels.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|_| LoadError::InconsistentDimensions)
}

impl VolumeLoader for DicomSeriesLoader {
    fn load(&self, index: usize) -> Result<Volume, LoadError> {
        self.check_index(index)?;
        let dir = &self.time_points[index];
        let paths = Self::slice_paths(dir);
        if paths.is_empty() {
            return Err(LoadError::NoValidImages(dir.display().to_string()));
        }
        let objects = Self::open_objects(&paths)?;
        // All time points share the spacing of the first one.
        Ok(Volume::new(stack_slices(&objects, self.sort_by)?, self.spacing))
    }

    fn frame_count(&self) -> usize {
        self.time_points.len()
    }

    fn voxel_spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
    use dicom::object::FileMetaTableBuilder;

    const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spim-render-dicom-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    /// A 2x3 monochrome slice whose pixels are `fill`.
    fn write_slice(path: &Path, instance: i32, fill: u16) {
        let uid = format!("2.25.{}{}", instance, fill);
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(SECONDARY_CAPTURE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(uid.as_str())),
            DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(instance.to_string())),
            DataElement::new(tags::PIXEL_SPACING, VR::DS, dicom_value!(Strs, ["0.5", "0.25"])),
            DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("2")),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(2_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(3_u16)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OW,
                dicom_value!(U16, [fill, fill, fill, fill, fill, fill]),
            ),
        ]);
        let file = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LE)
                    .media_storage_sop_class_uid(SECONDARY_CAPTURE)
                    .media_storage_sop_instance_uid(uid.as_str()),
            )
            .expect("valid file meta");
        file.write_to_file(path).expect("write slice");
    }

    fn slice(key: f32, fill: u16) -> Slice {
        Slice {
            key: Some(key),
            pixels: Array2::from_elem((1, 1), fill),
        }
    }

    #[test]
    fn test_empty_root_has_no_images() {
        let dir = scratch_dir("empty");
        fs::create_dir_all(dir.join("t000")).expect("create scratch dir");

        assert!(matches!(
            DicomSeriesLoader::open(&dir, SortBy::InstanceNumber),
            Err(LoadError::NoValidImages(_))
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_loads_series_of_time_points() {
        let dir = scratch_dir("series");
        for t in 0..2u16 {
            let time_point = dir.join(format!("t{t:03}"));
            fs::create_dir_all(&time_point).expect("create time point");
            // Written out of order, stacked by instance number.
            write_slice(&time_point.join("b.dcm"), 2, 100 * t + 20);
            write_slice(&time_point.join("a.dcm"), 1, 100 * t + 10);
        }

        let loader = DicomSeriesLoader::open(&dir, SortBy::InstanceNumber).expect("valid series");
        assert_eq!(loader.frame_count(), 2);
        assert_eq!(loader.voxel_spacing(), (0.25, 0.5, 2.0));

        let volume = loader.load(1).expect("second time point");
        assert_eq!(volume.dim(), (2, 2, 3));
        assert_eq!(volume.data()[[0, 1, 2]], 110);
        assert_eq!(volume.data()[[1, 0, 0]], 120);
        assert!(matches!(loader.load(2), Err(LoadError::IndexOutOfRange { .. })));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sort_by_position_is_descending() {
        let mut slices = vec![slice(1.0, 1), slice(3.0, 3), slice(2.0, 2)];
        sort_slices(&mut slices, SortBy::ImagePositionPatient);
        let order: Vec<u16> = slices.iter().map(|s| s.pixels[[0, 0]]).collect();
        assert_eq!(order, vec![3, 2, 1]);

        sort_slices(&mut slices, SortBy::TablePosition);
        let order: Vec<u16> = slices.iter().map(|s| s.pixels[[0, 0]]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
