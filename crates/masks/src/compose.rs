//! Composite per-frame mask assembly
//!
//! Optical flow is guided by one boolean mask per frame covering everything that
//! must not contribute camera motion: the dilated rail, the dilated rail poles and the
//! background/foreground-of-interest semantic categories away from the frame edge.

use crate::annotation::{
    load_annotation, AnnotationFile, FrameTable, ObjectRegistryFile, RleObject,
};
use crate::morphology::dilate_rect;
use crate::rle;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis, Zip};
use race_vision_common::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Geometry and filtering parameters for composition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionParams {
    pub frame_width: usize,
    pub frame_height: usize,
    /// Side of the square structuring element applied to rail and pole masks
    pub dilation: usize,
    /// Margin on every side where semantic masks are ignored
    pub semantic_border: usize,
    /// Semantic categories that join the composite
    pub semantic_categories: Vec<i64>,
}

impl Default for CompositionParams {
    fn default() -> Self {
        Self {
            frame_width: 1920,
            frame_height: 1080,
            dilation: 18,
            semantic_border: 35,
            semantic_categories: vec![0, 3],
        }
    }
}

/// The three annotation files a composite is built from
#[derive(Debug, Clone, Default)]
pub struct MaskSources {
    pub rail: AnnotationFile<String>,
    pub rail_pole: AnnotationFile<Vec<RleObject>>,
    pub semantic: AnnotationFile<Vec<RleObject>>,
}

impl MaskSources {
    /// Load the rail, rail-pole and semantic annotation files
    ///
    /// # Errors
    ///
    /// Returns `IoError` or `MalformedAnnotation` for the first file that cannot be read.
    pub fn load(rail: &Path, rail_pole: &Path, semantic: &Path) -> Result<Self> {
        Ok(Self {
            rail: load_annotation(rail)?,
            rail_pole: load_annotation(rail_pole)?,
            semantic: load_annotation(semantic)?,
        })
    }

    /// Compose `[start, end]`, see [`compose_frame_mask`]
    ///
    /// # Errors
    ///
    /// Propagates composition errors.
    pub fn compose(
        &self,
        start: u64,
        end: u64,
        params: &CompositionParams,
    ) -> Result<Array3<bool>> {
        compose_frame_mask(&self.rail, &self.rail_pole, &self.semantic, start, end, params)
    }
}

/// Build the composite mask for every frame in `[start, end]`.
///
/// The result has shape `(end - start + 1, frame_height, frame_width)`.
///
/// # Errors
///
/// Returns `MalformedAnnotation` if a frame is missing from any source, a range falls
/// outside a source's recorded bounds, a bounding box leaves the frame, a semantic
/// object has no category, or an RLE record does not decode.
pub fn compose_frame_mask(
    rail: &AnnotationFile<String>,
    rail_pole: &AnnotationFile<Vec<RleObject>>,
    semantic: &AnnotationFile<Vec<RleObject>>,
    start: u64,
    end: u64,
    params: &CompositionParams,
) -> Result<Array3<bool>> {
    rail.data.check_range(start, end, "rail")?;
    rail_pole.data.check_range(start, end, "rail pole")?;
    semantic.data.check_range(start, end, "semantic")?;

    let (height, width) = (params.frame_height, params.frame_width);
    let count = usize::try_from(end - start + 1)
        .map_err(|_| ProcessingError::Other(format!("frame range [{start}, {end}] too large")))?;
    let mut masks = Array3::from_elem((count, height, width), false);
    let border = params.semantic_border;

    for (frame, mut canvas) in (start..=end).zip(masks.axis_iter_mut(Axis(0))) {
        let rail_rle = rail.data.require(frame, "rail")?;
        let rail_mask = dilate_rect(&rle::decode(rail_rle, height, width)?, params.dilation);
        or_into(canvas.view_mut(), rail_mask.view());

        for pole in rail_pole.data.require(frame, "rail pole")? {
            let [x, y, w, h] = bbox_in_frame(pole, width, height)?;
            let local = dilate_rect(&decode_object(pole)?, params.dilation);
            or_into(canvas.slice_mut(s![y..y + h, x..x + w]), local.view());
        }

        for segment in semantic.data.require(frame, "semantic")? {
            let category = segment.object_id.ok_or_else(|| {
                ProcessingError::MalformedAnnotation(format!(
                    "semantic object without category at frame {frame}"
                ))
            })?;
            if !params.semantic_categories.contains(&category) {
                continue;
            }
            if 2 * border >= height || 2 * border >= width {
                continue;
            }
            let full = rle::decode(&segment.rle_string, height, width)?;
            or_into(
                canvas.slice_mut(s![border..height - border, border..width - border]),
                full.slice(s![border..height - border, border..width - border]),
            );
        }
    }

    debug!("Composed {} guidance masks for frames [{}, {}]", count, start, end);
    Ok(masks)
}

/// Decode one object's mask at its bounding-box size.
///
/// With `mask_size = [a, b]` the counts decode into an `a x b` column-major grid whose
/// transpose is the `b x a` object mask, which is then bilinearly scaled to the box.
/// Any pixel the scaled mask touches at all counts as set. Without `mask_size` the
/// counts are already at box size.
///
/// Callers placing the object on a canvas check its bbox and `mask_size` against the
/// canvas first, which bounds the decode.
///
/// # Errors
///
/// Returns `MalformedAnnotation` if the object has no bbox or its counts do not decode.
pub fn decode_object(obj: &RleObject) -> Result<Array2<bool>> {
    let [_, _, w, h] = obj
        .bbox
        .ok_or_else(|| ProcessingError::MalformedAnnotation("object without bbox".to_string()))?;
    match obj.mask_size {
        Some([a, b]) => {
            let grid = rle::decode(&obj.rle_string, a, b)?.reversed_axes();
            scale_mask(&grid, w, h)
        }
        None => rle::decode(&obj.rle_string, h, w),
    }
}

/// Per-frame masks of one registered object class over `[start, end]`.
///
/// Every object of the class is placed at its bounding box on a canvas of the file's
/// `target_frame_size`.
///
/// # Errors
///
/// Returns `MalformedAnnotation` if the class is unknown, the range is outside the
/// recorded bounds, a frame is missing, or an object does not decode into the frame.
pub fn object_masks(
    file: &ObjectRegistryFile,
    name: &str,
    start: u64,
    end: u64,
) -> Result<Array3<bool>> {
    let class_id = file.object_id(name)?;
    file.data.check_range(start, end, name)?;
    let [width, height] = file.target_frame_size;
    let count = usize::try_from(end - start + 1)
        .map_err(|_| ProcessingError::Other(format!("frame range [{start}, {end}] too large")))?;
    let mut masks = Array3::from_elem((count, height, width), false);

    for (frame, mut canvas) in (start..=end).zip(masks.axis_iter_mut(Axis(0))) {
        for obj in file.data.require(frame, name)? {
            if obj.object_id != Some(class_id) {
                continue;
            }
            let [x, y, w, h] = bbox_in_frame(obj, width, height)?;
            let local = decode_object(obj)?;
            or_into(canvas.slice_mut(s![y..y + h, x..x + w]), local.view());
        }
    }
    Ok(masks)
}

/// Rail masks from the rail segmentation output
///
/// # Errors
///
/// See [`object_masks`].
pub fn rail_masks(file: &ObjectRegistryFile, start: u64, end: u64) -> Result<Array3<bool>> {
    object_masks(file, "Rail", start, end)
}

/// Rail pole masks from the rail pole segmentation output
///
/// # Errors
///
/// See [`object_masks`].
pub fn rail_pole_masks(file: &ObjectRegistryFile, start: u64, end: u64) -> Result<Array3<bool>> {
    object_masks(file, "RailPole", start, end)
}

/// The object's bbox, once it and any `mask_size` are known to fit the frame
fn bbox_in_frame(obj: &RleObject, width: usize, height: usize) -> Result<[usize; 4]> {
    let bbox = obj
        .bbox
        .ok_or_else(|| ProcessingError::MalformedAnnotation("object without bbox".to_string()))?;
    let [x, y, w, h] = bbox;
    let fits = |origin: usize, extent: usize, limit: usize| {
        origin.checked_add(extent).is_some_and(|far| far <= limit)
    };
    if !fits(x, w, width) || !fits(y, h, height) {
        return Err(ProcessingError::MalformedAnnotation(format!(
            "bbox {bbox:?} outside {width}x{height} frame"
        )));
    }
    if let Some([a, b]) = obj.mask_size {
        if a.checked_mul(b).map_or(true, |pixels| pixels > width.saturating_mul(height)) {
            return Err(ProcessingError::MalformedAnnotation(format!(
                "mask size {a}x{b} larger than {width}x{height} frame"
            )));
        }
    }
    Ok(bbox)
}

fn or_into(dst: ArrayViewMut2<'_, bool>, src: ArrayView2<'_, bool>) {
    Zip::from(dst).and(src).for_each(|d, &s| *d |= s);
}

/// Bilinear resize of a mask to `width` x `height`; partly covered pixels stay set
fn scale_mask(mask: &Array2<bool>, width: usize, height: usize) -> Result<Array2<bool>> {
    let (rows, cols) = mask.dim();
    if (rows, cols) == (height, width) {
        return Ok(mask.clone());
    }
    if rows == 0 || cols == 0 || width == 0 || height == 0 {
        return Ok(Array2::from_elem((height, width), false));
    }
    let dimension = |value: usize| {
        u32::try_from(value).map_err(|_| {
            ProcessingError::MalformedAnnotation(format!("mask dimension {value} too large"))
        })
    };
    let src = GrayImage::from_fn(dimension(cols)?, dimension(rows)?, |x, y| {
        Luma([if mask[[y as usize, x as usize]] { 255 } else { 0 }])
    });
    let scaled = imageops::resize(&src, dimension(width)?, dimension(height)?, FilterType::Triangle);
    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        scaled.get_pixel(x as u32, y as u32)[0] > 0
    }))
}

/// Composite masks re-encoded as RLE for handing to an external stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceMasks {
    /// `[height, width]` of every mask
    pub size: [usize; 2],
    pub data: FrameTable<String>,
}

impl GuidanceMasks {
    /// Encode masks whose first entry is frame `start`
    #[must_use]
    pub fn from_masks(masks: &Array3<bool>, start: u64) -> Self {
        let (count, height, width) = masks.dim();
        let mut data = FrameTable::default();
        for (offset, mask) in masks.axis_iter(Axis(0)).enumerate() {
            data.insert(start + offset as u64, rle::encode(&mask));
        }
        if count > 0 {
            data.start_frame = Some(start);
            data.finish_frame = Some(start + count as u64 - 1);
        }
        Self {
            size: [height, width],
            data,
        }
    }

    /// Decode back into a `(frames, height, width)` array
    ///
    /// # Errors
    ///
    /// Returns `MalformedAnnotation` if a frame in the recorded range is missing or
    /// does not decode at `size`.
    pub fn to_masks(&self) -> Result<Array3<bool>> {
        let [height, width] = self.size;
        let (Some(start), Some(end)) = (self.data.start_frame, self.data.finish_frame) else {
            return Ok(Array3::from_elem((0, height, width), false));
        };
        let count = usize::try_from(end - start + 1)
            .map_err(|_| ProcessingError::Other(format!("frame range [{start}, {end}] too large")))?;
        let mut masks = Array3::from_elem((count, height, width), false);
        for (frame, mut slot) in (start..=end).zip(masks.axis_iter_mut(Axis(0))) {
            let decoded = rle::decode(self.data.require(frame, "guidance")?, height, width)?;
            slot.assign(&decoded);
        }
        Ok(masks)
    }

    /// Write as JSON, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns `IoError` on filesystem failures.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
