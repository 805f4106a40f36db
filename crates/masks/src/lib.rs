//! Segmentation mask decoding and composition
//!
//! Segmentation stages persist their output as per-frame JSON tables of COCO-style
//! compressed run-length strings. This crate decodes those records and assembles the
//! composite per-frame masks consumed by optical flow.

pub mod annotation;
pub mod compose;
pub mod morphology;
pub mod rle;

pub use annotation::{load_annotation, AnnotationFile, FrameTable, ObjectRegistryFile, RleObject};
pub use compose::{
    compose_frame_mask, decode_object, object_masks, rail_masks, rail_pole_masks,
    CompositionParams, GuidanceMasks, MaskSources,
};
pub use morphology::dilate_rect;
