/// Composition from annotation files on disk
use ndarray::Array2;
use race_vision_masks::{rle, CompositionParams, GuidanceMasks, MaskSources};
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

const WIDTH: usize = 200;
const HEIGHT: usize = 100;

fn params() -> CompositionParams {
    CompositionParams {
        frame_width: WIDTH,
        frame_height: HEIGHT,
        ..CompositionParams::default()
    }
}

fn full_frame(pixels: impl Fn(usize, usize) -> bool) -> String {
    let mask = Array2::from_shape_fn((HEIGHT, WIDTH), |(y, x)| pixels(y, x));
    rle::encode(&mask.view())
}

fn write(dir: &Path, name: &str, frames: &[(u64, Value)]) {
    let mut data = serde_json::Map::new();
    data.insert("start_frame".to_string(), json!(0));
    data.insert("finish_frame".to_string(), json!(100));
    for (frame, record) in frames {
        data.insert(format!("frame_{frame}"), record.clone());
    }
    std::fs::write(dir.join(name), json!({ "data": data }).to_string()).unwrap();
}

fn sources(dir: &TempDir, semantic: Value) -> MaskSources {
    let rail = json!(full_frame(|y, x| y == 20 && x == 20));
    let pole_rle = rle::encode(&Array2::from_elem((10, 10), true).view());
    let pole = json!([{ "bbox": [100, 40, 10, 10], "rle_string": pole_rle }]);

    write(dir.path(), "rail.json", &[(7, rail.clone()), (8, rail)]);
    write(dir.path(), "pole.json", &[(7, pole.clone()), (8, pole)]);
    write(dir.path(), "semantic.json", &[(7, semantic.clone()), (8, semantic)]);
    MaskSources::load(
        &dir.path().join("rail.json"),
        &dir.path().join("pole.json"),
        &dir.path().join("semantic.json"),
    )
    .unwrap()
}

#[test]
fn test_rail_and_pole_counts_add_up() {
    let dir = TempDir::new().unwrap();
    let masks = sources(&dir, json!([])).compose(7, 8, &params()).unwrap();
    assert_eq!(masks.shape(), &[2, HEIGHT, WIDTH]);

    // One rail pixel grows to an 18 x 18 block, the pole fills its own box
    for frame in masks.outer_iter() {
        assert_eq!(frame.iter().filter(|&&v| v).count(), 18 * 18 + 100);
        // Anchor at 9: rows and columns 12..=29
        assert!(frame[[12, 12]] && frame[[29, 29]]);
        assert!(!frame[[11, 11]] && !frame[[30, 30]]);
        assert!(frame[[40, 100]] && frame[[49, 109]]);
    }
}

#[test]
fn test_semantic_margin_and_categories() {
    let dir = TempDir::new().unwrap();
    let semantic = json!([
        // Background inside the 35 px margin only
        { "object_id": 0, "rle_string": full_frame(|y, _| y < 35) },
        // Foreground of interest in the middle of the frame
        { "object_id": 3, "rle_string": full_frame(|y, x| (50..52).contains(&y) && (150..155).contains(&x)) },
        // Any other category is ignored
        { "object_id": 1, "rle_string": full_frame(|y, x| (60..70).contains(&y) && (60..70).contains(&x)) }
    ]);
    let masks = sources(&dir, semantic).compose(7, 7, &params()).unwrap();
    let frame = masks.index_axis(ndarray::Axis(0), 0);
    assert_eq!(frame.iter().filter(|&&v| v).count(), 18 * 18 + 100 + 10);
    assert!(frame[[50, 150]]);
    assert!(!frame[[65, 65]]);
    assert!(!frame[[0, 199]]);
}

#[test]
fn test_range_outside_recorded_bounds() {
    let dir = TempDir::new().unwrap();
    let sources = sources(&dir, json!([]));
    assert!(sources.compose(7, 9, &params()).is_err());
    assert!(sources.compose(99, 101, &params()).is_err());
}

#[test]
fn test_guidance_file_reloads() {
    let dir = TempDir::new().unwrap();
    let masks = sources(&dir, json!([])).compose(7, 8, &params()).unwrap();
    let path = dir.path().join(".work/0042_guidance.json");
    GuidanceMasks::from_masks(&masks, 7).save(&path).unwrap();

    let file: GuidanceMasks = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(file.size, [HEIGHT, WIDTH]);
    assert_eq!(file.data.start_frame, Some(7));
    assert_eq!(file.to_masks().unwrap(), masks);
}
