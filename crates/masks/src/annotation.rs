//! On-disk annotation records written by the segmentation stages

use race_vision_common::{ProcessingError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// One object's mask at one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RleObject {
    /// Category (semantic files) or class id (object registry files)
    #[serde(default)]
    pub object_id: Option<i64>,
    /// Size the RLE counts were produced at, `[a, b]`
    #[serde(default)]
    pub mask_size: Option<[usize; 2]>,
    /// `[x, y, w, h]` in full-frame pixels
    #[serde(default)]
    pub bbox: Option<[usize; 4]>,
    pub rle_string: String,
}

/// Per-frame records keyed `frame_<n>`, with optional recorded bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameTable<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_frame: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_frame: Option<u64>,
    #[serde(flatten)]
    pub frames: HashMap<String, T>,
}

impl<T> Default for FrameTable<T> {
    fn default() -> Self {
        Self {
            start_frame: None,
            finish_frame: None,
            frames: HashMap::new(),
        }
    }
}

impl<T> FrameTable<T> {
    #[must_use]
    pub fn key(frame: u64) -> String {
        format!("frame_{frame}")
    }

    #[must_use]
    pub fn get(&self, frame: u64) -> Option<&T> {
        self.frames.get(&Self::key(frame))
    }

    pub fn insert(&mut self, frame: u64, record: T) {
        self.frames.insert(Self::key(frame), record);
    }

    /// Look up a frame that must be present
    ///
    /// # Errors
    ///
    /// Returns `MalformedAnnotation` naming `source` when the frame is missing.
    pub fn require(&self, frame: u64, source: &str) -> Result<&T> {
        self.get(frame).ok_or_else(|| {
            ProcessingError::MalformedAnnotation(format!("{source}: no record for frame {frame}"))
        })
    }

    /// Check `[start, end]` against the recorded bounds, when any are recorded
    ///
    /// # Errors
    ///
    /// Returns `MalformedAnnotation` if the range is inverted or falls outside the
    /// recorded `start_frame`/`finish_frame`.
    pub fn check_range(&self, start: u64, end: u64, source: &str) -> Result<()> {
        if end < start {
            return Err(ProcessingError::MalformedAnnotation(format!(
                "{source}: inverted frame range [{start}, {end}]"
            )));
        }
        let below = self.start_frame.is_some_and(|s| start < s);
        let above = self.finish_frame.is_some_and(|f| end > f);
        if below || above {
            return Err(ProcessingError::MalformedAnnotation(format!(
                "{source}: frames [{start}, {end}] outside recorded range [{}, {}]",
                fmt_bound(self.start_frame),
                fmt_bound(self.finish_frame)
            )));
        }
        Ok(())
    }
}

fn fmt_bound(bound: Option<u64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}

/// A per-video annotation file: `{ "data": { ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationFile<T> {
    pub data: FrameTable<T>,
}

impl<T> Default for AnnotationFile<T> {
    fn default() -> Self {
        Self {
            data: FrameTable::default(),
        }
    }
}

/// Annotation file that names its object classes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRegistryFile {
    pub object_name_list: Vec<String>,
    pub object_id_list: Vec<i64>,
    /// `[width, height]` of the frames the boxes refer to
    pub target_frame_size: [usize; 2],
    pub data: FrameTable<Vec<RleObject>>,
}

impl ObjectRegistryFile {
    /// Class id registered under `name`
    ///
    /// # Errors
    ///
    /// Returns `MalformedAnnotation` if the name is not registered.
    pub fn object_id(&self, name: &str) -> Result<i64> {
        self.object_name_list
            .iter()
            .position(|n| n == name)
            .and_then(|idx| self.object_id_list.get(idx).copied())
            .ok_or_else(|| {
                ProcessingError::MalformedAnnotation(format!(
                    "object {name} not in registry {:?}",
                    self.object_name_list
                ))
            })
    }
}

/// Read and parse a JSON annotation file
///
/// # Errors
///
/// Returns `IoError` if the file cannot be opened and `MalformedAnnotation` if it does
/// not parse into `T`.
pub fn load_annotation<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        ProcessingError::MalformedAnnotation(format!("{}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_object_registry() {
        let json = r#"{
            "object_name_list": ["Rail", "RailPole"],
            "object_id_list": [1, 2],
            "target_frame_size": [1920, 1080],
            "data": {
                "start_frame": 10,
                "finish_frame": 12,
                "frame_10": [{"object_id": 2, "mask_size": [4, 3], "bbox": [5, 6, 3, 4], "rle_string": "0<"}],
                "frame_11": []
            }
        }"#;
        let file: ObjectRegistryFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.object_id("RailPole").unwrap(), 2);
        assert!(file.object_id("Cap").is_err());
        assert_eq!(file.data.start_frame, Some(10));
        assert_eq!(file.data.get(10).unwrap()[0].bbox, Some([5, 6, 3, 4]));
        assert!(file.data.get(11).unwrap().is_empty());
        assert!(file.data.require(12, "rail").is_err());
    }

    #[test]
    fn test_check_range() {
        let mut table: FrameTable<String> = FrameTable::default();
        assert!(table.check_range(0, 100, "rail").is_ok());
        assert!(table.check_range(5, 4, "rail").is_err());

        table.start_frame = Some(10);
        table.finish_frame = Some(20);
        assert!(table.check_range(10, 20, "rail").is_ok());
        assert!(table.check_range(9, 20, "rail").is_err());
        assert!(table.check_range(10, 21, "rail").is_err());
    }

    #[test]
    fn test_load_annotation_reports_bad_json() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "{{\"data\": 3}}").unwrap();
        let err = load_annotation::<AnnotationFile<String>>(tmp.path()).unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedAnnotation(_)));
    }

    #[test]
    fn test_load_annotation_missing_file() {
        let err = load_annotation::<AnnotationFile<String>>(Path::new("/nonexistent/a.json"))
            .unwrap_err();
        assert!(matches!(err, ProcessingError::IoError(_)));
    }
}
