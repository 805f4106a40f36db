/// Common types and utilities for the race video pipeline
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid task code: {0}")]
    InvalidTask(i32),

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Unsupported frame rate {fps} for video {video} (accepted: 25, 30, 50, 60)")]
    UnsupportedFrameRate { video: String, fps: u32 },

    #[error("Out of RAM: {available_percent:.1}% available (floor: {floor_percent:.1}%)")]
    OutOfMemory {
        available_percent: f64,
        floor_percent: f64,
    },

    #[error("Malformed annotation: {0}")]
    MalformedAnnotation(String),

    #[error("No start/end frames recorded for video {0}")]
    MissingSceneResult(String),

    #[error("No stage registered for task {0}")]
    NoStageRegistered(String),

    #[error("Stage {task} failed for video {video}: {reason}")]
    StageFailed {
        task: String,
        video: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("FFmpeg error: {0}")]
    FFmpegError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for ProcessingError {
    fn from(err: image::ImageError) -> Self {
        ProcessingError::ImageError(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::MalformedAnnotation(err.to_string())
    }
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Pipeline stage identifier.
///
/// The integer codes are the ones accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Dump the classified frame range as JPEG files
    FrameExtractor,
    /// Start/end frame and camera-change classification
    SceneClassify,
    /// Rail segmentation
    RailMask,
    /// Rail pole segmentation
    RailPoleMask,
    /// Semantic segmentation of the whole scene
    SemanticMask,
    /// Optical flow / homography estimation
    OpticalFlow,
    /// Cap, jockey and saddlecloth detection
    Detection,
    /// Multi-object tracking
    Tracking,
}

impl Task {
    /// Every known task, ordered by code
    pub const ALL: [Task; 8] = [
        Task::FrameExtractor,
        Task::SceneClassify,
        Task::RailMask,
        Task::RailPoleMask,
        Task::SemanticMask,
        Task::OpticalFlow,
        Task::Detection,
        Task::Tracking,
    ];

    /// Parse a task from its integer code
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` when the code is not a known task.
    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|task| task.code() == code)
            .ok_or(ProcessingError::InvalidTask(code))
    }

    /// Integer code of the task
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::FrameExtractor => -1,
            Self::SceneClassify => 0,
            Self::RailMask => 1,
            Self::RailPoleMask => 2,
            Self::SemanticMask => 3,
            Self::OpticalFlow => 4,
            Self::Detection => 5,
            Self::Tracking => 6,
        }
    }

    /// Get human-readable task name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::FrameExtractor => "frame_extractor",
            Self::SceneClassify => "scene_classify",
            Self::RailMask => "rail_mask",
            Self::RailPoleMask => "rail_pole_mask",
            Self::SemanticMask => "semantic_mask",
            Self::OpticalFlow => "optical_flow",
            Self::Detection => "detection",
            Self::Tracking => "tracking",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Identity of one race video: a 4-digit frameset id or a free-form race label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Frameset ids are exactly four characters long (zero-padded numbers);
    /// anything else is a race label.
    #[must_use]
    pub fn is_frameset_id(&self) -> bool {
        self.0.chars().count() == 4
    }

    /// Numeric frameset id, if this identity is one
    #[must_use]
    pub fn frameset_id(&self) -> Option<u32> {
        if self.is_frameset_id() {
            self.0.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VideoId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for VideoId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-video race metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceInfo {
    /// Track abbreviation, e.g. HVT, STT, Kranji
    pub track: String,
    /// Race distance in metres
    pub distance: u32,
    /// Rail or course type, e.g. C+3
    pub course: String,
    /// Numbers of the jockeys that finished the race
    pub jockeys: Vec<u32>,
}
