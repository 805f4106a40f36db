//! Per-(video, task) view handed to stages

use crate::config::{PipelineConfig, TrackProfile};
use crate::frame_buffer::{FrameBuffer, FrameBufferManager};
use crate::scene_tables::StartEndRecord;
use crate::store::ResultStore;
use image::RgbImage;
use ndarray::Array3;
use race_vision_common::{ProcessingError, RaceInfo, Result, Task, VideoId};
use race_vision_masks::MaskSources;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything a stage may read or write while processing one video for one task
pub struct StageContext<'a> {
    video: &'a VideoId,
    video_path: &'a Path,
    task: Task,
    model_dir: &'a Path,
    config: &'a PipelineConfig,
    store: &'a mut ResultStore,
    frames: &'a mut FrameBufferManager,
    race_info: Option<&'a RaceInfo>,
}

impl<'a> StageContext<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        video: &'a VideoId,
        video_path: &'a Path,
        task: Task,
        model_dir: &'a Path,
        config: &'a PipelineConfig,
        store: &'a mut ResultStore,
        frames: &'a mut FrameBufferManager,
        race_info: Option<&'a RaceInfo>,
    ) -> Self {
        Self {
            video,
            video_path,
            task,
            model_dir,
            config,
            store,
            frames,
            race_info,
        }
    }

    #[must_use]
    pub fn video(&self) -> &VideoId {
        self.video
    }

    #[must_use]
    pub fn video_path(&self) -> &Path {
        self.video_path
    }

    #[must_use]
    pub fn task(&self) -> Task {
        self.task
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        self.config
    }

    #[must_use]
    pub fn result_dir(&self) -> &Path {
        self.store.root()
    }

    #[must_use]
    pub fn model_dir(&self) -> &Path {
        self.model_dir
    }

    /// Primary output directory of the current task
    ///
    /// # Errors
    ///
    /// Returns `Config` if the task declares no output directory.
    pub fn output_dir(&self) -> Result<PathBuf> {
        self.output_dir_of(self.task)
    }

    /// Primary output directory of any task, for reading upstream artifacts
    ///
    /// # Errors
    ///
    /// Returns `Config` if the task declares no output directory.
    pub fn output_dir_of(&self, task: Task) -> Result<PathBuf> {
        self.store
            .output_dir(task)?
            .ok_or_else(|| ProcessingError::Config(format!("{task} has no output directory")))
    }

    /// Classified frame range of the current video
    ///
    /// # Errors
    ///
    /// Returns `MissingSceneResult` if the video has no start/end row yet.
    pub fn start_end(&self) -> Result<(u64, u64)> {
        self.store
            .scene_tables()
            .start_end(self.video)
            .ok_or_else(|| ProcessingError::MissingSceneResult(self.video.to_string()))
    }

    /// Camera change intervals of the current video
    ///
    /// # Errors
    ///
    /// Returns `MissingSceneResult` if the video has no camera change row yet.
    pub fn camera_changes(&self) -> Result<&[(u64, u64)]> {
        self.store
            .scene_tables()
            .camera_changes(self.video)
            .ok_or_else(|| ProcessingError::MissingSceneResult(self.video.to_string()))
    }

    /// Record the start/end row of the current video
    ///
    /// # Errors
    ///
    /// Returns `Config` if the record names another video and `Csv` if it cannot be
    /// written.
    pub fn record_start_end(&mut self, record: &StartEndRecord) -> Result<()> {
        if record.race_label != self.video.as_str() {
            return Err(ProcessingError::Config(format!(
                "start/end record for {} written while processing {}",
                record.race_label, self.video
            )));
        }
        self.store.scene_tables_mut().record_start_end(record)
    }

    /// Record the camera change row of the current video
    ///
    /// # Errors
    ///
    /// Returns `Csv` if the row cannot be written.
    pub fn record_camera_changes(&mut self, changes: &[(u64, u64)]) -> Result<()> {
        self.store
            .scene_tables_mut()
            .record_camera_changes(self.video, changes)
    }

    /// Pick up scene table rows written outside this process
    ///
    /// # Errors
    ///
    /// Returns `Csv` or `MalformedAnnotation` if a table no longer reads.
    pub fn reload_scene_tables(&mut self) -> Result<()> {
        self.store.scene_tables_mut().reload()
    }

    /// Load frames `[start, end]` of the current video, reusing the buffer when allowed
    ///
    /// # Errors
    ///
    /// Propagates [`FrameBufferManager::ensure_loaded`] errors.
    pub fn load_frames(&mut self, start: u64, end: u64) -> Result<&FrameBuffer> {
        self.frames
            .ensure_loaded(self.video_path, self.video, self.task, start, end)
    }

    /// Load the classified frame range of the current video
    ///
    /// # Errors
    ///
    /// Returns `MissingSceneResult` before classification, else load errors.
    pub fn load_race_frames(&mut self) -> Result<&FrameBuffer> {
        let (start, end) = self.start_end()?;
        self.load_frames(start, end)
    }

    /// Encoded frames currently buffered
    #[must_use]
    pub fn frames(&self) -> &[Vec<u8>] {
        self.frames.frames()
    }

    /// Decode one buffered frame by absolute frame number
    ///
    /// # Errors
    ///
    /// Propagates [`FrameBufferManager::decode_frame`] errors.
    pub fn decode_frame(&self, frame: u64) -> Result<RgbImage> {
        self.frames.decode_frame(frame)
    }

    /// Effective frame rate of the current video
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFrameRate` or decoder errors.
    pub fn effective_fps(&self) -> Result<u32> {
        self.frames.effective_fps(self.video_path, self.video)
    }

    #[must_use]
    pub fn race_info(&self) -> Option<&RaceInfo> {
        self.race_info
    }

    /// Race metadata of the current video
    ///
    /// # Errors
    ///
    /// Returns `Other` if no metadata source knew the video.
    pub fn require_race_info(&self) -> Result<&RaceInfo> {
        self.race_info
            .ok_or_else(|| ProcessingError::Other(format!("no race metadata for {}", self.video)))
    }

    /// Tracking profile of the race's track
    #[must_use]
    pub fn track_profile(&self) -> Option<&TrackProfile> {
        self.race_info
            .and_then(|info| self.config.track_profile(&info.track))
    }

    /// Frame window in which the race start is searched
    ///
    /// # Errors
    ///
    /// Propagates [`StageContext::effective_fps`] errors.
    pub fn start_window(&self) -> Result<(u64, u64)> {
        let fps = f64::from(self.effective_fps()?);
        let windows = &self.config.scene_windows;
        Ok((
            frame_number(windows.start_min * fps),
            frame_number(windows.start_max * fps),
        ))
    }

    /// Frame window in which the race finish is searched, given the start frame
    ///
    /// # Errors
    ///
    /// Returns `Other` without race metadata and propagates fps errors.
    pub fn end_window(&self, start: u64) -> Result<(u64, u64)> {
        let fps = f64::from(self.effective_fps()?);
        let distance = f64::from(self.require_race_info()?.distance);
        let windows = &self.config.scene_windows;
        let bound = |per_metre: f64| frame_number(per_metre * distance * fps / 1000.0) + start;
        Ok((bound(windows.end_min), bound(windows.end_max)))
    }

    /// Composite motion guidance over the classified range of the current video
    ///
    /// # Errors
    ///
    /// Returns `MissingSceneResult` before classification and annotation errors from
    /// the mask files.
    pub fn motion_guidance_masks(&self) -> Result<Array3<bool>> {
        let (start, end) = self.start_end()?;
        let file_name = format!("{}.json", self.video);
        let sources = MaskSources::load(
            &self.output_dir_of(Task::RailMask)?.join(&file_name),
            &self.output_dir_of(Task::RailPoleMask)?.join(&file_name),
            &self.output_dir_of(Task::SemanticMask)?.join(&file_name),
        )?;
        debug!("Composing guidance masks for {} [{}, {}]", self.video, start, end);
        sources.compose(start, end, &self.config.masks)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn frame_number(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}
