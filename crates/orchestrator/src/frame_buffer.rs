//! Memory-bounded frame cache for the video being processed
//!
//! At most one [`FrameBuffer`] is alive at a time. Frames are held JPEG-encoded at the
//! canonical geometry, so a full race fits in memory while stages share one decode.

use crate::config::{FrameBufferConfig, PipelineConfig};
use crate::memory::MemoryProbe;
use image::RgbImage;
use race_vision_common::{ProcessingError, Result, Task, VideoId};
use race_vision_decoder::{decode_jpeg, encode_jpeg, VideoBackend};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Decoded, resized and encoded frames `[start, end]` of one video
#[derive(Debug)]
pub struct FrameBuffer {
    video: VideoId,
    task: Task,
    start: u64,
    end: u64,
    effective_fps: u32,
    frames: Vec<Vec<u8>>,
}

impl FrameBuffer {
    #[must_use]
    pub fn video(&self) -> &VideoId {
        &self.video
    }

    /// Task the buffer was last requested for
    #[must_use]
    pub fn task(&self) -> Task {
        self.task
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn effective_fps(&self) -> u32 {
        self.effective_fps
    }

    #[must_use]
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Encoded frame by absolute frame number
    #[must_use]
    pub fn frame(&self, frame: u64) -> Option<&[u8]> {
        let offset = frame.checked_sub(self.start)?;
        self.frames
            .get(usize::try_from(offset).ok()?)
            .map(Vec::as_slice)
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        self.start <= start && end <= self.end
    }
}

/// Owns the single active frame buffer
pub struct FrameBufferManager {
    backend: Box<dyn VideoBackend>,
    memory: Box<dyn MemoryProbe>,
    config: FrameBufferConfig,
    /// Tasks whose buffers are never reused
    invalidating: BTreeSet<Task>,
    buffer: Option<FrameBuffer>,
}

impl FrameBufferManager {
    #[must_use]
    pub fn new(
        backend: Box<dyn VideoBackend>,
        memory: Box<dyn MemoryProbe>,
        config: &PipelineConfig,
    ) -> Self {
        let invalidating = config
            .tasks
            .iter()
            .filter(|(_, spec)| spec.invalidates_frame_range)
            .map(|(&task, _)| task)
            .collect();
        Self {
            backend,
            memory,
            config: config.frame_buffer.clone(),
            invalidating,
            buffer: None,
        }
    }

    /// Make the buffer hold frames `[start, end]` of `video` for `task`.
    ///
    /// An existing buffer is reused when it belongs to the same video, covers the range
    /// and was not loaded for a task that invalidates frame ranges. Otherwise it is
    /// released before the video at `path` is decoded again.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFrameRate` for sources outside the accepted rates,
    /// `OutOfMemory` when available memory drops below the floor during the load, and
    /// decoder errors as they occur.
    pub fn ensure_loaded(
        &mut self,
        path: &Path,
        video: &VideoId,
        task: Task,
        start: u64,
        end: u64,
    ) -> Result<&FrameBuffer> {
        let reusable = self.buffer.as_ref().is_some_and(|buffer| {
            buffer.video == *video
                && !self.invalidating.contains(&buffer.task)
                && buffer.covers(start, end)
        });

        if reusable {
            if let Some(buffer) = self.buffer.as_mut() {
                debug!(
                    "Reusing {} frames of {} (loaded for {}) for {}",
                    buffer.len(),
                    video,
                    buffer.task,
                    task
                );
                buffer.task = task;
            }
        } else {
            self.release();
            let buffer = self.load(path, video, task, start, end)?;
            self.buffer = Some(buffer);
        }

        self.buffer
            .as_ref()
            .ok_or_else(|| ProcessingError::Other("Frame buffer missing after load".to_string()))
    }

    /// Frame rate after sampling, halved for 50/60 fps sources
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFrameRate` or decoder errors when the video has to be probed.
    pub fn effective_fps(&self, path: &Path, video: &VideoId) -> Result<u32> {
        if let Some(buffer) = self.buffer.as_ref().filter(|b| b.video == *video) {
            return Ok(buffer.effective_fps);
        }
        let stream = self.backend.open(path)?;
        let fps = self.validate_fps(video, stream.frame_rate())?;
        Ok(self.effective_rate(fps))
    }

    /// Drop the current buffer, if any
    pub fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            debug!("Released {} frames of {}", buffer.len(), buffer.video);
        }
    }

    #[must_use]
    pub fn buffer(&self) -> Option<&FrameBuffer> {
        self.buffer.as_ref()
    }

    /// Encoded frames of the current buffer, empty when nothing is loaded
    #[must_use]
    pub fn frames(&self) -> &[Vec<u8>] {
        match &self.buffer {
            Some(buffer) => buffer.frames(),
            None => &[],
        }
    }

    /// Encoded frame by absolute frame number
    #[must_use]
    pub fn frame(&self, frame: u64) -> Option<&[u8]> {
        self.buffer.as_ref().and_then(|b| b.frame(frame))
    }

    /// Decode one buffered frame back to pixels
    ///
    /// # Errors
    ///
    /// Returns `Other` if the frame is not buffered and `ImageError` if it does not
    /// decode.
    pub fn decode_frame(&self, frame: u64) -> Result<RgbImage> {
        let encoded = self
            .frame(frame)
            .ok_or_else(|| ProcessingError::Other(format!("Frame {frame} is not loaded")))?;
        decode_jpeg(encoded)
    }

    fn validate_fps(&self, video: &VideoId, raw: f64) -> Result<u32> {
        let rounded = raw.round();
        let accepted = rounded.is_finite()
            && rounded > 0.0
            && self.config.accepted_frame_rates.contains(&(rounded as u32));
        if !accepted {
            return Err(ProcessingError::UnsupportedFrameRate {
                video: video.to_string(),
                fps: if rounded.is_finite() && rounded > 0.0 {
                    rounded as u32
                } else {
                    0
                },
            });
        }
        Ok(rounded as u32)
    }

    fn effective_rate(&self, fps: u32) -> u32 {
        let step = self.config.frame_step(fps);
        fps / u32::try_from(step).unwrap_or(1)
    }

    fn load(
        &mut self,
        path: &Path,
        video: &VideoId,
        task: Task,
        start: u64,
        end: u64,
    ) -> Result<FrameBuffer> {
        let mut stream = self.backend.open(path)?;
        let fps = self.validate_fps(video, stream.frame_rate())?;
        let step = self.config.frame_step(fps);
        let (first, last) = (start * step, end * step);
        let (width, height) = (self.config.width, self.config.height);
        info!(
            "Loading frames [{}, {}] of {} for {} ({} fps, step {})",
            start, end, video, task, fps, step
        );

        let expected = usize::try_from(end.saturating_sub(start) + 1).unwrap_or(0);
        let mut frames = Vec::with_capacity(expected.min(16_384));
        let mut cursor = 0_u64;
        let mut grabbed = stream.grab()?;

        while grabbed {
            if cursor > last {
                break;
            }
            if cursor < first {
                grabbed = stream.grab()?;
                cursor += 1;
                continue;
            }

            let image = stream.retrieve(width, height)?;
            frames.push(encode_jpeg(&image, self.config.jpeg_quality)?);

            if (frames.len() - 1) % self.config.memory_check_interval == 0 {
                self.check_memory()?;
            }

            for _ in 0..step {
                grabbed = stream.grab()?;
            }
            cursor += step;
        }

        if frames.len() < expected {
            warn!(
                "{} ended early: {} of {} requested frames loaded",
                video,
                frames.len(),
                expected
            );
        }
        info!("Loaded {} frames of {}", frames.len(), video);

        Ok(FrameBuffer {
            video: video.clone(),
            task,
            start,
            end,
            effective_fps: self.effective_rate(fps),
            frames,
        })
    }

    fn check_memory(&mut self) -> Result<()> {
        let available = self.memory.available_fraction()?;
        debug!("Memory available: {:.1}%", available * 100.0);
        if available < self.config.memory_floor {
            return Err(ProcessingError::OutOfMemory {
                available_percent: available * 100.0,
                floor_percent: self.config.memory_floor * 100.0,
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedMemory, SyntheticBackend};
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        path: std::path::PathBuf,
        other: std::path::PathBuf,
        backend: SyntheticBackend,
    }

    fn fixture(fps: f64, total: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0001.mp4");
        let other = dir.path().join("0002.mp4");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(&other, b"").unwrap();
        Fixture {
            path,
            other,
            backend: SyntheticBackend::new(fps, total),
            _dir: dir,
        }
    }

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.frame_buffer.width = 16;
        config.frame_buffer.height = 8;
        config
    }

    fn manager(backend: &SyntheticBackend, memory: ScriptedMemory) -> FrameBufferManager {
        FrameBufferManager::new(Box::new(backend.clone()), Box::new(memory), &small_config())
    }

    #[test]
    fn test_sixty_fps_keeps_every_other_frame() {
        let fx = fixture(60.0, 1000);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let video = VideoId::from("0001");

        // Sampled frames 0..=50 span raw frames 0..=100
        let buffer = frames
            .ensure_loaded(&fx.path, &video, Task::RailMask, 0, 50)
            .unwrap();
        assert_eq!(buffer.len(), 51);
        assert_eq!(buffer.effective_fps(), 30);
        assert_eq!(frames.effective_fps(&fx.path, &video).unwrap(), 30);

        // Raw frame 2 * n is stored as sampled frame n
        let pixel = frames.decode_frame(10).unwrap().get_pixel(0, 0).0[0];
        assert!((i32::from(pixel) - 20).abs() <= 2);
    }

    #[test]
    fn test_offset_range_at_25_fps() {
        let fx = fixture(25.0, 200);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let video = VideoId::from("0001");
        let buffer = frames
            .ensure_loaded(&fx.path, &video, Task::Detection, 40, 59)
            .unwrap();
        assert_eq!(buffer.len(), 20);
        assert!(frames.frame(39).is_none());
        assert!(frames.frame(40).is_some());
        assert!(frames.frame(59).is_some());
        assert!(frames.frame(60).is_none());
        assert_eq!(frames.effective_fps(&fx.path, &video).unwrap(), 25);
    }

    #[test]
    fn test_short_video_loads_what_exists() {
        let fx = fixture(30.0, 10);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let buffer = frames
            .ensure_loaded(&fx.path, &VideoId::from("0001"), Task::Detection, 5, 50)
            .unwrap();
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_reuse_for_same_video() {
        let fx = fixture(50.0, 300);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let video = VideoId::from("0001");

        frames
            .ensure_loaded(&fx.path, &video, Task::RailMask, 0, 40)
            .unwrap();
        frames
            .ensure_loaded(&fx.path, &video, Task::RailPoleMask, 0, 40)
            .unwrap();
        assert_eq!(fx.backend.open_count(), 1);
        assert_eq!(frames.buffer().unwrap().task(), Task::RailPoleMask);

        // A narrower range is still covered
        frames
            .ensure_loaded(&fx.path, &video, Task::SemanticMask, 10, 20)
            .unwrap();
        assert_eq!(fx.backend.open_count(), 1);

        // A wider one is not
        frames
            .ensure_loaded(&fx.path, &video, Task::SemanticMask, 0, 60)
            .unwrap();
        assert_eq!(fx.backend.open_count(), 2);
    }

    #[test]
    fn test_different_video_reloads() {
        let fx = fixture(25.0, 100);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());

        frames
            .ensure_loaded(&fx.path, &VideoId::from("0001"), Task::RailMask, 0, 10)
            .unwrap();
        let buffer = frames
            .ensure_loaded(&fx.other, &VideoId::from("0002"), Task::RailMask, 0, 10)
            .unwrap();
        assert_eq!(buffer.video().as_str(), "0002");
        assert_eq!(fx.backend.open_count(), 2);
    }

    #[test]
    fn test_classification_buffer_is_never_reused() {
        let fx = fixture(25.0, 100);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let video = VideoId::from("0001");

        frames
            .ensure_loaded(&fx.path, &video, Task::SceneClassify, 0, 50)
            .unwrap();
        frames
            .ensure_loaded(&fx.path, &video, Task::RailMask, 0, 50)
            .unwrap();
        assert_eq!(fx.backend.open_count(), 2);
        // Buffers loaded for other tasks are reused again
        frames
            .ensure_loaded(&fx.path, &video, Task::Detection, 0, 50)
            .unwrap();
        assert_eq!(fx.backend.open_count(), 2);
    }

    #[test]
    fn test_unsupported_frame_rate() {
        let fx = fixture(24.0, 100);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let err = frames
            .ensure_loaded(&fx.path, &VideoId::from("0001"), Task::RailMask, 0, 10)
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::UnsupportedFrameRate { fps: 24, .. }
        ));
        assert!(frames.buffer().is_none());
    }

    #[test]
    fn test_ntsc_rate_rounds_to_thirty() {
        let fx = fixture(29.97, 20);
        let frames = manager(&fx.backend, ScriptedMemory::plenty());
        assert_eq!(
            frames
                .effective_fps(&fx.path, &VideoId::from("0001"))
                .unwrap(),
            30
        );
    }

    #[test]
    fn test_memory_guard_aborts_load() {
        let fx = fixture(25.0, 100);
        let memory = ScriptedMemory::new(&[0.8, 0.5, 0.25]);
        let samples = memory.samples.clone();
        let mut config = small_config();
        config.frame_buffer.memory_check_interval = 10;
        let mut frames =
            FrameBufferManager::new(Box::new(fx.backend.clone()), Box::new(memory), &config);

        let err = frames
            .ensure_loaded(&fx.path, &VideoId::from("0001"), Task::RailMask, 0, 99)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::OutOfMemory { .. }));
        // Sampled at retained frames 1, 11 and 21
        assert_eq!(samples.load(Ordering::SeqCst), 3);
        assert!(frames.buffer().is_none());
    }

    #[test]
    fn test_release_drops_buffer() {
        let fx = fixture(25.0, 20);
        let mut frames = manager(&fx.backend, ScriptedMemory::plenty());
        let video = VideoId::from("0001");
        frames
            .ensure_loaded(&fx.path, &video, Task::RailMask, 0, 5)
            .unwrap();
        frames.release();
        assert!(frames.frames().is_empty());
        frames
            .ensure_loaded(&fx.path, &video, Task::RailMask, 0, 5)
            .unwrap();
        assert_eq!(fx.backend.open_count(), 2);
    }
}
