//! Sequential per-video task execution

use crate::catalog::VideoCatalog;
use crate::config::{FailurePolicy, PipelineConfig};
use crate::context::StageContext;
use crate::frame_buffer::FrameBufferManager;
use crate::stage::StageRegistry;
use crate::store::{ResultStore, WorkPlan};
use race_vision_common::{ProcessingError, RaceInfo, Result, Task, VideoId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Outcome counts of a run, in (video, task) pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Pairs whose stage finished
    pub processed: usize,
    /// Pairs whose stage failed
    pub failed: usize,
    /// Pending pairs abandoned after an earlier failure on the same video
    pub skipped: usize,
    /// Failed pairs with their error message
    pub failures: Vec<(VideoId, Task, String)>,
}

impl RunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Drives the stages over a work plan, one video at a time
pub struct TaskRunner {
    config: Arc<PipelineConfig>,
    registry: StageRegistry,
    frames: FrameBufferManager,
    model_dir: PathBuf,
}

impl TaskRunner {
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        registry: StageRegistry,
        frames: FrameBufferManager,
        model_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            registry,
            frames,
            model_dir: model_dir.into(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    #[must_use]
    pub fn frame_buffers(&self) -> &FrameBufferManager {
        &self.frames
    }

    /// Tasks among `tasks` that have no registered stage
    #[must_use]
    pub fn missing_stages(&self, tasks: &[Task]) -> Vec<Task> {
        tasks
            .iter()
            .copied()
            .filter(|&task| !self.registry.contains(task))
            .collect()
    }

    /// Run every pending (video, task) pair of `plan`.
    ///
    /// Videos are processed in plan order and, within a video, tasks in the order of
    /// `tasks`. Each finished pair is removed from the plan. The frame buffer is
    /// released after every video, whether or not its tasks succeeded.
    ///
    /// # Errors
    ///
    /// Under [`FailurePolicy::FailFast`] the first stage error aborts the run and is
    /// returned. Under [`FailurePolicy::BestEffort`] stage errors are logged, counted in
    /// the summary and the remaining tasks of that video are skipped.
    pub fn run(
        &mut self,
        store: &mut ResultStore,
        catalog: &VideoCatalog,
        race_info: &HashMap<VideoId, RaceInfo>,
        tasks: &[Task],
        plan: &mut WorkPlan,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let videos = plan.videos.clone();
        let total = videos.len();
        let run_start = Instant::now();

        for (index, video) in videos.iter().enumerate() {
            let pending = plan.tasks_for(video, tasks);
            if pending.is_empty() {
                continue;
            }
            info!(
                "Processing video {} ({}/{}): {} tasks",
                video,
                index + 1,
                total,
                pending.len()
            );

            let mut failure = None;
            for (position, &task) in pending.iter().enumerate() {
                let task_start = Instant::now();
                match self.run_task(store, catalog, race_info, video, task) {
                    Ok(()) => {
                        plan.mark_done(task, video);
                        summary.processed += 1;
                        info!(
                            "{} finished for {} in {:.2}s",
                            task,
                            video,
                            task_start.elapsed().as_secs_f64()
                        );
                    }
                    Err(e) => {
                        failure = Some((position, task, e));
                        break;
                    }
                }
            }
            self.frames.release();

            if let Some((position, task, e)) = failure {
                summary.failed += 1;
                summary.skipped += pending.len() - position - 1;
                match self.config.failure_policy {
                    FailurePolicy::FailFast => {
                        error!("{} failed for {}: {}", task, video, e);
                        return Err(e);
                    }
                    FailurePolicy::BestEffort => {
                        error!(
                            "{} failed for {}, skipping its remaining {} tasks: {}",
                            task,
                            video,
                            pending.len() - position - 1,
                            e
                        );
                        summary.failures.push((video.clone(), task, e.to_string()));
                    }
                }
            }
        }

        info!(
            "Run complete in {:.1}s: {} processed, {} failed, {} skipped",
            run_start.elapsed().as_secs_f64(),
            summary.processed,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    fn run_task(
        &mut self,
        store: &mut ResultStore,
        catalog: &VideoCatalog,
        race_info: &HashMap<VideoId, RaceInfo>,
        video: &VideoId,
        task: Task,
    ) -> Result<()> {
        let path = catalog.resolve(video)?;
        let stage = self.registry.get(task)?;
        if stage.task() != task {
            return Err(ProcessingError::Config(format!(
                "stage registered for {task} implements {}",
                stage.task()
            )));
        }
        let mut ctx = StageContext::new(
            video,
            path,
            task,
            &self.model_dir,
            &self.config,
            store,
            &mut self.frames,
            race_info.get(video),
        );
        stage.run(&mut ctx)
    }
}
