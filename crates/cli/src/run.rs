//! The pipeline run: resolve, plan, execute

use anyhow::{bail, Context as _, Result};
use clap::Args;
use race_vision_common::{RaceInfo, Task, VideoId};
use race_vision_decoder::FfmpegBackend;
use race_vision_orchestrator::{
    resolve_tasks, FailurePolicy, FrameBufferManager, JsonRaceCatalog, NoRaceInfo,
    PipelineConfig, RaceMetadataSource, ResultStore, StageRegistry, StaticRaceInfo,
    SystemMemory, TaskRunner, VideoCatalog, WorkPlan,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Args)]
pub struct RunCommand {
    /// A race video (client mode) or a directory of race videos (batch mode)
    #[arg(long, value_name = "PATH")]
    pub(crate) video_path: PathBuf,

    /// Directory holding model weights, passed to stages
    #[arg(long, default_value = "./models")]
    pub(crate) model_dir: PathBuf,

    /// Result directory; existing results in it are not recomputed
    #[arg(long, default_value = "./Result")]
    pub(crate) result_dir: PathBuf,

    /// Task codes to complete (-1..=6); prerequisites are added automatically
    #[arg(long, num_args = 1.., default_values_t = [0], allow_negative_numbers = true)]
    pub(crate) tasks: Vec<i32>,

    /// Track abbreviation, e.g. HVT, STT, Kranji (client mode)
    #[arg(long)]
    pub(crate) track: Option<String>,

    /// Race distance in metres (client mode)
    #[arg(long)]
    pub(crate) distance: Option<u32>,

    /// Rail or course type, e.g. C+3 (client mode)
    #[arg(long)]
    pub(crate) course: Option<String>,

    /// Numbers of the jockeys that finished the race (client mode)
    #[arg(long, num_args = 1..)]
    pub(crate) jockeys: Vec<u32>,

    /// Identity of the video in client mode; defaults to the file name
    #[arg(long, default_value = "")]
    pub(crate) racelabel: String,

    /// YAML pipeline configuration layered over the built-in defaults
    #[arg(long, value_name = "FILE")]
    pub(crate) config: Option<PathBuf>,

    /// JSON export of race documents used for metadata in batch mode
    #[arg(long, value_name = "FILE")]
    pub(crate) race_catalog: Option<PathBuf>,

    /// Keep going with the next video when a stage fails
    #[arg(long)]
    pub(crate) best_effort: bool,

    /// Print the pending work and exit
    #[arg(long)]
    pub(crate) dry_run: bool,
}

impl RunCommand {
    pub fn execute(self) -> Result<()> {
        let start = Instant::now();

        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if self.best_effort {
            config.failure_policy = FailurePolicy::BestEffort;
        }
        let config = Arc::new(config);

        // Task codes are checked before anything touches the filesystem
        let tasks = resolve_tasks(&config, &self.tasks).context("Invalid --tasks")?;
        info!(
            "Running tasks: {}",
            tasks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let label = Some(self.racelabel.as_str()).filter(|label| !label.is_empty());
        let catalog = VideoCatalog::discover(&self.video_path, label, &config.accepted_formats)
            .with_context(|| format!("Failed to list videos at {}", self.video_path.display()))?;
        if catalog.is_empty() {
            warn!("No videos found at {}", self.video_path.display());
        }

        let mut store = ResultStore::open(&self.result_dir, config.clone(), &tasks)
            .with_context(|| format!("Failed to open result directory {}", self.result_dir.display()))?;
        let mut plan = store.plan(&catalog.videos(), &tasks)?;

        let registry = StageRegistry::from_config(&config);
        let frames = FrameBufferManager::new(
            Box::new(FfmpegBackend),
            Box::new(SystemMemory::new()),
            &config,
        );
        let mut runner = TaskRunner::new(config.clone(), registry, frames, &self.model_dir);

        let missing: Vec<Task> = runner
            .missing_stages(&tasks)
            .into_iter()
            .filter(|&task| plan.pending.get(&task).is_some_and(|videos| !videos.is_empty()))
            .collect();

        if self.dry_run {
            print_plan(&plan, &tasks, &missing);
            return Ok(());
        }
        if plan.is_empty() {
            println!("✓ Nothing to do: all {} videos are complete", catalog.len());
            return Ok(());
        }
        for task in &missing {
            warn!("No stage configured for {}; its pending videos will fail", task);
        }

        let race_info = self.race_info(&catalog)?;
        let summary = runner.run(&mut store, &catalog, &race_info, &tasks, &mut plan)?;

        println!(
            "✓ Completed in {:.1}s: {} processed, {} failed, {} skipped",
            start.elapsed().as_secs_f64(),
            summary.processed,
            summary.failed,
            summary.skipped
        );
        for (video, task, error) in &summary.failures {
            println!("  ✗ {video} {task}: {error}");
        }
        if !summary.is_success() {
            bail!("{} task runs failed", summary.failed);
        }
        Ok(())
    }

    /// Race metadata for the discovered videos
    fn race_info(&self, catalog: &VideoCatalog) -> Result<HashMap<VideoId, RaceInfo>> {
        let videos = catalog.videos();
        let source: Box<dyn RaceMetadataSource> = if catalog.is_batch() {
            match &self.race_catalog {
                Some(path) => Box::new(
                    JsonRaceCatalog::from_path(path)
                        .with_context(|| format!("Failed to load race catalog {}", path.display()))?,
                ),
                None => {
                    warn!("No --race-catalog given; stages needing race metadata will fail");
                    Box::new(NoRaceInfo)
                }
            }
        } else {
            match (&self.track, self.distance, &self.course, videos.first()) {
                (Some(track), Some(distance), Some(course), Some(video)) => {
                    Box::new(StaticRaceInfo::new(
                        video.clone(),
                        RaceInfo {
                            track: track.clone(),
                            distance,
                            course: course.clone(),
                            jockeys: self.jockeys.clone(),
                        },
                    ))
                }
                _ => {
                    warn!("Client mode without --track, --distance and --course; stages needing race metadata will fail");
                    Box::new(NoRaceInfo)
                }
            }
        };
        Ok(source.lookup(&videos)?)
    }
}

fn print_plan(plan: &WorkPlan, tasks: &[Task], missing: &[Task]) {
    println!("Pending work ({} videos):", plan.videos.len());
    for task in tasks {
        let pending = plan.pending.get(task).map_or(0, |videos| videos.len());
        let note = if missing.contains(task) {
            "  (no stage configured)"
        } else {
            ""
        };
        println!("  {task:<22} {pending:>6}{note}");
    }
    for video in &plan.videos {
        let names: Vec<&str> = plan
            .tasks_for(video, tasks)
            .into_iter()
            .map(Task::name)
            .collect();
        println!("  {video}: {}", names.join(", "));
    }
}
