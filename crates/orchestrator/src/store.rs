//! Completion tracking against the result directory
//!
//! The result directory is the only record of progress: a task is done for a video
//! when its artifacts are there (or, for scene classification, when both CSV tables
//! hold a row for it). Everything is re-derived on every run, so an interrupted run
//! resumes by simply starting again.

use crate::config::{CompletionMethod, PipelineConfig};
use crate::scene_tables::SceneTables;
use race_vision_common::{Result, Task, VideoId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// What still has to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    /// Videos pending for at least one task, sorted
    pub videos: Vec<VideoId>,
    /// Pending videos per task
    pub pending: BTreeMap<Task, BTreeSet<VideoId>>,
}

impl WorkPlan {
    #[must_use]
    pub fn is_pending(&self, task: Task, video: &VideoId) -> bool {
        self.pending
            .get(&task)
            .is_some_and(|videos| videos.contains(video))
    }

    /// Remove `video` from the pending set of `task`
    pub fn mark_done(&mut self, task: Task, video: &VideoId) {
        if let Some(videos) = self.pending.get_mut(&task) {
            videos.remove(video);
        }
    }

    /// Tasks still pending for `video`, in the order given
    #[must_use]
    pub fn tasks_for(&self, video: &VideoId, order: &[Task]) -> Vec<Task> {
        order
            .iter()
            .copied()
            .filter(|&task| self.is_pending(task, video))
            .collect()
    }

    /// Number of pending (video, task) pairs
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }
}

/// Keep the text before the first `.`, then before the first `&`
#[must_use]
pub fn artifact_identity(name: &str) -> &str {
    let stem = name.split('.').next().unwrap_or(name);
    stem.split('&').next().unwrap_or(stem)
}

/// The on-disk result store
#[derive(Debug)]
pub struct ResultStore {
    root: PathBuf,
    config: Arc<PipelineConfig>,
    scene_tables: SceneTables,
}

impl ResultStore {
    /// Prepare `root` for the resolved `tasks` and load the scene tables.
    ///
    /// Creates the root, every output directory declared by those tasks, and both
    /// scene tables (with header rows) when missing.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if a directory cannot be created and scene table errors as
    /// they occur.
    pub fn open(root: impl Into<PathBuf>, config: Arc<PipelineConfig>, tasks: &[Task]) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        for &task in tasks {
            for dir in &config.task(task)?.outputs {
                fs::create_dir_all(root.join(&dir.path))?;
            }
        }

        let scene_tables = SceneTables::open(
            &root.join(&config.start_end_table),
            &root.join(&config.camera_change_table),
        )?;
        debug!("Opened result store at {}", root.display());
        Ok(Self {
            root,
            config,
            scene_tables,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn scene_tables(&self) -> &SceneTables {
        &self.scene_tables
    }

    pub fn scene_tables_mut(&mut self) -> &mut SceneTables {
        &mut self.scene_tables
    }

    /// Absolute primary output directory of `task`, if it declares any
    ///
    /// # Errors
    ///
    /// Returns `Config` if the task is not configured.
    pub fn output_dir(&self, task: Task) -> Result<Option<PathBuf>> {
        Ok(self
            .config
            .task(task)?
            .primary_output()
            .map(|dir| self.root.join(dir)))
    }

    /// Videos among `videos` that still need `task`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the task is not configured and `IoError` if an output
    /// directory cannot be listed.
    pub fn select_pending(&self, videos: &[VideoId], task: Task) -> Result<BTreeSet<VideoId>> {
        let spec = self.config.task(task)?;
        let pending = match spec.completion {
            CompletionMethod::SceneTables => videos
                .iter()
                .filter(|video| !self.scene_tables.is_classified(video))
                .cloned()
                .collect(),
            CompletionMethod::Artifacts => {
                let mut pending = BTreeSet::new();
                for dir in spec.gating_outputs() {
                    let present = artifact_identities(&self.root.join(&dir.path))?;
                    pending.extend(
                        videos
                            .iter()
                            .filter(|video| !present.contains(video.as_str()))
                            .cloned(),
                    );
                }
                pending
            }
        };
        Ok(pending)
    }

    /// Pending sets of every task and the sorted union of their videos
    ///
    /// # Errors
    ///
    /// Propagates [`ResultStore::select_pending`] errors.
    pub fn plan(&self, videos: &[VideoId], tasks: &[Task]) -> Result<WorkPlan> {
        let mut plan = WorkPlan::default();
        let mut union = BTreeSet::new();
        for &task in tasks {
            let pending = self.select_pending(videos, task)?;
            info!(
                "{}: {} of {} videos pending",
                task,
                pending.len(),
                videos.len()
            );
            union.extend(pending.iter().cloned());
            plan.pending.insert(task, pending);
        }
        plan.videos = union.into_iter().collect();
        Ok(plan)
    }
}

/// Normalized names of the entries in `dir`; a missing directory is empty
fn artifact_identities(dir: &Path) -> Result<HashSet<String>> {
    if !dir.is_dir() {
        return Ok(HashSet::new());
    }
    let mut names = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        names.insert(artifact_identity(&name.to_string_lossy()).to_string());
    }
    Ok(names)
}
