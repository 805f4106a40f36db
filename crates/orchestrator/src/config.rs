//! Pipeline configuration
//!
//! A [`PipelineConfig`] is built once at startup, either from [`Default`] or from a YAML
//! file layered over the defaults, and then shared read-only by every component.

use race_vision_common::{ProcessingError, Result, Task};
use race_vision_masks::CompositionParams;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// How the completion tracker decides a task is done for a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMethod {
    /// The video appears in both scene CSV tables
    SceneTables,
    /// Every gating output directory holds an entry named after the video
    #[default]
    Artifacts,
}

/// What to do when a stage fails mid-batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the run on the first error
    #[default]
    FailFast,
    /// Log the error, skip the rest of that video and continue with the next one
    BestEffort,
}

/// One output directory of a task, relative to the result directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDir {
    pub path: PathBuf,
    /// Whether an artifact in this directory is required for completion
    #[serde(default = "default_true")]
    pub gates_completion: bool,
}

impl OutputDir {
    #[must_use]
    pub fn gating(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gates_completion: true,
        }
    }

    #[must_use]
    pub fn auxiliary(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gates_completion: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Static description of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Prerequisites plus the task itself
    pub dependencies: Vec<Task>,
    #[serde(default)]
    pub outputs: Vec<OutputDir>,
    #[serde(default)]
    pub completion: CompletionMethod,
    /// Rerunning this task may change the valid frame range of the video, so a frame
    /// buffer it loaded is never reused
    #[serde(default)]
    pub invalidates_frame_range: bool,
}

impl TaskSpec {
    fn new(dependencies: Vec<Task>, outputs: Vec<OutputDir>) -> Self {
        Self {
            dependencies,
            outputs,
            completion: CompletionMethod::Artifacts,
            invalidates_frame_range: false,
        }
    }

    /// Directories whose contents decide completion
    pub fn gating_outputs(&self) -> impl Iterator<Item = &OutputDir> {
        self.outputs.iter().filter(|dir| dir.gates_completion)
    }

    /// First declared output directory, where stages put their primary artifacts
    #[must_use]
    pub fn primary_output(&self) -> Option<&Path> {
        self.outputs.first().map(|dir| dir.path.as_path())
    }
}

/// Frame loading parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameBufferConfig {
    /// Canonical frame width after resizing
    pub width: u32,
    /// Canonical frame height after resizing
    pub height: u32,
    pub jpeg_quality: u8,
    /// Minimum fraction of system memory that must stay available while loading
    pub memory_floor: f64,
    /// Sample memory every this many retained frames
    pub memory_check_interval: usize,
    /// Source frame rates accepted after rounding
    pub accepted_frame_rates: Vec<u32>,
    /// Source frame rates sampled every second frame
    pub halved_frame_rates: Vec<u32>,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            jpeg_quality: race_vision_decoder::DEFAULT_JPEG_QUALITY,
            memory_floor: 0.30,
            memory_check_interval: 500,
            accepted_frame_rates: vec![25, 30, 50, 60],
            halved_frame_rates: vec![50, 60],
        }
    }
}

impl FrameBufferConfig {
    /// Number of source frames per retained frame
    #[must_use]
    pub fn frame_step(&self, fps: u32) -> u64 {
        if self.halved_frame_rates.contains(&fps) {
            2
        } else {
            1
        }
    }
}

/// Windows in which scene classification searches for the start and end of a race.
///
/// Start bounds are in seconds; end bounds are in milliseconds per metre of race
/// distance, measured from the start frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneWindows {
    pub start_min: f64,
    pub start_max: f64,
    /// Frames subtracted from a start prediction to obtain the true start
    pub offset: u64,
    pub end_min: f64,
    pub end_max: f64,
}

impl Default for SceneWindows {
    fn default() -> Self {
        Self {
            start_min: 0.0,
            start_max: 40.0,
            offset: 20,
            end_min: 55.0,
            end_max: 65.0,
        }
    }
}

/// Per-track tracking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackProfile {
    /// Connectivity threshold for linking subsequences
    pub conn_thres: f64,
    /// Highest saddlecloth number that can appear on this track
    pub scn_max: u32,
}

/// External program run as a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Write the composite guidance masks before running
    #[serde(default)]
    pub motion_guidance: bool,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Entries given in a file replace the built-in entry for that task only
    #[serde(deserialize_with = "merge_with_default_tasks")]
    pub tasks: BTreeMap<Task, TaskSpec>,
    /// Start/end frame table, relative to the result directory
    pub start_end_table: PathBuf,
    /// Camera change table, relative to the result directory
    pub camera_change_table: PathBuf,
    /// Video file extensions, including the dot
    pub accepted_formats: Vec<String>,
    pub frame_buffer: FrameBufferConfig,
    pub masks: CompositionParams,
    pub scene_windows: SceneWindows,
    pub failure_policy: FailurePolicy,
    pub track_profiles: BTreeMap<String, TrackProfile>,
    /// External programs implementing tasks
    pub stages: BTreeMap<Task, CommandSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tasks: default_tasks(),
            start_end_table: PathBuf::from("vid_process.csv"),
            camera_change_table: PathBuf::from("camera_change.csv"),
            accepted_formats: vec![".mp4".to_string(), ".mpg".to_string()],
            frame_buffer: FrameBufferConfig::default(),
            masks: CompositionParams::default(),
            scene_windows: SceneWindows::default(),
            failure_policy: FailurePolicy::default(),
            track_profiles: default_track_profiles(),
            stages: BTreeMap::new(),
        }
    }
}

fn default_tasks() -> BTreeMap<Task, TaskSpec> {
    use Task::{
        Detection, FrameExtractor, OpticalFlow, RailMask, RailPoleMask, SceneClassify,
        SemanticMask, Tracking,
    };

    let scene = TaskSpec {
        dependencies: vec![SceneClassify],
        outputs: Vec::new(),
        completion: CompletionMethod::SceneTables,
        invalidates_frame_range: true,
    };
    let tracking_root = Path::new("Track_Cap");
    let mut tracking_outputs = vec![OutputDir::auxiliary(tracking_root)];
    for sub in [
        "saddlecloth_with_id",
        "cap_saddlecloth_match",
        "conn_feat",
        "trip_feat",
        "trip_feat_jockey",
        "subsequences",
    ] {
        tracking_outputs.push(OutputDir::auxiliary(tracking_root.join(sub)));
    }
    tracking_outputs.push(OutputDir::gating(tracking_root.join("final_result")));

    BTreeMap::from([
        (
            FrameExtractor,
            TaskSpec::new(
                vec![SceneClassify, FrameExtractor],
                vec![OutputDir::gating("Saved_Frames")],
            ),
        ),
        (SceneClassify, scene),
        (
            RailMask,
            TaskSpec::new(vec![SceneClassify, RailMask], vec![OutputDir::gating("Rail_Masks")]),
        ),
        (
            RailPoleMask,
            TaskSpec::new(
                vec![SceneClassify, RailPoleMask],
                vec![OutputDir::gating("Rail_Pole_Masks")],
            ),
        ),
        (
            SemanticMask,
            TaskSpec::new(
                vec![SceneClassify, SemanticMask],
                vec![OutputDir::gating("Semantic_Masks")],
            ),
        ),
        (
            OpticalFlow,
            TaskSpec::new(
                vec![SceneClassify, RailMask, RailPoleMask, SemanticMask, OpticalFlow],
                vec![OutputDir::gating("Optical_Flow")],
            ),
        ),
        (
            Detection,
            TaskSpec::new(vec![SceneClassify, Detection], vec![OutputDir::gating("Detect")]),
        ),
        (
            Tracking,
            TaskSpec::new(vec![SceneClassify, Detection, Tracking], tracking_outputs),
        ),
    ])
}

fn default_track_profiles() -> BTreeMap<String, TrackProfile> {
    [("HVT", 12), ("STT", 14), ("STAWT", 14), ("Kranji", 16)]
        .into_iter()
        .map(|(track, scn_max)| {
            (
                track.to_string(),
                TrackProfile {
                    conn_thres: 0.2,
                    scn_max,
                },
            )
        })
        .collect()
}

fn merge_with_default_tasks<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<Task, TaskSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<Task, TaskSpec>::deserialize(deserializer)?;
    let mut tasks = default_tasks();
    tasks.extend(overrides);
    Ok(tasks)
}

impl PipelineConfig {
    /// Load a YAML configuration file layered over the defaults
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read and `Config` if it does not parse or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&contents)
            .map_err(|e| ProcessingError::Config(format!("{}: {e}", path.display())))?;
        info!("Loaded pipeline configuration from {}", path.display());
        Ok(config)
    }

    /// Parse a YAML document layered over the defaults
    ///
    /// # Errors
    ///
    /// Returns `Config` if the document does not parse or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ProcessingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Spec of `task`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the task has no entry.
    pub fn task(&self, task: Task) -> Result<&TaskSpec> {
        self.tasks
            .get(&task)
            .ok_or_else(|| ProcessingError::Config(format!("no entry for task {task}")))
    }

    /// Tuning profile for a track, if one is configured
    #[must_use]
    pub fn track_profile(&self, track: &str) -> Option<&TrackProfile> {
        self.track_profiles.get(track)
    }

    /// Check the task graph and numeric parameters
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for task in Task::ALL {
            let spec = self.task(task)?;
            if !spec.dependencies.contains(&task) {
                return Err(ProcessingError::Config(format!(
                    "dependencies of {task} must include the task itself"
                )));
            }
            for dep in &spec.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(ProcessingError::Config(format!(
                        "task {task} depends on unconfigured task {dep}"
                    )));
                }
            }
        }

        let mut visited = HashSet::with_capacity(self.tasks.len());
        let mut recursion_stack = HashSet::with_capacity(self.tasks.len());
        for &task in self.tasks.keys() {
            if self.has_cycle(task, &mut visited, &mut recursion_stack) {
                return Err(ProcessingError::Config(format!(
                    "task graph contains a cycle through {task}"
                )));
            }
        }

        let fb = &self.frame_buffer;
        if !(0.0..=1.0).contains(&fb.memory_floor) {
            return Err(ProcessingError::Config(format!(
                "memory_floor must be a fraction, got {}",
                fb.memory_floor
            )));
        }
        if fb.memory_check_interval == 0 {
            return Err(ProcessingError::Config(
                "memory_check_interval must be positive".to_string(),
            ));
        }
        if fb.width == 0 || fb.height == 0 {
            return Err(ProcessingError::Config(format!(
                "frame geometry {}x{} is empty",
                fb.width, fb.height
            )));
        }
        if !(1..=100).contains(&fb.jpeg_quality) {
            return Err(ProcessingError::Config(format!(
                "jpeg_quality must be within 1..=100, got {}",
                fb.jpeg_quality
            )));
        }
        if fb.accepted_frame_rates.is_empty() {
            return Err(ProcessingError::Config(
                "accepted_frame_rates is empty".to_string(),
            ));
        }
        if self.accepted_formats.is_empty() {
            return Err(ProcessingError::Config("accepted_formats is empty".to_string()));
        }
        for (task, stage) in &self.stages {
            if stage.program.trim().is_empty() {
                return Err(ProcessingError::Config(format!(
                    "stage for {task} has an empty program"
                )));
            }
        }
        Ok(())
    }

    /// Depth-first search over prerequisites, ignoring each task's own entry
    fn has_cycle(
        &self,
        task: Task,
        visited: &mut HashSet<Task>,
        recursion_stack: &mut HashSet<Task>,
    ) -> bool {
        if recursion_stack.contains(&task) {
            return true;
        }
        if visited.contains(&task) {
            return false;
        }

        visited.insert(task);
        recursion_stack.insert(task);

        if let Some(spec) = self.tasks.get(&task) {
            for &dep in spec.dependencies.iter().filter(|&&dep| dep != task) {
                if self.has_cycle(dep, visited, recursion_stack) {
                    return true;
                }
            }
        }

        recursion_stack.remove(&task);
        false
    }
}
