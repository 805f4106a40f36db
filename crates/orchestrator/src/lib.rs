//! Race video pipeline orchestrator
//!
//! Resolves requested tasks to their dependency closure, reconciles them against the
//! result directory to find the (video, task) pairs that still need work, and runs the
//! registered stages one video at a time over a shared, memory-bounded frame buffer.
//!
//! ```no_run
//! use race_vision_orchestrator::{
//!     resolve_tasks, FrameBufferManager, PipelineConfig, ResultStore, StageRegistry,
//!     SystemMemory, TaskRunner, VideoCatalog,
//! };
//! use race_vision_decoder::FfmpegBackend;
//! use std::collections::HashMap;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> race_vision_common::Result<()> {
//! let config = Arc::new(PipelineConfig::default());
//! let tasks = resolve_tasks(&config, &[5])?;
//! let catalog = VideoCatalog::discover(Path::new("videos"), None, &config.accepted_formats)?;
//! let mut store = ResultStore::open("Result", config.clone(), &tasks)?;
//! let mut plan = store.plan(&catalog.videos(), &tasks)?;
//!
//! let frames = FrameBufferManager::new(
//!     Box::new(FfmpegBackend),
//!     Box::new(SystemMemory::new()),
//!     &config,
//! );
//! let registry = StageRegistry::from_config(&config);
//! let mut runner = TaskRunner::new(config, registry, frames, "models");
//! runner.run(&mut store, &catalog, &HashMap::new(), &tasks, &mut plan)?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod context;
pub mod frame_buffer;
pub mod memory;
pub mod metadata;
pub mod resolver;
pub mod runner;
pub mod scene_tables;
pub mod stage;
pub mod store;

pub use catalog::VideoCatalog;
pub use config::{
    CommandSpec, CompletionMethod, FailurePolicy, FrameBufferConfig, OutputDir, PipelineConfig,
    SceneWindows, TaskSpec, TrackProfile,
};
pub use context::StageContext;
pub use frame_buffer::{FrameBuffer, FrameBufferManager};
pub use memory::{MemoryProbe, SystemMemory};
pub use metadata::{JsonRaceCatalog, NoRaceInfo, RaceMetadataSource, StaticRaceInfo};
pub use resolver::resolve_tasks;
pub use runner::{RunSummary, TaskRunner};
pub use scene_tables::{SceneTables, StartEndRecord};
pub use stage::{CommandStage, FrameExtractorStage, Stage, StageRegistry};
pub use store::{artifact_identity, ResultStore, WorkPlan};
