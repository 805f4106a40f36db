//! Stage trait, registry and built-in stages

use crate::config::{CommandSpec, CompletionMethod, PipelineConfig};
use crate::context::StageContext;
use race_vision_common::{ProcessingError, Result, Task};
use race_vision_masks::GuidanceMasks;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Scratch space under the result directory; its entries never count as artifacts
pub const WORK_DIR: &str = ".work";

/// One pipeline step. A stage reads its inputs from the context and the result
/// directory and writes all of its outputs to disk.
pub trait Stage {
    /// Task this stage implements
    fn task(&self) -> Task;

    /// Process the context's video
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<()>;
}

/// Stages by task, built once at startup
#[derive(Default)]
pub struct StageRegistry {
    stages: BTreeMap<Task, Box<dyn Stage>>,
}

impl StageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in stages plus a [`CommandStage`] for every configured program.
    /// Configured programs take precedence.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FrameExtractorStage));
        for (&task, spec) in &config.stages {
            registry.register(Box::new(CommandStage::new(task, spec.clone())));
        }
        registry
    }

    /// Register a stage, replacing any stage previously registered for its task
    pub fn register(&mut self, stage: Box<dyn Stage>) {
        let task = stage.task();
        info!("Registering stage for {}", task);
        if self.stages.insert(task, stage).is_some() {
            debug!("Replaced previous stage for {}", task);
        }
    }

    /// Stage registered for `task`
    ///
    /// # Errors
    ///
    /// Returns `NoStageRegistered` if there is none.
    pub fn get(&self, task: Task) -> Result<&dyn Stage> {
        self.stages
            .get(&task)
            .map(|stage| &**stage)
            .ok_or_else(|| ProcessingError::NoStageRegistered(task.to_string()))
    }

    #[must_use]
    pub fn contains(&self, task: Task) -> bool {
        self.stages.contains_key(&task)
    }

    /// Tasks that have a stage, in code order
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.stages.keys().copied().collect()
    }
}

/// Writes the classified frame range as `<video>/img%06d.jpg` into the task's output
/// directory.
///
/// Frames are written to a scratch directory first and moved into place once all of
/// them are on disk, so an interrupted run never leaves a directory that looks
/// complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameExtractorStage;

impl Stage for FrameExtractorStage {
    fn task(&self) -> Task {
        Task::FrameExtractor
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let video = ctx.video().to_string();
        let target = ctx.output_dir()?.join(&video);
        let scratch = ctx.result_dir().join(WORK_DIR).join(format!("{video}_frames"));
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::create_dir_all(&scratch)?;

        let buffer = ctx.load_race_frames()?;
        for (offset, frame) in (buffer.start()..).zip(buffer.frames()) {
            fs::write(scratch.join(format!("img{offset:06}.jpg")), frame)?;
        }
        let written = buffer.len();

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&scratch, &target)?;
        info!("Saved {} frames of {} to {}", written, video, target.display());
        Ok(())
    }
}

/// Runs an external program, typically a model inference script, for one task.
///
/// Arguments may contain placeholders that are replaced per video: `{video}`,
/// `{video_path}`, `{result_dir}`, `{model_dir}`, `{output_dir}`, `{start_frame}`,
/// `{end_frame}`, `{fps}`, `{track}`, `{distance}`, `{course}`, `{jockeys}` and
/// `{guidance_path}`. Unknown placeholders are passed through unchanged.
#[derive(Debug, Clone)]
pub struct CommandStage {
    task: Task,
    spec: CommandSpec,
}

impl CommandStage {
    #[must_use]
    pub fn new(task: Task, spec: CommandSpec) -> Self {
        Self { task, spec }
    }

    fn write_guidance(&self, ctx: &StageContext<'_>) -> Result<PathBuf> {
        let (start, _) = ctx.start_end()?;
        let masks = ctx.motion_guidance_masks()?;
        let path = ctx
            .result_dir()
            .join(WORK_DIR)
            .join(format!("{}_guidance.json", ctx.video()));
        GuidanceMasks::from_masks(&masks, start).save(&path)?;
        debug!("Wrote {} guidance masks to {}", masks.len_of(ndarray::Axis(0)), path.display());
        Ok(path)
    }

    fn failure(&self, ctx: &StageContext<'_>, reason: String) -> ProcessingError {
        ProcessingError::StageFailed {
            task: self.task.to_string(),
            video: ctx.video().to_string(),
            reason,
        }
    }
}

impl Stage for CommandStage {
    fn task(&self) -> Task {
        self.task
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let guidance = if self.spec.motion_guidance {
            Some(self.write_guidance(ctx)?)
        } else {
            None
        };

        let args = self
            .spec
            .args
            .iter()
            .map(|arg| expand(arg, ctx, guidance.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let mut command = Command::new(&self.spec.program);
        command.args(&args);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        info!(
            "Running {} for {}: {} {}",
            self.task,
            ctx.video(),
            self.spec.program,
            args.join(" ")
        );

        let output = command
            .output()
            .map_err(|e| self.failure(ctx, format!("failed to start {}: {e}", self.spec.program)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{} stdout: {}", self.spec.program, stdout.trim());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let status = output
                .status
                .code()
                .map_or_else(|| "terminated by signal".to_string(), |code| format!("exit code {code}"));
            return Err(self.failure(ctx, format!("{}: {}", status, stderr.trim())));
        }

        if ctx.config().task(self.task)?.completion == CompletionMethod::SceneTables {
            ctx.reload_scene_tables()?;
            if ctx.start_end().is_err() || ctx.camera_changes().is_err() {
                warn!(
                    "{} finished without recording scene results for {}",
                    self.spec.program,
                    ctx.video()
                );
            }
        }
        Ok(())
    }
}

/// Replace every known `{name}` placeholder in `template`
fn expand(template: &str, ctx: &StageContext<'_>, guidance: Option<&Path>) -> Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        expanded.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            expanded.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let name = &after[..close];
        match placeholder(name, ctx, guidance)? {
            Some(value) => expanded.push_str(&value),
            None => {
                expanded.push('{');
                expanded.push_str(name);
                expanded.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

fn placeholder(name: &str, ctx: &StageContext<'_>, guidance: Option<&Path>) -> Result<Option<String>> {
    let value = match name {
        "video" => ctx.video().to_string(),
        "video_path" => ctx.video_path().display().to_string(),
        "result_dir" => ctx.result_dir().display().to_string(),
        "model_dir" => ctx.model_dir().display().to_string(),
        "output_dir" => ctx.output_dir()?.display().to_string(),
        "start_frame" => ctx.start_end()?.0.to_string(),
        "end_frame" => ctx.start_end()?.1.to_string(),
        "fps" => ctx.effective_fps()?.to_string(),
        "track" => ctx.require_race_info()?.track.clone(),
        "distance" => ctx.require_race_info()?.distance.to_string(),
        "course" => ctx.require_race_info()?.course.clone(),
        "jockeys" => ctx
            .require_race_info()?
            .jockeys
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","),
        "guidance_path" => guidance
            .ok_or_else(|| {
                ProcessingError::Config(format!(
                    "{{guidance_path}} used by {} without motion_guidance",
                    ctx.task()
                ))
            })?
            .display()
            .to_string(),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_buffer::testing::{ScriptedMemory, SyntheticBackend};
    use crate::frame_buffer::FrameBufferManager;
    use crate::scene_tables::StartEndRecord;
    use crate::store::ResultStore;
    use race_vision_common::{RaceInfo, VideoId};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        video: VideoId,
        video_path: PathBuf,
        config: Arc<PipelineConfig>,
        store: ResultStore,
        frames: FrameBufferManager,
        info: RaceInfo,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let video_path = dir.path().join("0042.mp4");
        fs::write(&video_path, b"").unwrap();
        let mut config = PipelineConfig::default();
        config.frame_buffer.width = 8;
        config.frame_buffer.height = 4;
        let config = Arc::new(config);
        let store = ResultStore::open(dir.path().join("Result"), config.clone(), &Task::ALL).unwrap();
        let frames = FrameBufferManager::new(
            Box::new(SyntheticBackend::new(30.0, 100)),
            Box::new(ScriptedMemory::plenty()),
            &config,
        );
        Fixture {
            dir,
            video: VideoId::from("0042"),
            video_path,
            config,
            store,
            frames,
            info: RaceInfo {
                track: "STT".to_string(),
                distance: 1650,
                course: "A+3".to_string(),
                jockeys: vec![3, 8],
            },
        }
    }

    impl Fixture {
        fn context(&mut self, task: Task) -> StageContext<'_> {
            StageContext::new(
                &self.video,
                &self.video_path,
                task,
                self.dir.path(),
                &self.config,
                &mut self.store,
                &mut self.frames,
                Some(&self.info),
            )
        }

        fn classify(&mut self, start: u64, end: u64) {
            let video = self.video.clone();
            let mut ctx = self.context(Task::SceneClassify);
            ctx.record_start_end(&StartEndRecord::new(&video, start, end))
                .unwrap();
            ctx.record_camera_changes(&[]).unwrap();
        }

        fn result(&self) -> PathBuf {
            self.dir.path().join("Result")
        }
    }

    fn command(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            working_dir: None,
            motion_guidance: false,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut config = PipelineConfig::default();
        config
            .stages
            .insert(Task::Detection, command("detect", &[]));
        let registry = StageRegistry::from_config(&config);
        assert_eq!(registry.tasks(), vec![Task::FrameExtractor, Task::Detection]);
        assert_eq!(registry.get(Task::Detection).unwrap().task(), Task::Detection);
        assert!(matches!(
            registry.get(Task::Tracking),
            Err(ProcessingError::NoStageRegistered(_))
        ));
    }

    #[test]
    fn test_frame_extractor_writes_numbered_frames() {
        let mut fx = fixture();
        fx.classify(5, 9);
        let mut ctx = fx.context(Task::FrameExtractor);
        FrameExtractorStage.run(&mut ctx).unwrap();

        let out = fx.result().join("Saved_Frames/0042");
        let mut names: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "img000005.jpg",
                "img000006.jpg",
                "img000007.jpg",
                "img000008.jpg",
                "img000009.jpg"
            ]
        );
        let bytes = fs::read(out.join("img000007.jpg")).unwrap();
        assert!(race_vision_decoder::decode_jpeg(&bytes).is_ok());
        assert!(!fx.result().join(WORK_DIR).join("0042_frames").exists());
    }

    #[test]
    fn test_frame_extractor_requires_classification() {
        let mut fx = fixture();
        let mut ctx = fx.context(Task::FrameExtractor);
        let err = FrameExtractorStage.run(&mut ctx).unwrap_err();
        assert!(matches!(err, ProcessingError::MissingSceneResult(_)));
        assert!(!fx.result().join("Saved_Frames/0042").exists());
    }

    #[test]
    fn test_placeholder_expansion() {
        let mut fx = fixture();
        fx.classify(12, 340);
        let ctx = fx.context(Task::Detection);
        let expanded = expand(
            "--video={video} --range={start_frame}:{end_frame} --fps={fps} {track}/{distance}/{course} {jockeys} {unknown} {open",
            &ctx,
            None,
        )
        .unwrap();
        assert_eq!(
            expanded,
            "--video=0042 --range=12:340 --fps=30 STT/1650/A+3 3,8 {unknown} {open"
        );
        let out = expand("{output_dir}", &ctx, None).unwrap();
        assert!(out.ends_with("Detect"));
        assert!(expand("{guidance_path}", &ctx, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_stage_success_and_failure() {
        let mut fx = fixture();
        fx.classify(0, 10);

        let ok = CommandStage::new(
            Task::Detection,
            command("sh", &["-c", "touch {output_dir}/{video}.json"]),
        );
        ok.run(&mut fx.context(Task::Detection)).unwrap();
        assert!(fx.result().join("Detect/0042.json").is_file());

        let failing = CommandStage::new(
            Task::Detection,
            command("sh", &["-c", "echo model missing >&2; exit 3"]),
        );
        let err = failing.run(&mut fx.context(Task::Detection)).unwrap_err();
        match err {
            ProcessingError::StageFailed { reason, video, .. } => {
                assert_eq!(video, "0042");
                assert!(reason.contains("exit code 3"));
                assert!(reason.contains("model missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let missing = CommandStage::new(Task::Detection, command("/nonexistent/detect", &[]));
        assert!(missing.run(&mut fx.context(Task::Detection)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_stage_reloads_scene_tables() {
        let mut fx = fixture();
        let script = "echo '{video},STT,A+3,1650,,30,,,,,25,900' >> {result_dir}/vid_process.csv \
                      && echo '{video},100,104' >> {result_dir}/camera_change.csv";
        let stage = CommandStage::new(Task::SceneClassify, command("sh", &["-c", script]));
        let mut ctx = fx.context(Task::SceneClassify);
        stage.run(&mut ctx).unwrap();
        assert_eq!(ctx.start_end().unwrap(), (25, 900));
        assert_eq!(ctx.camera_changes().unwrap(), &[(100, 104)][..]);
    }
}
