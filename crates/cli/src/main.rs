//! Race Vision CLI - horse-race video pipeline
//!
//! Runs the requested pipeline tasks, plus everything they depend on, over a single
//! race video or a directory of them. Work already present in the result directory is
//! skipped, so an interrupted run resumes by running the same command again.

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod run;

use run::RunCommand;

#[derive(Parser)]
#[command(
    name = "race-vision",
    version,
    about = "Incremental horse-race video analytics pipeline",
    long_about = "Runs scene classification, rail and semantic segmentation, optical flow,\n\
                  detection and tracking over race videos.\n\n\
                  Task codes:\n  \
                  -1  frame extractor\n   \
                  0  scene classification (start/end frames, camera changes)\n   \
                  1  rail mask\n   \
                  2  rail pole mask\n   \
                  3  semantic mask\n   \
                  4  optical flow\n   \
                  5  detection\n   \
                  6  tracking",
    after_help = "EXAMPLES:\n  \
                  # Batch mode: every .mp4/.mpg in a directory, metadata from a race catalog\n  \
                  race-vision --video-path ./videos --tasks 6 --race-catalog races.json --config pipeline.yaml\n\n  \
                  # Client mode: one video with its race metadata\n  \
                  race-vision --video-path race.mp4 --racelabel 20230101_R4 --tasks 4 \\\n    \
                  --track HVT --distance 1200 --course C+3 --jockeys 1 2 3 4 5 6\n\n  \
                  # Show what is still pending without running anything\n  \
                  race-vision --video-path ./videos --tasks 5 6 --dry-run"
)]
struct Cli {
    #[command(flatten)]
    run: RunCommand,

    /// Enable verbose logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    cli.run.execute()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["race-vision", "--video-path", "videos"]).unwrap();
        assert_eq!(cli.run.tasks, vec![0]);
        assert_eq!(cli.run.result_dir, std::path::PathBuf::from("./Result"));
        assert!(!cli.run.best_effort);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_client_mode_arguments() {
        let cli = Cli::try_parse_from([
            "race-vision",
            "--video-path",
            "race.mp4",
            "--tasks",
            "-1",
            "6",
            "--track",
            "HVT",
            "--distance",
            "1200",
            "--course",
            "C+3",
            "--jockeys",
            "1",
            "4",
            "9",
            "--racelabel",
            "R4",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.run.tasks, vec![-1, 6]);
        assert_eq!(cli.run.jockeys, vec![1, 4, 9]);
        assert_eq!(cli.run.distance, Some(1200));
        assert_eq!(cli.run.racelabel, "R4");
        assert!(cli.verbose);
    }

    #[test]
    fn test_video_path_required() {
        assert!(Cli::try_parse_from(["race-vision"]).is_err());
    }
}
