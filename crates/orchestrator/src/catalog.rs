//! Video discovery

use race_vision_common::{ProcessingError, Result, VideoId};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Videos available to a run, keyed by identity
#[derive(Debug, Clone)]
pub struct VideoCatalog {
    source: PathBuf,
    batch: bool,
    videos: BTreeMap<VideoId, PathBuf>,
}

impl VideoCatalog {
    /// Discover videos at `path`.
    ///
    /// A directory is scanned for files with an accepted extension, each named by its
    /// file name without the extension (batch mode). A single file is named by `label`
    /// when one is given, else by its file name without the extension (client mode).
    ///
    /// # Errors
    ///
    /// Returns `VideoNotFound` if `path` does not exist and `IoError` if a directory
    /// cannot be listed.
    pub fn discover(path: &Path, label: Option<&str>, accepted_formats: &[String]) -> Result<Self> {
        if !path.exists() {
            return Err(ProcessingError::VideoNotFound(path.display().to_string()));
        }

        let mut videos = BTreeMap::new();
        let batch = path.is_dir();
        if batch {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(stem) = strip_accepted(&name, accepted_formats) {
                    videos.insert(VideoId::new(stem), entry.path());
                }
            }
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = match label.filter(|l| !l.is_empty()) {
                Some(label) => Some(label.to_string()),
                None => strip_accepted(&name, accepted_formats).map(str::to_string),
            };
            match id {
                Some(id) => {
                    videos.insert(VideoId::new(id), path.to_path_buf());
                }
                None => warn!(
                    "{} does not have an accepted extension {:?}",
                    path.display(),
                    accepted_formats
                ),
            }
        }

        debug!("Discovered {} videos under {}", videos.len(), path.display());
        Ok(Self {
            source: path.to_path_buf(),
            batch,
            videos,
        })
    }

    /// Whether videos came from a directory scan
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.batch
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Sorted video identities
    #[must_use]
    pub fn videos(&self) -> Vec<VideoId> {
        self.videos.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.videos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    /// File backing `video`
    ///
    /// # Errors
    ///
    /// Returns `VideoNotFound` if the video is unknown or its file has gone.
    pub fn resolve(&self, video: &VideoId) -> Result<&Path> {
        self.videos
            .get(video)
            .map(PathBuf::as_path)
            .filter(|path| path.exists())
            .ok_or_else(|| ProcessingError::VideoNotFound(video.to_string()))
    }
}

fn strip_accepted<'a>(name: &'a str, accepted_formats: &[String]) -> Option<&'a str> {
    accepted_formats
        .iter()
        .find_map(|ext| name.strip_suffix(ext.as_str()))
        .filter(|stem| !stem.is_empty())
}
