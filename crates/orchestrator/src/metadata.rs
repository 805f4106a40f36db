//! Per-video race metadata
//!
//! Batch runs look races up in an exported race catalog; client runs supply the
//! metadata of their single video on the command line.

use race_vision_common::{ProcessingError, RaceInfo, Result, VideoId};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// Looks up race metadata by video identity
pub trait RaceMetadataSource {
    /// Metadata for every requested video that is known; unknown videos are omitted
    fn lookup(&self, videos: &[VideoId]) -> Result<HashMap<VideoId, RaceInfo>>;
}

/// One race document as exported from the race database
#[derive(Debug, Clone, Deserialize)]
pub struct RaceDocument {
    #[serde(default)]
    pub framesetid: Option<u32>,
    #[serde(default)]
    pub racelabel: Option<String>,
    pub trackabbr: String,
    pub length: u32,
    pub railorcoursetype: String,
    #[serde(default)]
    pub jockeys: Vec<JockeyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JockeyEntry {
    pub jockeynumber: serde_json::Value,
    /// Finishing place; absent or null for jockeys that did not finish
    #[serde(default)]
    pub place: Option<serde_json::Value>,
}

impl RaceDocument {
    fn race_info(&self) -> Result<RaceInfo> {
        let mut jockeys = Vec::with_capacity(self.jockeys.len());
        for entry in self.jockeys.iter().filter(|j| j.place.is_some()) {
            jockeys.push(jockey_number(&entry.jockeynumber)?);
        }
        Ok(RaceInfo {
            track: self.trackabbr.clone(),
            distance: self.length,
            course: self.railorcoursetype.clone(),
            jockeys,
        })
    }
}

fn jockey_number(value: &serde_json::Value) -> Result<u32> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ProcessingError::MalformedAnnotation(format!("invalid jockey number {value}"))
    })
}

/// Race catalog held in memory, indexed by frameset id and race label
#[derive(Debug, Clone, Default)]
pub struct JsonRaceCatalog {
    by_frameset: HashMap<u32, RaceInfo>,
    by_label: HashMap<String, RaceInfo>,
}

impl JsonRaceCatalog {
    /// Load a JSON array of race documents
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read and `MalformedAnnotation` if the
    /// documents do not parse.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let documents: Vec<RaceDocument> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ProcessingError::MalformedAnnotation(format!("{}: {e}", path.display())))?;
        let catalog = Self::from_documents(&documents)?;
        debug!(
            "Loaded {} race documents from {}",
            documents.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Index documents; later documents win on duplicate keys
    ///
    /// # Errors
    ///
    /// Returns `MalformedAnnotation` for unreadable jockey numbers.
    pub fn from_documents(documents: &[RaceDocument]) -> Result<Self> {
        let mut catalog = Self::default();
        for doc in documents {
            let info = doc.race_info()?;
            match (doc.framesetid, doc.racelabel.as_deref()) {
                (Some(id), Some(label)) => {
                    catalog.by_frameset.insert(id, info.clone());
                    catalog.by_label.insert(label.to_string(), info);
                }
                (Some(id), None) => {
                    catalog.by_frameset.insert(id, info);
                }
                (None, Some(label)) => {
                    catalog.by_label.insert(label.to_string(), info);
                }
                (None, None) => warn!("Skipping race document without framesetid or racelabel"),
            }
        }
        Ok(catalog)
    }
}

impl RaceMetadataSource for JsonRaceCatalog {
    fn lookup(&self, videos: &[VideoId]) -> Result<HashMap<VideoId, RaceInfo>> {
        let found: HashMap<VideoId, RaceInfo> = videos
            .iter()
            .filter_map(|video| {
                let info = match video.frameset_id() {
                    Some(id) => self.by_frameset.get(&id),
                    None => self.by_label.get(video.as_str()),
                };
                info.map(|info| (video.clone(), info.clone()))
            })
            .collect();
        if found.len() < videos.len() {
            warn!(
                "Race metadata found for {} of {} videos",
                found.len(),
                videos.len()
            );
        }
        Ok(found)
    }
}

/// Metadata supplied directly for one video
#[derive(Debug, Clone)]
pub struct StaticRaceInfo {
    video: VideoId,
    info: RaceInfo,
}

impl StaticRaceInfo {
    #[must_use]
    pub fn new(video: VideoId, info: RaceInfo) -> Self {
        Self { video, info }
    }
}

impl RaceMetadataSource for StaticRaceInfo {
    fn lookup(&self, videos: &[VideoId]) -> Result<HashMap<VideoId, RaceInfo>> {
        Ok(videos
            .iter()
            .filter(|&video| *video == self.video)
            .map(|video| (video.clone(), self.info.clone()))
            .collect())
    }
}

/// Source that knows no races
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRaceInfo;

impl RaceMetadataSource for NoRaceInfo {
    fn lookup(&self, _videos: &[VideoId]) -> Result<HashMap<VideoId, RaceInfo>> {
        Ok(HashMap::new())
    }
}
