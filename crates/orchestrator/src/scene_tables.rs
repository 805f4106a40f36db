//! Start/end frame and camera change tables written by scene classification

use race_vision_common::{ProcessingError, Result, VideoId};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Header of the start/end frame table
pub const START_END_HEADER: [&str; 12] = [
    "raceLabel",
    "track",
    "course",
    "raceDist",
    "md5",
    "fps",
    "coursePred",
    "raceNumPred",
    "raceDistPred",
    "raceTimePred",
    "startFrmNum",
    "finishFrmNum",
];

/// Header of the camera change table; rows carry any number of pairs
pub const CAMERA_CHANGE_HEADER: [&str; 10] = [
    "raceLabel",
    "cc0_start",
    "cc0_end",
    "cc1_start",
    "cc1_end",
    "cc2_start",
    "cc2_end",
    "cc3_start",
    "cc3_end",
    "...",
];

/// One row of the start/end frame table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartEndRecord {
    #[serde(rename = "raceLabel")]
    pub race_label: String,
    pub track: String,
    pub course: String,
    #[serde(rename = "raceDist")]
    pub race_dist: String,
    pub md5: String,
    pub fps: String,
    #[serde(rename = "coursePred")]
    pub course_pred: String,
    #[serde(rename = "raceNumPred")]
    pub race_num_pred: String,
    #[serde(rename = "raceDistPred")]
    pub race_dist_pred: String,
    #[serde(rename = "raceTimePred")]
    pub race_time_pred: String,
    #[serde(rename = "startFrmNum")]
    pub start_frame: u64,
    #[serde(rename = "finishFrmNum")]
    pub finish_frame: u64,
}

impl StartEndRecord {
    /// Record with only the label and frame range filled in
    #[must_use]
    pub fn new(video: &VideoId, start_frame: u64, finish_frame: u64) -> Self {
        Self {
            race_label: video.to_string(),
            start_frame,
            finish_frame,
            ..Self::default()
        }
    }
}

/// Both scene tables, mirrored in memory
#[derive(Debug)]
pub struct SceneTables {
    start_end_path: PathBuf,
    camera_change_path: PathBuf,
    start_end: HashMap<VideoId, (u64, u64)>,
    camera_changes: HashMap<VideoId, Vec<(u64, u64)>>,
}

impl SceneTables {
    /// Open both tables, creating them with a header row when missing
    ///
    /// # Errors
    ///
    /// Returns `Csv` if a table cannot be read or written and `MalformedAnnotation` if a
    /// row holds something other than integer frame numbers.
    pub fn open(start_end_path: &Path, camera_change_path: &Path) -> Result<Self> {
        ensure_table(start_end_path, &START_END_HEADER)?;
        ensure_table(camera_change_path, &CAMERA_CHANGE_HEADER)?;

        let tables = Self {
            start_end: read_start_end(start_end_path)?,
            camera_changes: read_camera_changes(camera_change_path)?,
            start_end_path: start_end_path.to_path_buf(),
            camera_change_path: camera_change_path.to_path_buf(),
        };
        debug!(
            "Loaded {} start/end rows and {} camera change rows",
            tables.start_end.len(),
            tables.camera_changes.len()
        );
        Ok(tables)
    }

    /// Re-read both tables, picking up rows appended by external programs
    ///
    /// # Errors
    ///
    /// Same as [`SceneTables::open`].
    pub fn reload(&mut self) -> Result<()> {
        self.start_end = read_start_end(&self.start_end_path)?;
        self.camera_changes = read_camera_changes(&self.camera_change_path)?;
        Ok(())
    }

    #[must_use]
    pub fn start_end(&self, video: &VideoId) -> Option<(u64, u64)> {
        self.start_end.get(video).copied()
    }

    #[must_use]
    pub fn camera_changes(&self, video: &VideoId) -> Option<&[(u64, u64)]> {
        self.camera_changes.get(video).map(Vec::as_slice)
    }

    /// Whether the video has rows in both tables
    #[must_use]
    pub fn is_classified(&self, video: &VideoId) -> bool {
        self.start_end.contains_key(video) && self.camera_changes.contains_key(video)
    }

    /// Append a start/end row and make it visible to later lookups
    ///
    /// # Errors
    ///
    /// Returns `Csv` if the row cannot be appended.
    pub fn record_start_end(&mut self, record: &StartEndRecord) -> Result<()> {
        let file = append_to(&self.start_end_path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .serialize(record)
            .map_err(|e| csv_error(&self.start_end_path, &e))?;
        writer.flush()?;
        self.start_end.insert(
            VideoId::new(record.race_label.clone()),
            (record.start_frame, record.finish_frame),
        );
        Ok(())
    }

    /// Append a camera change row and make it visible to later lookups
    ///
    /// # Errors
    ///
    /// Returns `Csv` if the row cannot be appended.
    pub fn record_camera_changes(&mut self, video: &VideoId, changes: &[(u64, u64)]) -> Result<()> {
        let file = append_to(&self.camera_change_path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        let mut row = Vec::with_capacity(1 + changes.len() * 2);
        row.push(video.to_string());
        for (start, end) in changes {
            row.push(start.to_string());
            row.push(end.to_string());
        }
        writer
            .write_record(&row)
            .map_err(|e| csv_error(&self.camera_change_path, &e))?;
        writer.flush()?;
        self.camera_changes.insert(video.clone(), changes.to_vec());
        Ok(())
    }
}

fn csv_error(path: &Path, err: &csv::Error) -> ProcessingError {
    ProcessingError::Csv(format!("{}: {err}", path.display()))
}

fn append_to(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().append(true).open(path)?)
}

fn ensure_table(path: &Path, header: &[&str]) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, &e))?;
    writer
        .write_record(header)
        .map_err(|e| csv_error(path, &e))?;
    writer.flush()?;
    debug!("Created {}", path.display());
    Ok(())
}

fn parse_frame(path: &Path, line: Option<u64>, field: &str) -> Result<u64> {
    field.trim().parse().map_err(|_| {
        ProcessingError::MalformedAnnotation(format!(
            "{} line {}: {field:?} is not a frame number",
            path.display(),
            line.unwrap_or(0)
        ))
    })
}

fn reader_for(path: &Path) -> Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, &e))
}

/// Label from column 0, start and end from the last two columns
fn read_start_end(path: &Path) -> Result<HashMap<VideoId, (u64, u64)>> {
    let mut rows = HashMap::new();
    for record in reader_for(path)?.records() {
        let record = record.map_err(|e| csv_error(path, &e))?;
        let line = record.position().map(csv::Position::line);
        let n = record.len();
        if n < 3 {
            return Err(ProcessingError::MalformedAnnotation(format!(
                "{} line {}: expected label, start and end columns",
                path.display(),
                line.unwrap_or(0)
            )));
        }
        let start = parse_frame(path, line, &record[n - 2])?;
        let end = parse_frame(path, line, &record[n - 1])?;
        rows.insert(VideoId::new(&record[0]), (start, end));
    }
    Ok(rows)
}

/// Label from column 0 followed by `(start, end)` pairs
fn read_camera_changes(path: &Path) -> Result<HashMap<VideoId, Vec<(u64, u64)>>> {
    let mut rows = HashMap::new();
    for record in reader_for(path)?.records() {
        let record = record.map_err(|e| csv_error(path, &e))?;
        let line = record.position().map(csv::Position::line);
        let Some(label) = record.get(0) else {
            continue;
        };
        let values = record
            .iter()
            .skip(1)
            .filter(|field| !field.trim().is_empty())
            .map(|field| parse_frame(path, line, field))
            .collect::<Result<Vec<u64>>>()?;
        if values.len() % 2 != 0 {
            return Err(ProcessingError::MalformedAnnotation(format!(
                "{} line {}: camera changes must come in start/end pairs",
                path.display(),
                line.unwrap_or(0)
            )));
        }
        let pairs = values.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect();
        rows.insert(VideoId::new(label), pairs);
    }
    Ok(rows)
}
