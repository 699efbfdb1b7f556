use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Interval, PointSamples, Sampling, SequenceSamples};

pub const DATASET_SCHEMA_VERSION: u32 = 1;
pub const VIDEO_META_SCHEMA_VERSION: u32 = 1;
pub const JOB_SCHEMA_VERSION: u32 = 1;
pub const DB_META_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("descriptor parse error: {0}")]
    Parse(String),
    #[error("invalid descriptor: {0}")]
    Invalid(String),
}

/// Geometry and keyframe index of one encoded video.
///
/// `keyframe_positions` and `keyframe_byte_offsets` are parallel, strictly
/// increasing, and start at frame 0. The load worker extends working copies
/// with a `(frames, file_size)` sentinel pair so bracket searches always find
/// an upper bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub width: i64,
    pub height: i64,
    pub frames: i64,
    pub keyframe_positions: Vec<i64>,
    pub keyframe_byte_offsets: Vec<i64>,
}

impl VideoMetadata {
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.width <= 0 || self.height <= 0 {
            return Err(MetaError::Invalid(format!(
                "frame geometry must be positive (got {}x{})",
                self.width, self.height
            )));
        }
        if self.frames <= 0 {
            return Err(MetaError::Invalid(format!(
                "frame count must be positive (got {})",
                self.frames
            )));
        }
        if self.keyframe_positions.is_empty() {
            return Err(MetaError::Invalid("keyframe index is empty".to_string()));
        }
        if self.keyframe_positions.len() != self.keyframe_byte_offsets.len() {
            return Err(MetaError::Invalid(format!(
                "keyframe lists differ in length ({} positions, {} offsets)",
                self.keyframe_positions.len(),
                self.keyframe_byte_offsets.len()
            )));
        }
        if self.keyframe_positions[0] != 0 {
            return Err(MetaError::Invalid(format!(
                "first keyframe must be frame 0 (got {})",
                self.keyframe_positions[0]
            )));
        }
        for pair in self.keyframe_positions.windows(2) {
            if pair[1] <= pair[0] {
                return Err(MetaError::Invalid(
                    "keyframe positions must be strictly increasing".to_string(),
                ));
            }
        }
        if self.keyframe_byte_offsets[0] < 0 {
            return Err(MetaError::Invalid(
                "keyframe byte offsets must be non-negative".to_string(),
            ));
        }
        for pair in self.keyframe_byte_offsets.windows(2) {
            if pair[1] <= pair[0] {
                return Err(MetaError::Invalid(
                    "keyframe byte offsets must be strictly increasing".to_string(),
                ));
            }
        }
        if let Some(&last) = self.keyframe_positions.last() {
            if last >= self.frames {
                return Err(MetaError::Invalid(format!(
                    "keyframe position {} is past the last frame {}",
                    last,
                    self.frames - 1
                )));
            }
        }
        Ok(())
    }
}

pub fn canonicalize_video_metadata(meta: &VideoMetadata) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!(
        "video_meta_schema_version={VIDEO_META_SCHEMA_VERSION}\n"
    ));
    out.push_str(&format!(
        "{}\t{}\t{}\n",
        meta.width, meta.height, meta.frames
    ));
    for (pos, off) in meta
        .keyframe_positions
        .iter()
        .zip(meta.keyframe_byte_offsets.iter())
    {
        out.push_str(&format!("{pos}\t{off}\n"));
    }
    out.into_bytes()
}

pub fn parse_video_metadata(bytes: &[u8]) -> Result<VideoMetadata, MetaError> {
    let mut lines = header_checked_lines(bytes, "video_meta_schema_version", VIDEO_META_SCHEMA_VERSION)?;

    let geometry = lines
        .next()
        .ok_or_else(|| MetaError::Parse("missing geometry line".to_string()))?;
    let cols: Vec<&str> = geometry.split('\t').collect();
    if cols.len() != 3 {
        return Err(MetaError::Parse(
            "geometry line must be width\\theight\\tframes".to_string(),
        ));
    }
    let width = parse_i64(cols[0], "width")?;
    let height = parse_i64(cols[1], "height")?;
    let frames = parse_i64(cols[2], "frames")?;

    let mut keyframe_positions = Vec::new();
    let mut keyframe_byte_offsets = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 2 {
            return Err(MetaError::Parse(format!(
                "keyframe line {}: expected 2 columns",
                line_no + 3
            )));
        }
        keyframe_positions.push(parse_i64(cols[0], "keyframe position")?);
        keyframe_byte_offsets.push(parse_i64(cols[1], "keyframe byte offset")?);
    }

    let meta = VideoMetadata {
        width,
        height,
        frames,
        keyframe_positions,
        keyframe_byte_offsets,
    };
    meta.validate()?;
    Ok(meta)
}

/// Names and maximum geometry of the videos in one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub video_names: Vec<String>,
    pub max_width: i64,
    pub max_height: i64,
}

pub fn canonicalize_dataset_descriptor(desc: &DatasetDescriptor) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("dataset_schema_version={DATASET_SCHEMA_VERSION}\n"));
    out.push_str(&format!("{}\t{}\n", desc.max_width, desc.max_height));
    for name in &desc.video_names {
        out.push_str(name);
        out.push('\n');
    }
    out.into_bytes()
}

pub fn parse_dataset_descriptor(bytes: &[u8]) -> Result<DatasetDescriptor, MetaError> {
    let mut lines = header_checked_lines(bytes, "dataset_schema_version", DATASET_SCHEMA_VERSION)?;

    let geometry = lines
        .next()
        .ok_or_else(|| MetaError::Parse("missing max geometry line".to_string()))?;
    let cols: Vec<&str> = geometry.split('\t').collect();
    if cols.len() != 2 {
        return Err(MetaError::Parse(
            "geometry line must be max_width\\tmax_height".to_string(),
        ));
    }
    let max_width = parse_i64(cols[0], "max_width")?;
    let max_height = parse_i64(cols[1], "max_height")?;

    let video_names: Vec<String> = lines.map(|l| l.to_string()).collect();
    if video_names.is_empty() {
        return Err(MetaError::Parse("dataset has no videos".to_string()));
    }

    Ok(DatasetDescriptor {
        video_names,
        max_width,
        max_height,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobColumn {
    pub id: i32,
    pub name: String,
}

/// Persisted description of one job: how its output is chunked and named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: i32,
    pub work_item_size: i64,
    pub sampling: Sampling,
    pub columns: Vec<JobColumn>,
}

pub fn canonicalize_job_descriptor(desc: &JobDescriptor) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("job_schema_version={JOB_SCHEMA_VERSION}\n"));
    out.push_str(&format!("id\t{}\n", desc.id));
    out.push_str(&format!("work_item_size\t{}\n", desc.work_item_size));
    out.push_str(&format!("sampling\t{}\n", desc.sampling.tag()));
    match &desc.sampling {
        Sampling::All => {}
        Sampling::Strided { stride } => {
            out.push_str(&format!("stride\t{stride}\n"));
        }
        Sampling::Gather { videos } => {
            for samples in videos {
                let frames: Vec<String> = samples.frames.iter().map(|f| f.to_string()).collect();
                out.push_str(&format!(
                    "gather\t{}\t{}\n",
                    samples.video_index,
                    frames.join(",")
                ));
            }
        }
        Sampling::SequenceGather { videos } => {
            for samples in videos {
                let intervals: Vec<String> = samples
                    .intervals
                    .iter()
                    .map(|i| format!("{}-{}", i.start, i.end))
                    .collect();
                out.push_str(&format!(
                    "sequence\t{}\t{}\n",
                    samples.video_index,
                    intervals.join(",")
                ));
            }
        }
    }
    for column in &desc.columns {
        out.push_str(&format!("column\t{}\t{}\n", column.id, column.name));
    }
    out.into_bytes()
}

pub fn parse_job_descriptor(bytes: &[u8]) -> Result<JobDescriptor, MetaError> {
    let lines = header_checked_lines(bytes, "job_schema_version", JOB_SCHEMA_VERSION)?;

    let mut id: Option<i32> = None;
    let mut work_item_size: Option<i64> = None;
    let mut sampling_tag: Option<String> = None;
    let mut stride: Option<i64> = None;
    let mut gather: Vec<PointSamples> = Vec::new();
    let mut sequences: Vec<SequenceSamples> = Vec::new();
    let mut columns: Vec<JobColumn> = Vec::new();

    for (line_no, line) in lines.enumerate() {
        let cols: Vec<&str> = line.split('\t').collect();
        let context = |msg: &str| MetaError::Parse(format!("line {}: {msg}", line_no + 2));
        match cols[0] {
            "id" if cols.len() == 2 => {
                id = Some(
                    cols[1]
                        .parse()
                        .map_err(|_| context("invalid job id"))?,
                );
            }
            "work_item_size" if cols.len() == 2 => {
                work_item_size = Some(
                    cols[1]
                        .parse()
                        .map_err(|_| context("invalid work_item_size"))?,
                );
            }
            "sampling" if cols.len() == 2 => {
                sampling_tag = Some(cols[1].to_string());
            }
            "stride" if cols.len() == 2 => {
                stride = Some(cols[1].parse().map_err(|_| context("invalid stride"))?);
            }
            "gather" if cols.len() == 3 => {
                let video_index = cols[1]
                    .parse()
                    .map_err(|_| context("invalid gather video index"))?;
                let frames = parse_i64_list(cols[2])
                    .map_err(|_| context("invalid gather frame list"))?;
                gather.push(PointSamples {
                    video_index,
                    frames,
                });
            }
            "sequence" if cols.len() == 3 => {
                let video_index = cols[1]
                    .parse()
                    .map_err(|_| context("invalid sequence video index"))?;
                let intervals = parse_interval_list(cols[2])
                    .map_err(|_| context("invalid sequence interval list"))?;
                sequences.push(SequenceSamples {
                    video_index,
                    intervals,
                });
            }
            "column" if cols.len() == 3 => {
                let id = cols[1].parse().map_err(|_| context("invalid column id"))?;
                columns.push(JobColumn {
                    id,
                    name: cols[2].to_string(),
                });
            }
            _ => return Err(context("unknown record")),
        }
    }

    let sampling = match sampling_tag.as_deref() {
        Some("all") => Sampling::All,
        Some("strided") => Sampling::Strided {
            stride: stride
                .ok_or_else(|| MetaError::Parse("strided sampling missing stride".to_string()))?,
        },
        Some("gather") => Sampling::Gather { videos: gather },
        Some("sequence_gather") => Sampling::SequenceGather { videos: sequences },
        Some(other) => {
            return Err(MetaError::Parse(format!("unknown sampling tag {other:?}")));
        }
        None => return Err(MetaError::Parse("missing sampling record".to_string())),
    };

    Ok(JobDescriptor {
        id: id.ok_or_else(|| MetaError::Parse("missing id record".to_string()))?,
        work_item_size: work_item_size
            .ok_or_else(|| MetaError::Parse("missing work_item_size record".to_string()))?,
        sampling,
        columns,
    })
}

/// Registry of datasets and the jobs run against them, kept at the store
/// root and read-modify-written by the master at job completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseMeta {
    datasets: BTreeMap<String, i32>,
    jobs: BTreeMap<i32, (i32, String)>,
}

impl DatabaseMeta {
    pub fn dataset_id(&self, name: &str) -> Option<i32> {
        self.datasets.get(name).copied()
    }

    pub fn register_dataset(&mut self, name: &str) -> i32 {
        if let Some(id) = self.datasets.get(name) {
            return *id;
        }
        let id = self.datasets.values().copied().max().map_or(0, |m| m + 1);
        self.datasets.insert(name.to_string(), id);
        id
    }

    pub fn add_job(&mut self, dataset_id: i32, job_name: &str) -> i32 {
        let id = self.jobs.keys().copied().max().map_or(0, |m| m + 1);
        self.jobs.insert(id, (dataset_id, job_name.to_string()));
        id
    }

    pub fn jobs(&self) -> impl Iterator<Item = (i32, i32, &str)> {
        self.jobs
            .iter()
            .map(|(id, (dataset_id, name))| (*id, *dataset_id, name.as_str()))
    }
}

pub fn canonicalize_database_meta(meta: &DatabaseMeta) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("db_meta_schema_version={DB_META_SCHEMA_VERSION}\n"));
    for (name, id) in &meta.datasets {
        out.push_str(&format!("dataset\t{id}\t{name}\n"));
    }
    for (id, (dataset_id, name)) in &meta.jobs {
        out.push_str(&format!("job\t{id}\t{dataset_id}\t{name}\n"));
    }
    out.into_bytes()
}

pub fn parse_database_meta(bytes: &[u8]) -> Result<DatabaseMeta, MetaError> {
    let lines = header_checked_lines(bytes, "db_meta_schema_version", DB_META_SCHEMA_VERSION)?;

    let mut meta = DatabaseMeta::default();
    for (line_no, line) in lines.enumerate() {
        let cols: Vec<&str> = line.split('\t').collect();
        let context = |msg: &str| MetaError::Parse(format!("line {}: {msg}", line_no + 2));
        match cols[0] {
            "dataset" if cols.len() == 3 => {
                let id = cols[1].parse().map_err(|_| context("invalid dataset id"))?;
                meta.datasets.insert(cols[2].to_string(), id);
            }
            "job" if cols.len() == 4 => {
                let id = cols[1].parse().map_err(|_| context("invalid job id"))?;
                let dataset_id = cols[2]
                    .parse()
                    .map_err(|_| context("invalid dataset id"))?;
                meta.jobs.insert(id, (dataset_id, cols[3].to_string()));
            }
            _ => return Err(context("unknown record")),
        }
    }
    Ok(meta)
}

fn header_checked_lines<'a>(
    bytes: &'a [u8],
    key: &str,
    version: u32,
) -> Result<impl Iterator<Item = &'a str>, MetaError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| MetaError::Parse(format!("descriptor is not utf-8: {e}")))?;
    let mut lines = text.lines();
    let first = lines
        .by_ref()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| MetaError::Parse("empty descriptor".to_string()))?;
    let Some((k, v)) = first.split_once('=') else {
        return Err(MetaError::Parse(format!("missing {key} header")));
    };
    if k.trim() != key {
        return Err(MetaError::Parse(format!("first line must be {key}=<n>")));
    }
    let parsed: u32 = v
        .trim()
        .parse()
        .map_err(|_| MetaError::Parse(format!("invalid {key}")))?;
    if parsed != version {
        return Err(MetaError::Parse(format!("unsupported {key} {parsed}")));
    }
    Ok(lines.filter(|l| !l.trim().is_empty()))
}

fn parse_i64(raw: &str, what: &str) -> Result<i64, MetaError> {
    raw.trim()
        .parse()
        .map_err(|_| MetaError::Parse(format!("invalid {what}: {raw:?}")))
}

fn parse_i64_list(raw: &str) -> Result<Vec<i64>, std::num::ParseIntError> {
    raw.split(',').map(|s| s.trim().parse()).collect()
}

fn parse_interval_list(raw: &str) -> Result<Vec<Interval>, ()> {
    raw.split(',')
        .map(|s| {
            let (a, b) = s.split_once('-').ok_or(())?;
            Ok(Interval::new(
                a.trim().parse().map_err(|_| ())?,
                b.trim().parse().map_err(|_| ())?,
            ))
        })
        .collect()
}
