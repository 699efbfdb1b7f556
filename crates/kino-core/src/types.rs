use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `next_item_id` value that forces an evaluator reset on the following item.
pub const RESET_NEXT_ITEM_ID: i64 = -1;

/// Half-open frame range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.start <= frame && frame < self.end
    }
}

/// Frames selected from a single video by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointSamples {
    pub video_index: usize,
    pub frames: Vec<i64>,
}

/// Frame intervals selected from a single video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSamples {
    pub video_index: usize,
    pub intervals: Vec<Interval>,
}

/// How frames are drawn from the dataset for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampling {
    All,
    Strided { stride: i64 },
    Gather { videos: Vec<PointSamples> },
    SequenceGather { videos: Vec<SequenceSamples> },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SamplingError {
    #[error("stride must be >= 1 (got {0})")]
    InvalidStride(i64),
    #[error("gather frame index must be >= 0 (video {video_index}, frame {frame})")]
    NegativeGatherFrame { video_index: usize, frame: i64 },
    #[error("interval must satisfy 0 <= start < end (video {video_index}, [{start}, {end}))")]
    InvalidInterval {
        video_index: usize,
        start: i64,
        end: i64,
    },
}

impl Sampling {
    pub fn tag(&self) -> &'static str {
        match self {
            Sampling::All => "all",
            Sampling::Strided { .. } => "strided",
            Sampling::Gather { .. } => "gather",
            Sampling::SequenceGather { .. } => "sequence_gather",
        }
    }

    pub fn validate(&self) -> Result<(), SamplingError> {
        match self {
            Sampling::All => Ok(()),
            Sampling::Strided { stride } => {
                if *stride < 1 {
                    return Err(SamplingError::InvalidStride(*stride));
                }
                Ok(())
            }
            Sampling::Gather { videos } => {
                for samples in videos {
                    for &frame in &samples.frames {
                        if frame < 0 {
                            return Err(SamplingError::NegativeGatherFrame {
                                video_index: samples.video_index,
                                frame,
                            });
                        }
                    }
                }
                Ok(())
            }
            Sampling::SequenceGather { videos } => {
                for samples in videos {
                    for interval in &samples.intervals {
                        if interval.start < 0 || interval.is_empty() {
                            return Err(SamplingError::InvalidInterval {
                                video_index: samples.video_index,
                                start: interval.start,
                                end: interval.end,
                            });
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// A planned unit of work over a contiguous sampled slice of one video.
///
/// `item_id` is the first logical row of the slice, `next_item_id` the
/// exclusive end (or [`RESET_NEXT_ITEM_ID`] to force a reset on the item that
/// follows), and `rows_from_start` the number of output rows preceding this
/// item within its video, post-stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub video_index: usize,
    pub item_id: i64,
    pub next_item_id: i64,
    pub rows_from_start: i64,
}

/// Sampling payload carried by one load entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadPayload {
    All(Interval),
    Strided { interval: Interval, stride: i64 },
    Gather(Vec<i64>),
    SequenceGather(Vec<Interval>),
}

/// One unit handed to a load worker; indexes into the shared work-item plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEntry {
    pub work_item_index: usize,
    pub payload: LoadPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// A processing-unit placement: device kind plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceType,
    pub id: i32,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceType::Cpu,
            id: 0,
        }
    }

    pub fn gpu(id: i32) -> Self {
        Self {
            kind: DeviceType::Gpu,
            id,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DeviceType::Cpu => write!(f, "cpu{}", self.id),
            DeviceType::Gpu => write!(f, "gpu{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_half_open() {
        let i = Interval::new(10, 20);
        assert!(i.contains(10));
        assert!(i.contains(19));
        assert!(!i.contains(20));
        assert_eq!(i.len(), 10);
        assert!(!i.is_empty());
    }

    #[test]
    fn sampling_validate_rejects_bad_stride() {
        let err = Sampling::Strided { stride: 0 }.validate().unwrap_err();
        assert_eq!(err, SamplingError::InvalidStride(0));
    }

    #[test]
    fn sampling_validate_rejects_empty_interval() {
        let s = Sampling::SequenceGather {
            videos: vec![SequenceSamples {
                video_index: 3,
                intervals: vec![Interval::new(5, 5)],
            }],
        };
        match s.validate().unwrap_err() {
            SamplingError::InvalidInterval { video_index, .. } => assert_eq!(video_index, 3),
            other => panic!("expected InvalidInterval, got {other:?}"),
        }
    }

    #[test]
    fn sampling_tags_are_stable() {
        assert_eq!(Sampling::All.tag(), "all");
        assert_eq!(Sampling::Strided { stride: 2 }.tag(), "strided");
    }
}
