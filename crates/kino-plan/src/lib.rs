#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Work planner: turns a dataset plus a sampling specification into the
//! ordered work-item and load-entry lists the pipeline executes.
//!
//! Planning is a pure function of its inputs, so every node in a cluster
//! derives the same arrays; the master hands out indices into them.

use kino_core::meta::VideoMetadata;
use kino_core::types::{
    Interval, LoadEntry, LoadPayload, Sampling, SamplingError, WorkItem, RESET_NEXT_ITEM_ID,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("work_item_size must be >= 1 (got {0})")]
    InvalidWorkItemSize(i64),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error("video index {video_index} out of range ({videos} videos)")]
    VideoIndexOutOfRange { video_index: usize, videos: usize },
    #[error("frame {frame} out of range for video {video_index} ({frames} frames)")]
    FrameOutOfRange {
        video_index: usize,
        frame: i64,
        frames: i64,
    },
}

/// The plan is identical on every node: the master issues indices into
/// `load_entries`, and workers interpret them against their own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPlan {
    pub work_items: Vec<WorkItem>,
    pub load_entries: Vec<LoadEntry>,
    pub total_rows: i64,
}

pub fn build_work_plan(
    videos: &[VideoMetadata],
    sampling: &Sampling,
    work_item_size: i64,
) -> Result<WorkPlan, PlanError> {
    if work_item_size < 1 {
        return Err(PlanError::InvalidWorkItemSize(work_item_size));
    }
    sampling.validate()?;

    let mut plan = WorkPlan {
        work_items: Vec::new(),
        load_entries: Vec::new(),
        total_rows: 0,
    };

    match sampling {
        Sampling::All => {
            for (video_index, meta) in videos.iter().enumerate() {
                let mut allocated = 0;
                while allocated < meta.frames {
                    let take = work_item_size.min(meta.frames - allocated);
                    push_item(
                        &mut plan,
                        WorkItem {
                            video_index,
                            item_id: allocated,
                            next_item_id: allocated + take,
                            rows_from_start: allocated,
                        },
                        LoadPayload::All(Interval::new(allocated, allocated + take)),
                    );
                    allocated += take;
                }
                plan.total_rows += meta.frames;
            }
        }
        Sampling::Strided { stride } => {
            for (video_index, meta) in videos.iter().enumerate() {
                let mut allocated = 0;
                while allocated < meta.frames {
                    let take = (work_item_size * stride).min(meta.frames - allocated);
                    push_item(
                        &mut plan,
                        WorkItem {
                            video_index,
                            item_id: allocated,
                            next_item_id: allocated + take,
                            rows_from_start: allocated / stride,
                        },
                        LoadPayload::Strided {
                            interval: Interval::new(allocated, allocated + take),
                            stride: *stride,
                        },
                    );
                    allocated += take;
                    plan.total_rows += (take + stride - 1) / stride;
                }
            }
        }
        Sampling::Gather { videos: samples } => {
            for point_samples in samples {
                let meta = video_meta(videos, point_samples.video_index)?;
                for &frame in &point_samples.frames {
                    check_frame(point_samples.video_index, frame, meta.frames)?;
                }
                let frames_in_sample = point_samples.frames.len() as i64;
                let mut allocated = 0;
                while allocated < frames_in_sample {
                    let take = work_item_size.min(frames_in_sample - allocated);
                    let chunk =
                        point_samples.frames[allocated as usize..(allocated + take) as usize].to_vec();
                    push_item(
                        &mut plan,
                        WorkItem {
                            video_index: point_samples.video_index,
                            item_id: allocated,
                            next_item_id: allocated + take,
                            rows_from_start: allocated,
                        },
                        LoadPayload::Gather(chunk),
                    );
                    allocated += take;
                }
                plan.total_rows += frames_in_sample;
            }
        }
        Sampling::SequenceGather { videos: samples } => {
            for sequence_samples in samples {
                let meta = video_meta(videos, sequence_samples.video_index)?;
                let mut rows_in_sequences = 0;
                for interval in &sequence_samples.intervals {
                    check_frame(sequence_samples.video_index, interval.end - 1, meta.frames)?;
                    let frames_in_sample = interval.len();
                    let mut allocated = 0;
                    while allocated < frames_in_sample {
                        let take = work_item_size.min(frames_in_sample - allocated);
                        push_item(
                            &mut plan,
                            WorkItem {
                                video_index: sequence_samples.video_index,
                                item_id: rows_in_sequences,
                                next_item_id: rows_in_sequences + take,
                                rows_from_start: allocated,
                            },
                            LoadPayload::SequenceGather(vec![Interval::new(
                                interval.start + allocated,
                                interval.start + allocated + take,
                            )]),
                        );
                        allocated += take;
                        rows_in_sequences += take;
                    }
                    // The decoder must restart at every gather interval.
                    if let Some(last) = plan.work_items.last_mut() {
                        last.next_item_id = RESET_NEXT_ITEM_ID;
                    }
                    plan.total_rows += frames_in_sample;
                }
            }
        }
    }

    Ok(plan)
}

fn push_item(plan: &mut WorkPlan, item: WorkItem, payload: LoadPayload) {
    plan.work_items.push(item);
    plan.load_entries.push(LoadEntry {
        work_item_index: plan.work_items.len() - 1,
        payload,
    });
}

fn video_meta(videos: &[VideoMetadata], video_index: usize) -> Result<&VideoMetadata, PlanError> {
    videos
        .get(video_index)
        .ok_or(PlanError::VideoIndexOutOfRange {
            video_index,
            videos: videos.len(),
        })
}

fn check_frame(video_index: usize, frame: i64, frames: i64) -> Result<(), PlanError> {
    if frame < 0 || frame >= frames {
        return Err(PlanError::FrameOutOfRange {
            video_index,
            frame,
            frames,
        });
    }
    Ok(())
}
