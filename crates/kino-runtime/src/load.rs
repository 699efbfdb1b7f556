//! Load stage: turns load entries into eval entries by reading the smallest
//! keyframe-aligned byte ranges that cover the requested frames.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use kino_core::meta::VideoMetadata;
use kino_core::types::{Device, Interval, LoadEntry, LoadPayload, WorkItem};
use kino_observe::profiler::Profiler;
use kino_store::paths::dataset_item_data_path;
use kino_store::{open_storage, ReadFile, StorageConfig};
use tracing::info;

use crate::entry::{DecodeArgs, DecodeSampling, EvalEntry, DECODE_ARGS_COLUMN, ENCODED_VIDEO_COLUMN};
use crate::memory::Allocator;
use crate::queue::WorkQueue;

pub struct LoadWorkerArgs {
    pub dataset_name: String,
    pub warmup_count: i64,
    pub video_names: Arc<Vec<String>>,
    pub videos: Arc<Vec<VideoMetadata>>,
    pub work_items: Arc<Vec<WorkItem>>,

    pub rank: usize,
    pub worker_id: usize,
    pub storage: StorageConfig,
    pub allocator: Arc<Allocator>,
    pub profiler: Profiler,

    pub input: WorkQueue<LoadEntry>,
    pub output: WorkQueue<EvalEntry>,
}

/// Locates the keyframe bracket of `[start, end)`: the largest `k1` with
/// `positions[k1] <= start` and the smallest `k2 > k1` with
/// `positions[k2] >= end`. The caller extends `positions` with a trailing
/// frame-count sentinel, so failure means the keyframe index is corrupt.
pub fn find_keyframe_bracket(start: i64, end: i64, positions: &[i64]) -> Option<(usize, usize)> {
    let mut k1 = None;
    for i in 1..positions.len() {
        if positions[i] > start {
            k1 = Some(i - 1);
            break;
        }
    }
    let k1 = k1?;
    let mut k2 = None;
    for (i, &pos) in positions.iter().enumerate().skip(k1) {
        if pos >= end {
            k2 = Some(i);
            break;
        }
    }
    let k2 = k2?;
    (k2 > k1).then_some((k1, k2))
}

struct OpenVideo {
    file: Box<dyn ReadFile>,
    keyframe_positions: Vec<i64>,
    keyframe_byte_offsets: Vec<i64>,
}

pub fn run_load_worker(args: LoadWorkerArgs) -> Result<()> {
    let setup_start = Instant::now();
    let storage = open_storage(&args.storage);
    args.profiler.add_interval("setup", setup_start, Instant::now());

    let mut last_video_index: Option<usize> = None;
    let mut open_video: Option<OpenVideo> = None;

    loop {
        let idle_start = Instant::now();
        let Some(load_entry) = args.input.pop()? else {
            break;
        };
        args.profiler.add_interval("idle", idle_start, Instant::now());

        info!(
            rank = args.rank,
            worker = args.worker_id,
            item = load_entry.work_item_index,
            "load: processing item"
        );

        let work_start = Instant::now();

        let work_item = args
            .work_items
            .get(load_entry.work_item_index)
            .context("load entry references an unknown work item")?;
        let metadata = &args.videos[work_item.video_index];
        let video_name = &args.video_names[work_item.video_index];

        if last_video_index != Some(work_item.video_index) {
            let path = dataset_item_data_path(&args.dataset_name, video_name);
            let mut file = storage
                .open_read(&path)
                .with_context(|| format!("open video data {path}"))?;
            let file_size = file.size().with_context(|| format!("size of {path}"))?;

            // Append the (frame count, file size) sentinel pair so the
            // bracket search always finds an upper bound.
            let mut keyframe_positions = metadata.keyframe_positions.clone();
            let mut keyframe_byte_offsets = metadata.keyframe_byte_offsets.clone();
            keyframe_positions.push(metadata.frames);
            keyframe_byte_offsets.push(file_size as i64);

            open_video = Some(OpenVideo {
                file,
                keyframe_positions,
                keyframe_byte_offsets,
            });
        }
        last_video_index = Some(work_item.video_index);
        let video = open_video
            .as_mut()
            .context("video file not open")?;

        // The decoder prepends warmup rows after a reset; cap them at the
        // rows preceding this item so the chain's trim removes exactly them.
        let warmup_count = args.warmup_count.min(work_item.rows_from_start);

        let reads: Vec<(Interval, DecodeSampling)> = match &load_entry.payload {
            LoadPayload::All(interval) => {
                vec![(*interval, DecodeSampling::All { interval: *interval })]
            }
            LoadPayload::Strided { interval, stride } => vec![(
                *interval,
                DecodeSampling::Strided {
                    interval: *interval,
                    stride: *stride,
                },
            )],
            LoadPayload::Gather(frames) => frames
                .iter()
                .map(|&frame| {
                    (
                        Interval::new(frame, frame + 1),
                        DecodeSampling::Gather { frame },
                    )
                })
                .collect(),
            LoadPayload::SequenceGather(intervals) => intervals
                .iter()
                .map(|&interval| (interval, DecodeSampling::SequenceGather { interval }))
                .collect(),
        };

        let mut eval_entry = EvalEntry {
            work_item_index: load_entry.work_item_index,
            column_names: vec![
                ENCODED_VIDEO_COLUMN.to_string(),
                DECODE_ARGS_COLUMN.to_string(),
            ],
            columns: vec![Vec::new(), Vec::new()],
            device: Device::cpu(),
            video_decode: true,
        };

        for (interval, sampling) in reads {
            let Some((k1, k2)) =
                find_keyframe_bracket(interval.start, interval.end, &video.keyframe_positions)
            else {
                bail!(
                    "corrupt keyframe index for video {video_name}: no bracket for [{}, {})",
                    interval.start,
                    interval.end
                );
            };

            let start_offset = video.keyframe_byte_offsets[k1] as u64;
            let end_offset = video.keyframe_byte_offsets[k2] as u64;
            let read_len = (end_offset - start_offset) as usize;

            let mut buffer = args.allocator.alloc(Device::cpu(), read_len);
            let io_start = Instant::now();
            video
                .file
                .read_at(buffer.as_mut_slice(), start_offset)
                .with_context(|| format!("read {read_len} bytes of video {video_name}"))?;
            args.profiler.add_interval("io", io_start, Instant::now());

            let decode_args = DecodeArgs {
                warmup_count,
                sampling,
                start_keyframe: video.keyframe_positions[k1],
                end_keyframe: video.keyframe_positions[k2],
            };
            let args_bytes = decode_args
                .to_bytes()
                .context("encode decode args")?;

            eval_entry.columns[0].push(buffer);
            eval_entry.columns[1].push(args.allocator.alloc_from(Device::cpu(), args_bytes));
        }

        args.profiler.add_interval("task", work_start, Instant::now());

        args.output.push(eval_entry)?;
    }

    info!(
        rank = args.rank,
        worker = args.worker_id,
        "load: worker finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracket_spans_requested_interval() {
        // Keyframes every 25 frames, sentinel at 100.
        let positions = vec![0, 25, 50, 75, 100];
        let (k1, k2) = find_keyframe_bracket(30, 60, &positions).expect("bracket");
        assert_eq!((k1, k2), (1, 3));
    }

    #[test]
    fn bracket_is_minimal_on_aligned_interval() {
        let positions = vec![0, 25, 50, 75, 100];
        let (k1, k2) = find_keyframe_bracket(25, 50, &positions).expect("bracket");
        assert_eq!((k1, k2), (1, 2));
    }

    #[test]
    fn bracket_uses_trailing_sentinel_for_tail() {
        let positions = vec![0, 25, 50, 75, 100];
        let (k1, k2) = find_keyframe_bracket(90, 100, &positions).expect("bracket");
        assert_eq!((k1, k2), (3, 4));
    }

    #[test]
    fn bracket_fails_past_sentinel() {
        let positions = vec![0, 25, 50, 75, 100];
        assert_eq!(find_keyframe_bracket(90, 120, &positions), None);
    }

    #[test]
    fn single_frame_interval() {
        let positions = vec![0, 25, 50, 100];
        let (k1, k2) = find_keyframe_bracket(7, 8, &positions).expect("bracket");
        assert_eq!((k1, k2), (0, 1));
    }
}
