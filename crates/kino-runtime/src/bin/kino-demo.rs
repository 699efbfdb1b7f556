#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Single-node demo: seeds a synthetic dataset, runs a decode + passthrough
//! job against it, and verifies the saved output row-for-row.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kino_core::config::NodeTuning;
use kino_core::types::{DeviceType, Sampling};
use kino_runtime::cluster::SingleNode;
use kino_runtime::dataset::{write_dataset, VideoIngest};
use kino_runtime::driver::{run_job, JobRequest};
use kino_runtime::evaluators::{
    synthetic_video, ByteStreamDecodeFactory, PassthroughFactory, FRAME_COLUMN,
};
use kino_runtime::memory::Allocator;
use kino_runtime::save::read_output_rows;
use kino_store::{open_storage, StorageConfig};

#[derive(Debug, Parser)]
#[command(name = "kino-demo")]
struct Args {
    /// Store root; a temp directory is created when unset.
    #[arg(long, env = "KINO_STORE_ROOT")]
    store_root: Option<PathBuf>,

    #[arg(long, env = "KINO_DEMO_VIDEOS", default_value_t = 2)]
    videos: usize,

    #[arg(long, env = "KINO_DEMO_FRAMES", default_value_t = 200)]
    frames: i64,

    #[arg(long, env = "KINO_DEMO_KEYFRAME_INTERVAL", default_value_t = 25)]
    keyframe_interval: i64,

    /// 0 samples every frame; otherwise frames are strided by this.
    #[arg(long, env = "KINO_DEMO_STRIDE", default_value_t = 0)]
    stride: i64,

    #[arg(long, env = "KINO_WORK_ITEM_SIZE", default_value_t = 32)]
    work_item_size: i64,

    #[arg(long, env = "KINO_LOAD_WORKERS", default_value_t = 2)]
    load_workers: usize,

    #[arg(long, env = "KINO_PUS_PER_NODE", default_value_t = 2)]
    pus_per_node: usize,

    #[arg(long, env = "KINO_SAVE_WORKERS", default_value_t = 2)]
    save_workers: usize,

    #[arg(long, env = "KINO_TASKS_IN_QUEUE_PER_PU", default_value_t = 4)]
    tasks_in_queue_per_pu: usize,

    #[arg(long, env = "KINO_KEEP_ARTIFACTS", default_value_t = false)]
    keep_artifacts: bool,
}

fn demo_temp_root() -> PathBuf {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "kino-demo-{}-{}",
        std::process::id(),
        kino_observe::time::unix_time_ms()
    ));
    root
}

fn main() -> Result<()> {
    kino_observe::logging::init_tracing();
    let args = Args::parse();

    anyhow::ensure!(args.videos >= 1, "need at least one video");
    anyhow::ensure!(args.frames >= 1, "need at least one frame");

    let (root, ephemeral) = match &args.store_root {
        Some(root) => (root.clone(), false),
        None => (demo_temp_root(), true),
    };
    std::fs::create_dir_all(&root)?;
    println!("[kino-demo] store_root={}", root.display());

    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);

    let videos: Vec<VideoIngest> = (0..args.videos)
        .map(|i| {
            let (metadata, data) = synthetic_video(1, 1, args.frames, args.keyframe_interval);
            VideoIngest {
                name: format!("clip{i}"),
                metadata,
                data,
            }
        })
        .collect();
    write_dataset(storage.as_ref(), "demo", &videos)?;
    println!(
        "[kino-demo] seeded dataset: {} videos x {} frames",
        args.videos, args.frames
    );

    let sampling = if args.stride > 0 {
        Sampling::Strided {
            stride: args.stride,
        }
    } else {
        Sampling::All
    };

    let tuning = NodeTuning {
        work_item_size: args.work_item_size,
        load_workers_per_node: args.load_workers,
        pus_per_node: args.pus_per_node,
        save_workers_per_node: args.save_workers,
        tasks_in_queue_per_pu: args.tasks_in_queue_per_pu,
    };

    let allocator = Arc::new(Allocator::new());
    let summary = run_job(
        &storage_config,
        &SingleNode,
        tuning,
        allocator.clone(),
        JobRequest {
            job_name: "demo-job".to_string(),
            dataset_name: "demo".to_string(),
            sampling: sampling.clone(),
            factories: vec![
                Arc::new(ByteStreamDecodeFactory),
                Arc::new(PassthroughFactory {
                    column: FRAME_COLUMN.to_string(),
                    device_type: DeviceType::Cpu,
                    warmup_size: 0,
                    can_overlap: false,
                }),
            ],
        },
    )?;

    println!(
        "[kino-demo] job_id={:?} work_items={} total_rows={} retired={}",
        summary.job_id, summary.work_items, summary.total_rows, summary.retired_items
    );
    anyhow::ensure!(
        summary.retired_items as usize == summary.work_items,
        "not every work item was retired"
    );

    // Verify every saved row against the sampled frame sequence.
    let stride = if args.stride > 0 { args.stride } else { 1 };
    let mut verified_rows = 0usize;
    for video in &videos {
        let mut expected_frame = 0i64;
        for work_item_index in 0..summary.work_items {
            // Output files are keyed by global work-item index; probe for
            // this video's files and skip the rest.
            let Ok(rows) = read_output_rows(
                storage.as_ref(),
                "demo-job",
                &video.name,
                FRAME_COLUMN,
                work_item_index,
            ) else {
                continue;
            };
            for row in rows {
                anyhow::ensure!(
                    row == vec![(expected_frame % 256) as u8],
                    "row mismatch in {} item {}: expected frame {}",
                    video.name,
                    work_item_index,
                    expected_frame
                );
                expected_frame += stride;
                verified_rows += 1;
            }
        }
    }
    anyhow::ensure!(
        verified_rows as i64 == summary.total_rows,
        "verified {} rows, expected {}",
        verified_rows,
        summary.total_rows
    );
    anyhow::ensure!(allocator.balanced(), "buffer accounting unbalanced");
    println!("[kino-demo] verified {verified_rows} output rows");

    if ephemeral && !args.keep_artifacts {
        let _ = std::fs::remove_dir_all(&root);
    } else {
        println!("[kino-demo] kept artifacts: {}", root.display());
    }
    Ok(())
}
