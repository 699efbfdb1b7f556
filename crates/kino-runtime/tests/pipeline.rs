//! End-to-end single-node pipeline scenarios over the synthetic byte-stream
//! dataset: every sampling variant, reset discipline, warmup trimming,
//! cross-device migration, and buffer accounting.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use kino_core::config::NodeTuning;
use kino_core::meta::{parse_database_meta, parse_job_descriptor, VideoMetadata};
use kino_core::types::{DeviceType, Interval, PointSamples, Sampling, SequenceSamples};
use kino_observe::metrics::Counter;
use kino_observe::profiler::decode_node_profile;
use kino_runtime::cluster::SingleNode;
use kino_runtime::dataset::{write_dataset, VideoIngest};
use kino_runtime::driver::{run_job, JobRequest, JobSummary};
use kino_runtime::evaluator::{
    Evaluator, EvaluatorCapabilities, EvaluatorConfig, EvaluatorError, EvaluatorFactory,
};
use kino_runtime::evaluators::{
    synthetic_video, ByteStreamDecodeFactory, PassthroughFactory, FRAME_COLUMN,
};
use kino_runtime::memory::{Allocator, Buffer};
use kino_runtime::save::read_output_rows;
use kino_store::paths::{db_metadata_path, job_descriptor_path, job_profile_path};
use kino_store::{open_storage, Storage, StorageConfig};

fn temp_root(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "kino-pipeline-{test_name}-{}-{}",
        std::process::id(),
        kino_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn seed_dataset(
    storage: &dyn Storage,
    dataset: &str,
    videos: &[(i64, i64)], // (frames, keyframe interval)
) -> Result<()> {
    let ingests: Vec<VideoIngest> = videos
        .iter()
        .enumerate()
        .map(|(i, &(frames, keyframe_interval))| {
            let (metadata, data) = synthetic_video(1, 1, frames, keyframe_interval);
            VideoIngest {
                name: format!("clip{i}"),
                metadata,
                data,
            }
        })
        .collect();
    write_dataset(storage, dataset, &ingests)
}

fn tuning(work_item_size: i64) -> NodeTuning {
    NodeTuning {
        work_item_size,
        load_workers_per_node: 1,
        pus_per_node: 1,
        save_workers_per_node: 1,
        tasks_in_queue_per_pu: 4,
    }
}

fn run_single(
    root: &PathBuf,
    tuning: NodeTuning,
    sampling: Sampling,
    factories: Vec<Arc<dyn EvaluatorFactory>>,
) -> Result<(JobSummary, Arc<Allocator>)> {
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let allocator = Arc::new(Allocator::new());
    let summary = run_job(
        &storage_config,
        &SingleNode,
        tuning,
        allocator.clone(),
        JobRequest {
            job_name: "job".to_string(),
            dataset_name: "ds".to_string(),
            sampling,
            factories,
        },
    )?;
    Ok((summary, allocator))
}

/// Flattens the one-byte rows of a video's output files in work-item order.
fn collect_video_rows(
    storage: &dyn Storage,
    video: &str,
    work_items: usize,
) -> Result<Vec<u8>> {
    let mut rows = Vec::new();
    for item in 0..work_items {
        let Ok(item_rows) = read_output_rows(storage, "job", video, FRAME_COLUMN, item) else {
            continue;
        };
        for row in item_rows {
            anyhow::ensure!(row.len() == 1, "expected one-byte rows");
            rows.push(row[0]);
        }
    }
    Ok(rows)
}

fn decode_chain(warmup_size: i64) -> Vec<Arc<dyn EvaluatorFactory>> {
    vec![
        Arc::new(ByteStreamDecodeFactory),
        Arc::new(PassthroughFactory {
            column: FRAME_COLUMN.to_string(),
            device_type: DeviceType::Cpu,
            warmup_size,
            can_overlap: false,
        }),
    ]
}

/// Passthrough that counts configure/reset calls, for reset-discipline
/// assertions.
struct CountingPassthroughFactory {
    configures: Arc<Counter>,
    resets: Arc<Counter>,
}

impl EvaluatorFactory for CountingPassthroughFactory {
    fn capabilities(&self) -> EvaluatorCapabilities {
        EvaluatorCapabilities {
            device_type: DeviceType::Cpu,
            warmup_size: 0,
            can_overlap: false,
        }
    }

    fn output_column_names(&self) -> Vec<String> {
        vec![FRAME_COLUMN.to_string()]
    }

    fn new_evaluator(&self, config: EvaluatorConfig) -> Box<dyn Evaluator> {
        Box::new(CountingPassthrough {
            config,
            configures: self.configures.clone(),
            resets: self.resets.clone(),
        })
    }
}

struct CountingPassthrough {
    config: EvaluatorConfig,
    configures: Arc<Counter>,
    resets: Arc<Counter>,
}

impl Evaluator for CountingPassthrough {
    fn configure(&mut self, _metadata: &VideoMetadata) -> Result<(), EvaluatorError> {
        self.configures.inc();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EvaluatorError> {
        self.resets.inc();
        Ok(())
    }

    fn evaluate(
        &mut self,
        inputs: &[Vec<Buffer>],
        outputs: &mut Vec<Vec<Buffer>>,
    ) -> Result<(), EvaluatorError> {
        let first = inputs
            .first()
            .ok_or_else(|| EvaluatorError::Failed("no input".to_string()))?;
        outputs.push(
            first
                .iter()
                .map(|row| {
                    self.config
                        .allocator
                        .copy_to(kino_core::types::Device::cpu(), row)
                })
                .collect(),
        );
        Ok(())
    }
}

#[test]
fn all_sampling_reassembles_the_stream() -> Result<()> {
    let root = temp_root("all")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(100, 25)])?;

    let (summary, allocator) = run_single(&root, tuning(32), Sampling::All, decode_chain(0))?;
    assert_eq!(summary.work_items, 4);
    assert_eq!(summary.total_rows, 100);
    assert_eq!(summary.retired_items, 4);

    // Four files of 32/32/32/4 rows whose concatenation is the full stream.
    for (item, expected_rows) in [(0usize, 32usize), (1, 32), (2, 32), (3, 4)] {
        let rows = read_output_rows(storage.as_ref(), "job", "clip0", FRAME_COLUMN, item)?;
        assert_eq!(rows.len(), expected_rows, "item {item}");
    }
    let rows = collect_video_rows(storage.as_ref(), "clip0", summary.work_items)?;
    let expected: Vec<u8> = (0..100u8).collect();
    assert_eq!(rows, expected);

    assert!(allocator.balanced(), "buffer accounting unbalanced");
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn strided_sampling_emits_every_nth_frame() -> Result<()> {
    let root = temp_root("strided")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(100, 25)])?;

    let (summary, allocator) = run_single(
        &root,
        tuning(10),
        Sampling::Strided { stride: 5 },
        decode_chain(0),
    )?;
    assert_eq!(summary.work_items, 2);
    assert_eq!(summary.total_rows, 20);

    let rows = collect_video_rows(storage.as_ref(), "clip0", summary.work_items)?;
    let expected: Vec<u8> = (0..100u8).step_by(5).collect();
    assert_eq!(rows, expected);

    assert!(allocator.balanced());
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn gather_preserves_order_and_duplicates() -> Result<()> {
    let root = temp_root("gather")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(100, 25)])?;

    let sampling = Sampling::Gather {
        videos: vec![PointSamples {
            video_index: 0,
            frames: vec![0, 7, 7, 42, 99],
        }],
    };
    let (summary, allocator) = run_single(&root, tuning(8), sampling, decode_chain(0))?;
    assert_eq!(summary.work_items, 1);
    assert_eq!(summary.total_rows, 5);

    let rows = collect_video_rows(storage.as_ref(), "clip0", summary.work_items)?;
    assert_eq!(rows, vec![0, 7, 7, 42, 99]);

    assert!(allocator.balanced());
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn sequence_gather_resets_at_every_interval() -> Result<()> {
    let root = temp_root("seq-gather")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(100, 25)])?;

    let configures = Arc::new(Counter::default());
    let resets = Arc::new(Counter::default());
    let factories: Vec<Arc<dyn EvaluatorFactory>> = vec![
        Arc::new(ByteStreamDecodeFactory),
        Arc::new(CountingPassthroughFactory {
            configures: configures.clone(),
            resets: resets.clone(),
        }),
    ];

    let sampling = Sampling::SequenceGather {
        videos: vec![SequenceSamples {
            video_index: 0,
            intervals: vec![Interval::new(0, 10), Interval::new(50, 60)],
        }],
    };
    let (summary, allocator) = run_single(&root, tuning(10), sampling, factories)?;
    assert_eq!(summary.work_items, 2);
    assert_eq!(summary.total_rows, 20);

    // One video, two decoder restarts: one configure, two resets.
    assert_eq!(configures.get(), 1);
    assert_eq!(resets.get(), 2);

    let rows = collect_video_rows(storage.as_ref(), "clip0", summary.work_items)?;
    let expected: Vec<u8> = (0..10u8).chain(50..60u8).collect();
    assert_eq!(rows, expected);

    assert!(allocator.balanced());
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn warmup_run_keeps_every_sampled_row() -> Result<()> {
    let root = temp_root("warmup-e2e")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    // Single keyframe: every warmup row the trim expects is decodable.
    seed_dataset(storage.as_ref(), "ds", &[(40, 40)])?;

    let mut t = tuning(16);
    t.pus_per_node = 2;
    let (summary, allocator) = run_single(&root, t, Sampling::All, decode_chain(8))?;
    assert_eq!(summary.work_items, 3);
    assert_eq!(summary.total_rows, 40);

    // Whatever the PU assignment, trimmed warmup rows are exactly the rows
    // the decoder prepended: the sampled stream survives intact.
    let rows = collect_video_rows(storage.as_ref(), "clip0", summary.work_items)?;
    let expected: Vec<u8> = (0..40u8).collect();
    assert_eq!(rows, expected);

    assert!(allocator.balanced(), "warmup rows leaked");
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn gpu_stage_migrates_and_normalizes_to_cpu() -> Result<()> {
    let root = temp_root("gpu")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(64, 16)])?;

    let factories: Vec<Arc<dyn EvaluatorFactory>> = vec![
        Arc::new(ByteStreamDecodeFactory),
        Arc::new(PassthroughFactory {
            column: "inferred".to_string(),
            device_type: DeviceType::Gpu,
            warmup_size: 0,
            can_overlap: false,
        }),
    ];
    let (summary, allocator) = run_single(&root, tuning(32), Sampling::All, factories)?;
    assert_eq!(summary.retired_items, 2);

    let mut rows = Vec::new();
    for item in 0..summary.work_items {
        if let Ok(item_rows) = read_output_rows(storage.as_ref(), "job", "clip0", "inferred", item)
        {
            rows.extend(item_rows.into_iter().map(|r| r[0]));
        }
    }
    let expected: Vec<u8> = (0..64u8).collect();
    assert_eq!(rows, expected);

    // Every gpu-side allocation was released on migration back to cpu.
    assert!(allocator.balanced(), "gpu buffers leaked");
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn job_completion_registers_descriptors_and_profile() -> Result<()> {
    let root = temp_root("descriptors")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(50, 10)])?;

    let mut t = tuning(16);
    t.load_workers_per_node = 2;
    t.save_workers_per_node = 2;
    let (summary, _allocator) = run_single(&root, t, Sampling::All, decode_chain(0))?;
    let job_id = summary.job_id.expect("master assigns a job id");

    let descriptor =
        parse_job_descriptor(&storage.read_all(&job_descriptor_path("job"))?)?;
    assert_eq!(descriptor.id, job_id);
    assert_eq!(descriptor.work_item_size, 16);
    assert_eq!(descriptor.sampling, Sampling::All);
    assert_eq!(descriptor.columns.len(), 1);
    assert_eq!(descriptor.columns[0].name, FRAME_COLUMN);

    let db_meta = parse_database_meta(&storage.read_all(&db_metadata_path())?)?;
    let registered: Vec<_> = db_meta.jobs().collect();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].0, job_id);
    assert_eq!(registered[0].2, "job");

    // decode group + passthrough group on one PU, plus 2 load and 2 save
    // workers.
    let profile = decode_node_profile(&storage.read_all(&job_profile_path("job", 0))?)?;
    assert_eq!(profile.rank, 0);
    let loads = profile.workers.iter().filter(|w| w.category == "load").count();
    let evals = profile.workers.iter().filter(|w| w.category == "eval").count();
    let saves = profile.workers.iter().filter(|w| w.category == "save").count();
    assert_eq!((loads, evals, saves), (2, 2, 2));
    assert!(profile
        .workers
        .iter()
        .any(|w| w.category == "eval" && w.tag == "fg1"));

    let _ = std::fs::remove_dir_all(root);
    Ok(())
}

#[test]
fn multiple_videos_stay_separated() -> Result<()> {
    let root = temp_root("multi-video")?;
    let storage_config = StorageConfig::Fs { root: root.clone() };
    let storage = open_storage(&storage_config);
    seed_dataset(storage.as_ref(), "ds", &[(30, 10), (20, 5)])?;

    let (summary, allocator) = run_single(&root, tuning(16), Sampling::All, decode_chain(0))?;
    assert_eq!(summary.work_items, 4); // 16+14 and 16+4
    assert_eq!(summary.total_rows, 50);

    let clip0 = collect_video_rows(storage.as_ref(), "clip0", summary.work_items)?;
    assert_eq!(clip0, (0..30u8).collect::<Vec<_>>());
    let clip1 = collect_video_rows(storage.as_ref(), "clip1", summary.work_items)?;
    assert_eq!(clip1, (0..20u8).collect::<Vec<_>>());

    assert!(allocator.balanced());
    let _ = std::fs::remove_dir_all(root);
    Ok(())
}
