//! Per-node job driver: plans the job, spawns the three worker stages,
//! schedules work locally and across the cluster, and runs the drain-ordered
//! shutdown.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use kino_core::config::NodeTuning;
use kino_core::meta::{
    canonicalize_database_meta, canonicalize_job_descriptor, parse_database_meta, JobColumn,
    JobDescriptor,
};
use kino_core::types::{LoadEntry, Sampling};
use kino_observe::metrics::Counter;
use kino_observe::profiler::{
    encode_node_profile, NodeProfile, Profiler, WorkerProfile,
};
use kino_observe::time::unix_time_ms;
use kino_plan::build_work_plan;
use kino_store::paths::{db_metadata_path, job_descriptor_path, job_profile_path, validate_name};
use kino_store::{open_storage, StorageConfig};
use tracing::{info, warn};

use crate::cluster::{Transport, MASTER_RANK, NO_MORE_WORK};
use crate::dataset::read_dataset;
use crate::entry::EvalEntry;
use crate::eval::{run_eval_worker, EvalWorkerArgs};
use crate::evaluator::{factory_groups, EvaluatorConfig, EvaluatorFactory};
use crate::load::{run_load_worker, LoadWorkerArgs};
use crate::memory::Allocator;
use crate::queue::WorkQueue;
use crate::save::{run_save_worker, SaveWorkerArgs};

pub struct JobRequest {
    pub job_name: String,
    pub dataset_name: String,
    pub sampling: Sampling,
    pub factories: Vec<Arc<dyn EvaluatorFactory>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    /// Assigned by the master at completion; `None` on worker nodes.
    pub job_id: Option<i32>,
    pub work_items: usize,
    pub total_rows: i64,
    /// Work items saved by this node.
    pub retired_items: u64,
}

/// Runs one job on this node, returning once every local worker has drained
/// and (on the master) the job is registered. Any worker failure aborts the
/// node with an error.
pub fn run_job(
    storage_config: &StorageConfig,
    transport: &dyn Transport,
    tuning: NodeTuning,
    allocator: Arc<Allocator>,
    request: JobRequest,
) -> Result<JobSummary> {
    tuning.validate()?;
    validate_name(&request.job_name)?;
    validate_name(&request.dataset_name)?;
    ensure!(!request.factories.is_empty(), "evaluator chain is empty");

    let rank = transport.rank();
    let base_time = Instant::now();
    let start_unix_ms = unix_time_ms();

    let storage = open_storage(storage_config);
    let (descriptor, videos) = read_dataset(storage.as_ref(), &request.dataset_name)?;

    // Warm up across the whole chain: the largest requirement wins.
    let warmup_count = request
        .factories
        .iter()
        .map(|f| f.capabilities().warmup_size)
        .max()
        .unwrap_or(0);

    let plan = build_work_plan(&videos, &request.sampling, tuning.work_item_size)?;
    if rank == MASTER_RANK {
        info!(
            work_items = plan.work_items.len(),
            total_rows = plan.total_rows,
            job = %request.job_name,
            "planned job"
        );
    }

    let groups = factory_groups(&request.factories);
    let group_count = groups.len();
    let last_factory = request
        .factories
        .last()
        .context("evaluator chain is empty")?;
    let final_columns = last_factory.output_column_names();

    let capacity = tuning.queue_capacity();
    let load_work: WorkQueue<LoadEntry> = WorkQueue::with_capacity(capacity);
    let initial_eval_work: WorkQueue<EvalEntry> = WorkQueue::with_capacity(capacity);
    let eval_work: Vec<Vec<WorkQueue<EvalEntry>>> = (0..tuning.pus_per_node)
        .map(|_| {
            (1..group_count)
                .map(|_| WorkQueue::with_capacity(capacity))
                .collect()
        })
        .collect();
    let save_work: WorkQueue<EvalEntry> = WorkQueue::with_capacity(capacity);
    let retired_items = Arc::new(Counter::default());

    let video_names = Arc::new(descriptor.video_names.clone());
    let videos = Arc::new(videos);
    let work_items = Arc::new(plan.work_items.clone());

    // Load workers.
    let mut load_profilers = Vec::new();
    let mut load_threads = Vec::new();
    for worker_id in 0..tuning.load_workers_per_node {
        let profiler = Profiler::new(base_time);
        load_profilers.push(profiler.clone());
        let worker = LoadWorkerArgs {
            dataset_name: request.dataset_name.clone(),
            warmup_count,
            video_names: video_names.clone(),
            videos: videos.clone(),
            work_items: work_items.clone(),
            rank,
            worker_id,
            storage: storage_config.clone(),
            allocator: allocator.clone(),
            profiler,
            input: load_work.clone(),
            output: initial_eval_work.clone(),
        };
        load_threads.push(spawn_worker(format!("kino-load-{worker_id}"), move || {
            run_load_worker(worker)
        })?);
    }

    // Evaluator chains: one thread per (PU, factory group).
    let mut eval_profilers: Vec<Vec<Profiler>> = Vec::new();
    let mut eval_threads: Vec<Vec<JoinHandle<Result<()>>>> = Vec::new();
    for pu in 0..tuning.pus_per_node {
        let mut chain_profilers = Vec::new();
        let mut chain_threads = Vec::new();
        for (group_index, group) in groups.iter().enumerate() {
            let profiler = Profiler::new(base_time);
            chain_profilers.push(profiler.clone());

            let configs: Vec<EvaluatorConfig> = group
                .iter()
                .map(|_| EvaluatorConfig {
                    max_input_count: tuning.work_item_size.max(warmup_count),
                    max_frame_width: descriptor.max_width,
                    max_frame_height: descriptor.max_height,
                    device_id: pu as i32,
                    allocator: allocator.clone(),
                })
                .collect();

            let input = if group_index == 0 {
                initial_eval_work.clone()
            } else {
                eval_work[pu][group_index - 1].clone()
            };
            let output = if group_index == group_count - 1 {
                save_work.clone()
            } else {
                eval_work[pu][group_index].clone()
            };

            let worker = EvalWorkerArgs {
                warmup_count,
                work_item_size: tuning.work_item_size,
                videos: videos.clone(),
                work_items: work_items.clone(),
                rank,
                pu,
                group_index,
                last_group: group_index == group_count - 1,
                factories: group.clone(),
                configs,
                allocator: allocator.clone(),
                profiler,
                input,
                output,
            };
            chain_threads.push(spawn_worker(
                format!("kino-eval-{pu}-{group_index}"),
                move || run_eval_worker(worker),
            )?);
        }
        eval_profilers.push(chain_profilers);
        eval_threads.push(chain_threads);
    }

    // Save workers.
    let mut save_profilers = Vec::new();
    let mut save_threads = Vec::new();
    for worker_id in 0..tuning.save_workers_per_node {
        let profiler = Profiler::new(base_time);
        save_profilers.push(profiler.clone());
        let worker = SaveWorkerArgs {
            job_name: request.job_name.clone(),
            video_names: video_names.clone(),
            work_items: work_items.clone(),
            column_names: final_columns.clone(),
            rank,
            worker_id,
            storage: storage_config.clone(),
            allocator: allocator.clone(),
            profiler,
            input: save_work.clone(),
            retired_items: retired_items.clone(),
        };
        save_threads.push(spawn_worker(format!("kino-save-{worker_id}"), move || {
            run_save_worker(worker)
        })?);
    }

    // Intake loop: the master consumes the plan locally and feeds peers on
    // request; workers pull indices from the master.
    let intake_limit = tuning.intake_limit() as u64;
    let mut accepted: u64 = 0;
    if rank == MASTER_RANK {
        let total = plan.load_entries.len();
        let mut next = 0usize;
        while next < total {
            let in_flight = accepted.saturating_sub(retired_items.get());
            if in_flight < intake_limit {
                load_work.push(plan.load_entries[next].clone())?;
                next += 1;
                accepted += 1;
                if (total - next) % 10 == 0 {
                    info!(remaining = total - next, "work items left");
                }
                continue;
            }
            if transport.size() > 1 {
                let (source, _) = transport.recv_any()?;
                transport.send(source, next as i32)?;
                next += 1;
            }
            std::thread::yield_now();
        }
        let mut workers_done = 1;
        while workers_done < transport.size() {
            let (source, _) = transport.recv_any()?;
            transport.send(source, NO_MORE_WORK)?;
            workers_done += 1;
            std::thread::yield_now();
        }
    } else {
        loop {
            let in_flight = accepted.saturating_sub(retired_items.get());
            if in_flight < intake_limit {
                transport.send(MASTER_RANK, 1)?;
                let reply = transport.recv_from(MASTER_RANK)?;
                if reply == NO_MORE_WORK {
                    break;
                }
                let entry = plan
                    .load_entries
                    .get(reply as usize)
                    .with_context(|| format!("master issued invalid work item index {reply}"))?
                    .clone();
                load_work.push(entry)?;
                accepted += 1;
            }
            std::thread::yield_now();
        }
    }

    // Drain-ordered shutdown: each stage is fully joined before the next is
    // signalled, so no entry is left behind in a queue.
    for _ in 0..tuning.load_workers_per_node {
        load_work.push_sentinel()?;
    }
    for handle in load_threads {
        join_worker(handle, "load")?;
    }

    for _ in 0..tuning.pus_per_node {
        initial_eval_work.push_sentinel()?;
    }
    for chain in eval_threads.iter_mut() {
        join_worker(chain.remove(0), "eval")?;
    }
    for group_index in 1..group_count {
        for pu in 0..tuning.pus_per_node {
            eval_work[pu][group_index - 1].push_sentinel()?;
        }
        for chain in eval_threads.iter_mut() {
            join_worker(chain.remove(0), "eval")?;
        }
    }

    for _ in 0..tuning.save_workers_per_node {
        save_work.push_sentinel()?;
    }
    for handle in save_threads {
        join_worker(handle, "save")?;
    }

    // Register the job and persist its descriptor (master only).
    let mut job_id = None;
    if rank == MASTER_RANK {
        let db_path = db_metadata_path();
        let mut db_meta = parse_database_meta(
            &storage
                .read_all(&db_path)
                .context("read database metadata")?,
        )?;
        let dataset_id = db_meta
            .dataset_id(&request.dataset_name)
            .with_context(|| format!("dataset {} is not registered", request.dataset_name))?;
        let id = db_meta.add_job(dataset_id, &request.job_name);
        storage.write_all(&db_path, &canonicalize_database_meta(&db_meta))?;

        let job_descriptor = JobDescriptor {
            id,
            work_item_size: tuning.work_item_size,
            sampling: request.sampling.clone(),
            columns: final_columns
                .iter()
                .enumerate()
                .map(|(i, name)| JobColumn {
                    id: i as i32,
                    name: name.clone(),
                })
                .collect(),
        };
        storage.write_all(
            &job_descriptor_path(&request.job_name),
            &canonicalize_job_descriptor(&job_descriptor),
        )?;
        job_id = Some(id);
    }

    // Per-node profile blob.
    let mut workers = Vec::new();
    for (worker_id, profiler) in load_profilers.iter().enumerate() {
        workers.push(worker_profile("load", String::new(), worker_id, profiler));
    }
    for (pu, chain) in eval_profilers.iter().enumerate() {
        for (group_index, profiler) in chain.iter().enumerate() {
            workers.push(worker_profile("eval", format!("fg{group_index}"), pu, profiler));
        }
    }
    for (worker_id, profiler) in save_profilers.iter().enumerate() {
        workers.push(worker_profile("save", String::new(), worker_id, profiler));
    }
    let profile = NodeProfile {
        rank: rank as u64,
        start_unix_ms,
        end_unix_ms: unix_time_ms(),
        workers,
    };
    storage.write_all(
        &job_profile_path(&request.job_name, rank),
        &encode_node_profile(&profile),
    )?;

    if !allocator.balanced() {
        warn!(snapshot = ?allocator.snapshot(), "buffer accounting unbalanced at job end");
    }

    let summary = JobSummary {
        job_id,
        work_items: plan.work_items.len(),
        total_rows: plan.total_rows,
        retired_items: retired_items.get(),
    };
    info!(
        rank,
        job = %request.job_name,
        retired = summary.retired_items,
        "job finished on this node"
    );
    Ok(summary)
}

fn spawn_worker(
    name: String,
    body: impl FnOnce() -> Result<()> + Send + 'static,
) -> Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .with_context(|| format!("spawn thread {name}"))
}

fn join_worker(handle: JoinHandle<Result<()>>, stage: &str) -> Result<()> {
    match handle.join() {
        Ok(result) => result.with_context(|| format!("{stage} worker failed")),
        Err(_) => anyhow::bail!("{stage} worker panicked"),
    }
}

fn worker_profile(
    category: &str,
    tag: String,
    worker_id: usize,
    profiler: &Profiler,
) -> WorkerProfile {
    WorkerProfile {
        category: category.to_string(),
        tag,
        worker_id: worker_id as u64,
        intervals: profiler.snapshot().into_iter().map(Into::into).collect(),
    }
}
