//! Evaluator-chain stage: one worker per (PU, factory group).
//!
//! The worker owns one evaluator instance per factory in its group, tracks
//! video/continuity boundaries to drive configure/reset, batches rows through
//! the group with explicit cross-device migration, trims warmup rows at the
//! last group, and normalizes kept buffers to CPU before forwarding.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use kino_core::meta::VideoMetadata;
use kino_core::types::{Device, WorkItem};
use kino_observe::profiler::Profiler;
use tracing::info;

use crate::entry::EvalEntry;
use crate::evaluator::{EvaluatorCapabilities, EvaluatorConfig, EvaluatorFactory};
use crate::memory::{Allocator, Buffer};
use crate::queue::WorkQueue;

pub struct EvalWorkerArgs {
    pub warmup_count: i64,
    pub work_item_size: i64,
    pub videos: Arc<Vec<VideoMetadata>>,
    pub work_items: Arc<Vec<WorkItem>>,

    pub rank: usize,
    pub pu: usize,
    pub group_index: usize,
    pub last_group: bool,
    pub factories: Vec<Arc<dyn EvaluatorFactory>>,
    pub configs: Vec<EvaluatorConfig>,
    pub allocator: Arc<Allocator>,
    pub profiler: Profiler,

    pub input: WorkQueue<EvalEntry>,
    pub output: WorkQueue<EvalEntry>,
}

struct Stage {
    columns: Vec<Vec<Buffer>>,
    device: Device,
}

pub fn run_eval_worker(args: EvalWorkerArgs) -> Result<()> {
    let setup_start = Instant::now();
    ensure!(
        args.factories.len() == args.configs.len(),
        "factory group and config lists differ in length"
    );
    ensure!(!args.factories.is_empty(), "factory group is empty");

    let caps: Vec<EvaluatorCapabilities> =
        args.factories.iter().map(|f| f.capabilities()).collect();
    let output_names: Vec<Vec<String>> = args
        .factories
        .iter()
        .map(|f| f.output_column_names())
        .collect();
    let mut evaluators: Vec<_> = args
        .factories
        .iter()
        .zip(args.configs.iter())
        .map(|(factory, config)| factory.new_evaluator(config.clone()))
        .collect();
    for evaluator in &mut evaluators {
        evaluator.set_profiler(args.profiler.clone());
    }

    let last_column_names = output_names
        .last()
        .cloned()
        .unwrap_or_default();

    args.profiler.add_interval("setup", setup_start, Instant::now());

    let mut last_video_index: Option<usize> = None;
    let mut last_next_item_id: Option<i64> = None;

    loop {
        let idle_start = Instant::now();
        let Some(entry) = args.input.pop()? else {
            break;
        };
        args.profiler.add_interval("idle", idle_start, Instant::now());

        info!(
            rank = args.rank,
            pu = args.pu,
            group = args.group_index,
            item = entry.work_item_index,
            "eval: processing item"
        );

        let work_start = Instant::now();

        let work_item = args
            .work_items
            .get(entry.work_item_index)
            .context("eval entry references an unknown work item")?;
        let metadata = &args.videos[work_item.video_index];

        let needs_configure = last_video_index != Some(work_item.video_index);
        let needs_reset = needs_configure || last_next_item_id != Some(work_item.item_id);
        for evaluator in &mut evaluators {
            if needs_configure {
                evaluator.configure(metadata)?;
            }
            if needs_reset {
                evaluator.reset()?;
            }
        }
        last_video_index = Some(work_item.video_index);
        last_next_item_id = Some(work_item.next_item_id);

        let mut out_entry = EvalEntry {
            work_item_index: entry.work_item_index,
            column_names: last_column_names.clone(),
            columns: (0..last_column_names.len()).map(|_| Vec::new()).collect(),
            device: Device::cpu(),
            video_decode: false,
        };

        let video_decode = entry.video_decode;
        let in_device = entry.device;
        let mut in_columns = entry.columns;
        let total_inputs = in_columns.first().map_or(0, Vec::len);

        // `current_input` counts post-fan-out rows, which is what the warmup
        // trim below is phrased in; `consumed` tracks rows drained from the
        // incoming entry.
        let mut current_input: usize = 0;
        let mut consumed: usize = 0;

        while consumed < total_inputs {
            let take = (args.work_item_size.max(1) as usize).min(total_inputs - consumed);
            // The batch starts life as the output of a virtual stage so each
            // evaluator iteration can swap output into input.
            let mut stage = Stage {
                columns: in_columns
                    .iter_mut()
                    .map(|col| col.drain(..take).collect())
                    .collect(),
                device: in_device,
            };
            consumed += take;
            let mut batch_size = take;

            for (e, evaluator) in evaluators.iter_mut().enumerate() {
                let target = Device {
                    kind: caps[e].device_type,
                    id: args.configs[e].device_id,
                };

                let mut input = stage;
                if input.device != target {
                    migrate(&args.allocator, &mut input, target);
                }

                let mut outputs: Vec<Vec<Buffer>> = Vec::new();
                evaluator
                    .evaluate(&input.columns, &mut outputs)
                    .with_context(|| {
                        format!("evaluator {e} of group {} failed", args.group_index)
                    })?;

                ensure!(
                    outputs.len() == output_names[e].len(),
                    "evaluator {e} produced {} output columns, expected {}",
                    outputs.len(),
                    output_names[e].len()
                );
                if e == 0 && video_decode {
                    // Decode fans one encoded blob out into many rows; the
                    // row-count contract resumes from its output.
                    batch_size = outputs.first().map_or(0, Vec::len);
                } else {
                    for (c, column) in outputs.iter().enumerate() {
                        ensure!(
                            column.len() == batch_size,
                            "evaluator {e} produced {} rows for column {}, expected {batch_size}",
                            column.len(),
                            output_names[e][c]
                        );
                    }
                }

                for column in input.columns {
                    for buffer in column {
                        args.allocator.release(buffer);
                    }
                }

                stage = Stage {
                    columns: outputs,
                    device: target,
                };
            }

            // Only the last group discards warmup rows; earlier groups must
            // forward them so downstream evaluators warm up too.
            let warmup_in_batch = if args.last_group && needs_reset {
                let total_warmup =
                    args.warmup_count.min(work_item.rows_from_start).max(0) as usize;
                batch_size.min(total_warmup.saturating_sub(current_input))
            } else {
                0
            };

            for column in &mut stage.columns {
                for buffer in column.drain(..warmup_in_batch) {
                    args.allocator.release(buffer);
                }
            }

            // Downstream consumers are not device-aware.
            if stage.device != Device::cpu() {
                migrate(&args.allocator, &mut stage, Device::cpu());
            }

            ensure!(
                stage.columns.len() == out_entry.columns.len(),
                "group {} emitted {} columns, expected {}",
                args.group_index,
                stage.columns.len(),
                out_entry.columns.len()
            );
            for (dst, src) in out_entry.columns.iter_mut().zip(stage.columns) {
                dst.extend(src);
            }

            current_input += batch_size;
        }

        args.profiler.add_interval("task", work_start, Instant::now());

        info!(
            rank = args.rank,
            pu = args.pu,
            group = args.group_index,
            item = out_entry.work_item_index,
            "eval: finished item"
        );

        args.output.push(out_entry)?;
    }

    info!(
        rank = args.rank,
        pu = args.pu,
        group = args.group_index,
        "eval: worker finished"
    );
    Ok(())
}

/// Moves every buffer in the stage onto `target`, releasing the originals.
fn migrate(allocator: &Allocator, stage: &mut Stage, target: Device) {
    for column in &mut stage.columns {
        let old = std::mem::take(column);
        for buffer in old {
            column.push(allocator.copy_to(target, &buffer));
            allocator.release(buffer);
        }
    }
    stage.device = target;
}
