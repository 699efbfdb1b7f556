//! The evaluator seam: frame operators the pipeline drives but does not
//! implement, plus the grouping rule that decides which operators share a
//! thread.

use std::sync::Arc;

use kino_core::meta::VideoMetadata;
use kino_core::types::DeviceType;
use kino_observe::profiler::Profiler;
use thiserror::Error;

use crate::memory::{Allocator, Buffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorCapabilities {
    pub device_type: DeviceType,
    /// Rows of lead-in this evaluator needs after a reset before its output
    /// is trustworthy.
    pub warmup_size: i64,
    /// Whether this evaluator may be carved into its own pipeline stage when
    /// it sits at an end of the chain.
    pub can_overlap: bool,
}

/// Per-instance construction parameters handed to a factory.
#[derive(Clone)]
pub struct EvaluatorConfig {
    pub max_input_count: i64,
    pub max_frame_width: i64,
    pub max_frame_height: i64,
    pub device_id: i32,
    pub allocator: Arc<Allocator>,
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator failed: {0}")]
    Failed(String),
    #[error("bad decode args: {0}")]
    DecodeArgs(String),
}

/// One stateful frame operator. The worker calls `configure` on video
/// boundaries, `reset` on discontinuities, and `evaluate` once per batch.
///
/// `evaluate` reads the input columns and pushes one output column per
/// declared output name, allocating rows on the evaluator's own device; the
/// worker releases the inputs afterwards.
pub trait Evaluator: Send {
    fn configure(&mut self, metadata: &VideoMetadata) -> Result<(), EvaluatorError>;
    fn reset(&mut self) -> Result<(), EvaluatorError>;
    fn evaluate(
        &mut self,
        inputs: &[Vec<Buffer>],
        outputs: &mut Vec<Vec<Buffer>>,
    ) -> Result<(), EvaluatorError>;
    fn set_profiler(&mut self, profiler: Profiler) {
        let _ = profiler;
    }
}

pub trait EvaluatorFactory: Send + Sync {
    fn capabilities(&self) -> EvaluatorCapabilities;
    fn output_column_names(&self) -> Vec<String>;
    fn new_evaluator(&self, config: EvaluatorConfig) -> Box<dyn Evaluator>;
}

/// Splits the chain into contiguous groups that each run on one thread per
/// PU.
///
/// The first and last factories are carved into their own stage iff they
/// declare `can_overlap`, so an I/O- or decode-bound end can pipeline with
/// the (typically compute-bound) middle. Everything else stays fused to
/// avoid inter-stage data motion.
pub fn factory_groups(
    factories: &[Arc<dyn EvaluatorFactory>],
) -> Vec<Vec<Arc<dyn EvaluatorFactory>>> {
    assert!(!factories.is_empty(), "evaluator chain is empty");
    if factories.len() == 1 {
        return vec![factories.to_vec()];
    }

    let first_overlaps = factories[0].capabilities().can_overlap;
    let last_overlaps = factories[factories.len() - 1].capabilities().can_overlap;

    let mut groups: Vec<Vec<Arc<dyn EvaluatorFactory>>> = Vec::new();
    if first_overlaps {
        groups.push(vec![factories[0].clone()]);
        groups.push(factories[1..factories.len() - 1].to_vec());
    } else {
        groups.push(factories[..factories.len() - 1].to_vec());
    }

    let last = factories[factories.len() - 1].clone();
    if last_overlaps {
        groups.push(vec![last]);
    } else if let Some(tail) = groups.last_mut() {
        tail.push(last);
    }

    // A two-factory chain with both ends overlappable leaves no middle.
    groups.retain(|g| !g.is_empty());
    groups
}
