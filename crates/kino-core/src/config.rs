use thiserror::Error;

/// Per-node tuning, fixed for the lifetime of a job.
///
/// Built once from the CLI/environment and passed down explicitly; nothing in
/// the pipeline reads ambient configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTuning {
    /// Maximum logical rows per work item (and per evaluator batch).
    pub work_item_size: i64,
    pub load_workers_per_node: usize,
    pub pus_per_node: usize,
    pub save_workers_per_node: usize,
    /// Intake gate: a node keeps `accepted - retired` below
    /// `pus_per_node * tasks_in_queue_per_pu`.
    pub tasks_in_queue_per_pu: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TuningError {
    #[error("invalid tuning: {0}")]
    Invalid(&'static str),
}

impl NodeTuning {
    pub fn validate(&self) -> Result<(), TuningError> {
        if self.work_item_size < 1 {
            return Err(TuningError::Invalid("work_item_size must be >= 1"));
        }
        if self.load_workers_per_node == 0 {
            return Err(TuningError::Invalid("load_workers_per_node must be >= 1"));
        }
        if self.pus_per_node == 0 {
            return Err(TuningError::Invalid("pus_per_node must be >= 1"));
        }
        if self.save_workers_per_node == 0 {
            return Err(TuningError::Invalid("save_workers_per_node must be >= 1"));
        }
        if self.tasks_in_queue_per_pu == 0 {
            return Err(TuningError::Invalid("tasks_in_queue_per_pu must be >= 1"));
        }
        Ok(())
    }

    /// Backlog the intake loop allows before it stops accepting work.
    pub fn intake_limit(&self) -> i64 {
        (self.pus_per_node * self.tasks_in_queue_per_pu) as i64
    }

    /// Capacity of every inter-stage queue.
    pub fn queue_capacity(&self) -> usize {
        self.pus_per_node * self.tasks_in_queue_per_pu
    }
}

impl Default for NodeTuning {
    fn default() -> Self {
        Self {
            work_item_size: 512,
            load_workers_per_node: 2,
            pus_per_node: 1,
            save_workers_per_node: 2,
            tasks_in_queue_per_pu: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tuning_is_valid() {
        NodeTuning::default().validate().expect("valid");
    }

    #[test]
    fn zero_workers_rejected() {
        let mut t = NodeTuning::default();
        t.load_workers_per_node = 0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn intake_limit_scales_with_pus() {
        let t = NodeTuning {
            pus_per_node: 3,
            tasks_in_queue_per_pu: 4,
            ..NodeTuning::default()
        };
        assert_eq!(t.intake_limit(), 12);
        assert_eq!(t.queue_capacity(), 12);
    }
}
