use std::{path::Path, time::Duration};

use log::info;

/// The outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRecord {
    pub iteration: u64,
    pub train_loss: f32,
    pub val_loss: f32,
    pub lr: f32,
}

/// The outcome of one training iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub iteration: u64,
    pub loss: f32,
    pub lr: f32,
    pub elapsed: Duration,
}

/// Receives the run's telemetry. Only the primary worker's sink is ever called.
pub trait MetricsSink: Send {
    fn on_eval(&mut self, record: &EvalRecord);

    fn on_step(&mut self, record: &StepRecord);

    fn on_checkpoint(&mut self, _iteration: u64, _path: &Path) {}
}

/// Writes the telemetry through `log`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn on_eval(&mut self, record: &EvalRecord) {
        info!(
            "step {}: train loss {:.4}, val loss {:.4}, lr {:e}",
            record.iteration, record.train_loss, record.val_loss, record.lr
        );
    }

    fn on_step(&mut self, record: &StepRecord) {
        info!(
            "iter {}: loss {:.4}, time {:.2}ms",
            record.iteration,
            record.loss,
            record.elapsed.as_secs_f64() * 1000.0
        );
    }

    fn on_checkpoint(&mut self, iteration: u64, path: &Path) {
        info!(iteration = iteration; "saving checkpoint to {}", path.display());
    }
}

/// Counters of what one run did, returned when it ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrainMetrics {
    pub iterations: u64,
    pub train_batches: u64,
    pub evals: u64,
    pub checkpoints_written: u64,
}

impl TrainMetrics {
    #[inline]
    pub fn bump_iteration(&mut self) {
        self.iterations += 1;
    }

    #[inline]
    pub fn bump_train_batch(&mut self) {
        self.train_batches += 1;
    }

    #[inline]
    pub fn bump_eval(&mut self) {
        self.evals += 1;
    }

    #[inline]
    pub fn bump_checkpoint(&mut self) {
        self.checkpoints_written += 1;
    }
}
