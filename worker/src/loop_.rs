use std::time::Instant;

use log::debug;
use machine_learning::{LanguageModel, Optimizer};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    config::TrainConfig,
    data::{CorpusSampler, Split},
    distributed::{GradientSync, WorkerTopology},
    error::Result,
    eval::Evaluator,
    metrics::{EvalRecord, MetricsSink, StepRecord, TrainMetrics},
    schedule::{self, LrScheduler},
};

/// The mutable state of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub iteration: u64,
    /// Lowest validation loss seen so far, starts out worse than any real loss.
    pub best_val_loss: f32,
    /// Recomputed every iteration, never persisted.
    pub lr: f32,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            iteration: 0,
            best_val_loss: f32::INFINITY,
            lr: 0.0,
        }
    }
}

/// Where the driver stands after a call to `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// The run only evaluated the initial model.
    EvalOnlyExit,
    /// `max_iters` was reached.
    Done,
}

/// The collaborators a `TrainingLoop` drives.
pub struct LoopParts<M: LanguageModel, S, K> {
    pub model: M,
    pub optimizer: M::Optimizer,
    pub sampler: CorpusSampler,
    pub sync: S,
    pub sink: K,
}

/// Drives a run one iteration at a time.
///
/// Every worker runs the same loop in lock-step; only the primary evaluates, writes
/// checkpoints and reports telemetry.
pub struct TrainingLoop<M: LanguageModel, S, K> {
    topology: WorkerTopology,
    model: M,
    optimizer: M::Optimizer,
    sampler: CorpusSampler,
    sync: S,
    sink: K,
    scheduler: Box<dyn LrScheduler>,
    evaluator: Evaluator,
    store: CheckpointStore,
    rng: StdRng,
    max_iters: u64,
    eval_interval: u64,
    log_interval: u64,
    eval_only: bool,
    state: TrainingState,
    metrics: TrainMetrics,
    phase: LoopState,
}

impl<M, S, K> TrainingLoop<M, S, K>
where
    M: LanguageModel,
    S: GradientSync,
    K: MetricsSink,
{
    /// Creates a new `TrainingLoop`.
    ///
    /// # Arguments
    /// * `config` - The run's configuration.
    /// * `topology` - This worker's place in the run.
    /// * `parts` - The model, optimizer, sampler, gradient group and sink to drive.
    /// * `state` - Where to start, the default for fresh runs or a checkpoint's on resume.
    ///
    /// # Returns
    /// A new `TrainingLoop` with its batch generator seeded by `seed + rank`.
    pub fn new(
        config: &TrainConfig,
        topology: WorkerTopology,
        parts: LoopParts<M, S, K>,
        state: TrainingState,
    ) -> Self {
        let LoopParts {
            model,
            optimizer,
            sampler,
            sync,
            sink,
        } = parts;

        let rng = StdRng::seed_from_u64(config.seed + topology.rank() as u64);

        Self {
            topology,
            model,
            optimizer,
            sampler,
            sync,
            sink,
            scheduler: schedule::from_config(config),
            evaluator: Evaluator::new(config.eval_iters),
            store: CheckpointStore::new(&config.out_dir),
            rng,
            max_iters: config.max_iters,
            eval_interval: config.eval_interval,
            log_interval: config.log_interval,
            eval_only: config.eval_only,
            state,
            metrics: TrainMetrics::default(),
            phase: LoopState::Running,
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn metrics(&self) -> &TrainMetrics {
        &self.metrics
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Runs one iteration.
    ///
    /// # Returns
    /// The state the loop is in afterwards. Once it stops running further calls do nothing.
    pub async fn step(&mut self) -> Result<LoopState> {
        if self.phase != LoopState::Running {
            return Ok(self.phase);
        }

        if self.state.iteration >= self.max_iters {
            self.phase = LoopState::Done;
            return Ok(self.phase);
        }

        let iteration = self.state.iteration;
        let lr = self.scheduler.lr(iteration);
        self.state.lr = lr;
        for group in self.optimizer.param_groups_mut() {
            group.lr = lr;
        }

        if iteration % self.eval_interval == 0 && self.topology.is_primary() {
            self.evaluate(iteration, lr)?;
        }

        if iteration == 0 && self.eval_only {
            self.phase = LoopState::EvalOnlyExit;
            return Ok(self.phase);
        }

        let started = Instant::now();
        let batch = self.sampler.get_batch(Split::Train, &mut self.rng)?;
        self.metrics.bump_train_batch();

        let loss = self.model.forward(&batch)?.loss;
        self.model.backward()?;
        self.sync.all_reduce_mean(self.model.grads_mut()).await?;

        let (params, grads) = self.model.params_and_grads();
        self.optimizer.step(params, grads)?;
        self.model.zero_grad();

        if self.topology.is_primary() && iteration % self.log_interval == 0 {
            self.sink.on_step(&StepRecord {
                iteration,
                loss,
                lr,
                elapsed: started.elapsed(),
            });
        }

        self.state.iteration += 1;
        self.metrics.bump_iteration();

        if self.state.iteration >= self.max_iters {
            self.phase = LoopState::Done;
        }

        Ok(self.phase)
    }

    /// Runs until the loop stops, then leaves the process group.
    ///
    /// If an iteration fails the rest of the group is told so before this worker lets go of
    /// it, so no peer stays blocked on the barrier.
    ///
    /// # Returns
    /// The run's counters, or the error that stopped the run.
    pub async fn run(&mut self) -> Result<TrainMetrics> {
        let state = match self.drive().await {
            Ok(state) => state,
            Err(e) => {
                self.sync.abort(&e.to_string()).await;
                return Err(e);
            }
        };

        self.sync.shutdown().await?;

        debug!(
            iteration = self.state.iteration;
            "training loop stopped: {state:?}"
        );
        Ok(self.metrics.clone())
    }

    /// Leaves the process group without finishing the run, telling the peers why.
    pub async fn abort(&mut self, reason: &str) {
        self.sync.abort(reason).await;
    }

    async fn drive(&mut self) -> Result<LoopState> {
        loop {
            match self.step().await? {
                LoopState::Running => continue,
                stopped => return Ok(stopped),
            }
        }
    }

    fn evaluate(&mut self, iteration: u64, lr: f32) -> Result<()> {
        let losses = self
            .evaluator
            .estimate_loss(&mut self.model, &self.sampler, &mut self.rng)?;
        self.metrics.bump_eval();

        self.sink.on_eval(&EvalRecord {
            iteration,
            train_loss: losses.train,
            val_loss: losses.validation,
            lr,
        });

        if losses.validation >= self.state.best_val_loss || losses.validation.is_nan() {
            return Ok(());
        }

        self.state.best_val_loss = losses.validation;
        if iteration == 0 {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            model: self.model.state_dict()?,
            optimizer: self.optimizer.state_dict()?,
            model_args: self.model.args().clone(),
            iteration,
            best_val_loss: self.state.best_val_loss,
        };

        self.store.save(&checkpoint)?;
        self.metrics.bump_checkpoint();
        self.sink.on_checkpoint(iteration, &self.store.path());
        Ok(())
    }
}
