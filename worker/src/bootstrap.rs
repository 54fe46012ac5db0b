use std::{fs, time::Duration};

use log::info;
use machine_learning::{LanguageModel, Optimizer};

use crate::{
    checkpoint::CheckpointStore,
    config::{InitFrom, TrainConfig},
    data::CorpusSampler,
    distributed::{GradientSync, ProcessGroup, WorkerTopology},
    error::Result,
    loop_::{LoopParts, TrainingLoop, TrainingState},
    metrics::MetricsSink,
};

/// A model and optimizer ready to train, plus where training starts from.
pub struct Initialized<M: LanguageModel> {
    pub model: M,
    pub optimizer: M::Optimizer,
    pub state: TrainingState,
}

/// Builds the model and optimizer `config.init_from` asks for.
///
/// * `scratch` - fresh weights from the configured hyperparameters.
/// * `resume` - weights, optimizer state, iteration and best loss from the checkpoint slot of
///   `out_dir`, which must have been trained with the configured hyperparameters.
/// * anything else - weights from `<pretrained_dir>/<name>.safetensors`.
///
/// The model's context is cropped down to `block_size` when it supports a longer one.
pub fn initialize<M: LanguageModel>(config: &TrainConfig) -> Result<Initialized<M>> {
    // Every replica must start from the same weights, so the rank stays out of this seed.
    let seed = config.seed;
    let mut state = TrainingState::default();
    let mut optimizer_state = None;

    let mut model = match &config.init_from {
        InitFrom::Scratch => {
            info!("initializing a new model from scratch");
            M::from_args(&config.model_args(), seed)?
        }
        InitFrom::Resume => {
            let store = CheckpointStore::new(&config.out_dir);
            info!("resuming training from {}", store.path().display());

            let checkpoint = store.load(&config.model_args())?;
            let mut model = M::from_args(&checkpoint.model_args, seed)?;
            model.load_state_dict(&checkpoint.model)?;

            state.iteration = checkpoint.iteration;
            state.best_val_loss = checkpoint.best_val_loss;
            optimizer_state = Some(checkpoint.optimizer);
            model
        }
        InitFrom::Pretrained(name) => {
            info!("initializing from pretrained weights {name}");
            M::from_pretrained(&config.pretrained_dir, name, seed)?
        }
    };

    if config.block_size < model.args().block_size {
        model.crop_context(config.block_size)?;
    }

    let mut optimizer =
        model.configure_optimizer(config.weight_decay, config.learning_rate, config.betas);
    if let Some(snapshot) = optimizer_state {
        optimizer.load_state_dict(&snapshot)?;
    }

    Ok(Initialized {
        model,
        optimizer,
        state,
    })
}

/// Assembles a `TrainingLoop` around an already formed gradient group.
pub fn assemble<M, S, K>(
    config: &TrainConfig,
    topology: WorkerTopology,
    sync: S,
    sink: K,
) -> Result<TrainingLoop<M, S, K>>
where
    M: LanguageModel,
    S: GradientSync,
    K: MetricsSink,
{
    let (sampler, init) = prepare::<M>(config, &topology)?;
    Ok(finish(config, topology, sampler, init, sync, sink))
}

/// Loads everything local, then forms the process group and assembles the `TrainingLoop`
/// of this worker.
pub async fn build<M, K>(
    config: &TrainConfig,
    topology: WorkerTopology,
    sink: K,
) -> Result<TrainingLoop<M, ProcessGroup, K>>
where
    M: LanguageModel,
    K: MetricsSink,
{
    let (sampler, init) = prepare::<M>(config, &topology)?;

    let timeout = config.sync_timeout_secs.map(Duration::from_secs);
    let group = ProcessGroup::init(&topology, timeout).await?;

    info!(
        rank = topology.rank(),
        world_size = topology.world_size();
        "worker ready"
    );
    Ok(finish(config, topology, sampler, init, group, sink))
}

/// The primary creates `out_dir`, every worker maps `<data_dir>/<dataset>` and initializes
/// its model.
fn prepare<M: LanguageModel>(
    config: &TrainConfig,
    topology: &WorkerTopology,
) -> Result<(CorpusSampler, Initialized<M>)> {
    if topology.is_primary() {
        fs::create_dir_all(&config.out_dir)?;
    }

    let sampler = CorpusSampler::open(&config.corpus_dir(), config.batch_size, config.block_size)?;
    let init = initialize::<M>(config)?;
    Ok((sampler, init))
}

fn finish<M, S, K>(
    config: &TrainConfig,
    topology: WorkerTopology,
    sampler: CorpusSampler,
    init: Initialized<M>,
    sync: S,
    sink: K,
) -> TrainingLoop<M, S, K>
where
    M: LanguageModel,
    S: GradientSync,
    K: MetricsSink,
{
    let Initialized {
        model,
        optimizer,
        state,
    } = init;

    let parts = LoopParts {
        model,
        optimizer,
        sampler,
        sync,
        sink,
    };

    TrainingLoop::new(config, topology, parts, state)
}
