//! Single-slot checkpoint store.
//!
//! A checkpoint is one safetensors file holding the model tensors under `model.`, the
//! optimizer tensors under `optimizer.`, and the iteration, best validation loss and model
//! hyperparameters as string metadata. Writes go to a temporary file first and are renamed
//! over the slot, so a reader never sees a half written checkpoint.

use std::{collections::HashMap, fs, path::PathBuf};

use machine_learning::{ModelArgs, Snapshot};
use serde_json::Value;

use crate::error::{ConfigErr, Result, TrainErr};

pub const CHECKPOINT_FILE: &str = "ckpt.safetensors";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const ITERATION_KEY: &str = "iteration";
const BEST_VAL_LOSS_KEY: &str = "best_val_loss";
const MODEL_ARGS_KEY: &str = "model_args";

/// Everything needed to continue a run where it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub model: Snapshot,
    pub optimizer: Snapshot,
    pub model_args: ModelArgs,
    pub iteration: u64,
    pub best_val_loss: f32,
}

/// Reads and writes the checkpoint slot of an output directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the checkpoint slot.
    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Whether a checkpoint has been written to the slot.
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Replaces the checkpoint in the slot.
    ///
    /// # Arguments
    /// * `checkpoint` - The state to persist.
    ///
    /// # Returns
    /// An io error if the file couldn't be written or renamed.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path();
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));

        let mut tensors = checkpoint.model.prefixed(MODEL_PREFIX);
        tensors.merge(checkpoint.optimizer.prefixed(OPTIMIZER_PREFIX));

        let model_args = serde_json::to_string(&checkpoint.model_args)
            .map_err(|e| TrainErr::checkpoint(&path, e))?;
        let metadata = HashMap::from([
            (ITERATION_KEY.to_string(), checkpoint.iteration.to_string()),
            (
                BEST_VAL_LOSS_KEY.to_string(),
                checkpoint.best_val_loss.to_string(),
            ),
            (MODEL_ARGS_KEY.to_string(), model_args),
        ]);

        let bytes = tensors.to_bytes(metadata)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;

        log::debug!(iteration = checkpoint.iteration; "checkpoint written to {}", path.display());
        Ok(())
    }

    /// Reads the checkpoint in the slot.
    ///
    /// # Arguments
    /// * `requested` - The hyperparameters of the run about to resume.
    ///
    /// # Returns
    /// * `TrainErr::Checkpoint` if the file is missing or can't be parsed.
    /// * `ConfigErr::HyperparameterMismatch` if the checkpoint was trained with other
    ///   hyperparameters than `requested`.
    pub fn load(&self, requested: &ModelArgs) -> Result<Checkpoint> {
        let path = self.path();
        let bytes = fs::read(&path).map_err(|e| TrainErr::checkpoint(&path, e))?;
        let (tensors, metadata) =
            Snapshot::from_bytes(&bytes).map_err(|e| TrainErr::checkpoint(&path, e))?;

        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| TrainErr::checkpoint(&path, format!("no {key} metadata")))
        };

        let iteration = field(ITERATION_KEY)?
            .parse::<u64>()
            .map_err(|e| TrainErr::checkpoint(&path, format!("bad {ITERATION_KEY}: {e}")))?;
        let best_val_loss = field(BEST_VAL_LOSS_KEY)?
            .parse::<f32>()
            .map_err(|e| TrainErr::checkpoint(&path, format!("bad {BEST_VAL_LOSS_KEY}: {e}")))?;
        let model_args: ModelArgs = serde_json::from_str(field(MODEL_ARGS_KEY)?)
            .map_err(|e| TrainErr::checkpoint(&path, format!("bad {MODEL_ARGS_KEY}: {e}")))?;

        check_hyperparameters(&model_args, requested)?;

        Ok(Checkpoint {
            model: tensors.strip_prefix(MODEL_PREFIX),
            optimizer: tensors.strip_prefix(OPTIMIZER_PREFIX),
            model_args,
            iteration,
            best_val_loss,
        })
    }
}

/// Fails on the first hyperparameter whose value differs between both sides.
fn check_hyperparameters(checkpoint: &ModelArgs, requested: &ModelArgs) -> Result<()> {
    let (saved, wanted) = (checkpoint.to_map(), requested.to_map());

    for (key, value) in &saved {
        let other = wanted.get(key).unwrap_or(&Value::Null);
        if value != other {
            return Err(ConfigErr::HyperparameterMismatch {
                key: key.clone(),
                checkpoint: value.to_string(),
                requested: other.to_string(),
            }
            .into());
        }
    }

    Ok(())
}
