use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Batch, Result, Snapshot, optimization::Optimizer};

/// The hyperparameters that determine a model's parameter layout.
///
/// A checkpoint may only be loaded into a model built from equal arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    pub n_layer: usize,
    pub n_embd: usize,
    pub block_size: usize,
    pub vocab_size: usize,
    pub dropout: f32,
}

impl ModelArgs {
    /// The arguments as a `name -> value` mapping.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// The result of a forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Next-token logits, one row per input position, shape `(batch * block, vocab)`.
    pub logits: Array2<f32>,
    /// Mean cross-entropy over every position of the batch.
    pub loss: f32,
}

/// A trainable next-token model.
///
/// Parameters and gradients are flat `f32` buffers of equal length; the model decides how
/// they are laid out. Gradients accumulate across `backward` calls until `zero_grad`.
pub trait LanguageModel: Sized {
    type Optimizer: Optimizer;

    /// Builds a freshly initialised model.
    fn from_args(args: &ModelArgs, seed: u64) -> Result<Self>;

    /// Loads `<dir>/<name>.safetensors`, taking the hyperparameters from the file.
    fn from_pretrained(dir: &Path, name: &str, seed: u64) -> Result<Self>;

    /// The hyperparameters this model was built with.
    fn args(&self) -> &ModelArgs;

    /// Shrinks the maximum context length to `block_size`.
    fn crop_context(&mut self, block_size: usize) -> Result<()>;

    /// Runs the model on `batch`. In train mode the activations needed by `backward` are kept.
    fn forward(&mut self, batch: &Batch) -> Result<ForwardOutput>;

    /// Accumulates the gradient of the last train-mode forward pass.
    fn backward(&mut self) -> Result<()>;

    fn zero_grad(&mut self);

    fn params(&self) -> &[f32];

    fn grads(&self) -> &[f32];

    fn grads_mut(&mut self) -> &mut [f32];

    /// Splits the model into its parameters and their gradient, for the optimizer step.
    fn params_and_grads(&mut self) -> (&mut [f32], &[f32]);

    fn state_dict(&self) -> Result<Snapshot>;

    fn load_state_dict(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Builds an optimizer over this model's parameters.
    fn configure_optimizer(&self, weight_decay: f32, lr: f32, betas: (f32, f32)) -> Self::Optimizer;

    fn train_mode(&mut self);

    fn eval_mode(&mut self);

    fn is_training(&self) -> bool;
}
