use std::ops::{Deref, DerefMut};

use machine_learning::LanguageModel;
use rand::Rng;

use crate::{
    data::{CorpusSampler, Split},
    error::Result,
};

/// Mean loss of each split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalLosses {
    pub train: f32,
    pub validation: f32,
}

/// Keeps a model in eval mode while alive, switching it back to train mode on drop.
struct EvalModeGuard<'a, M: LanguageModel> {
    model: &'a mut M,
}

impl<'a, M: LanguageModel> EvalModeGuard<'a, M> {
    fn new(model: &'a mut M) -> Self {
        model.eval_mode();
        Self { model }
    }
}

impl<M: LanguageModel> Deref for EvalModeGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: LanguageModel> DerefMut for EvalModeGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: LanguageModel> Drop for EvalModeGuard<'_, M> {
    fn drop(&mut self) {
        self.model.train_mode();
    }
}

/// Estimates the loss of both splits over freshly sampled batches.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    eval_iters: usize,
}

impl Evaluator {
    /// Creates a new `Evaluator`.
    ///
    /// # Arguments
    /// * `eval_iters` - Batches averaged per split.
    pub fn new(eval_iters: usize) -> Self {
        Self { eval_iters }
    }

    /// Runs the model in eval mode over `eval_iters` batches of each split.
    ///
    /// Parameters, gradients and optimizer state are left untouched, and the model is back in
    /// train mode when this returns, even on error.
    ///
    /// # Returns
    /// The arithmetic mean loss per split.
    pub fn estimate_loss<M, R>(
        &self,
        model: &mut M,
        sampler: &CorpusSampler,
        rng: &mut R,
    ) -> Result<EvalLosses>
    where
        M: LanguageModel,
        R: Rng + ?Sized,
    {
        let mut model = EvalModeGuard::new(model);
        let mut means = [0.0; 2];

        for (mean, split) in means.iter_mut().zip(Split::ALL) {
            let mut total = 0.0;
            for _ in 0..self.eval_iters {
                let batch = sampler.get_batch(split, rng)?;
                total += model.forward(&batch)?.loss;
            }
            *mean = total / self.eval_iters.max(1) as f32;
        }

        Ok(EvalLosses {
            train: means[0],
            validation: means[1],
        })
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::{ModelArgs, TokenMlp};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn model() -> TokenMlp {
        let args = ModelArgs {
            n_layer: 1,
            n_embd: 4,
            block_size: 4,
            vocab_size: 16,
            dropout: 0.2,
        };
        TokenMlp::from_args(&args, 0).unwrap()
    }

    fn sampler(val_len: u16) -> CorpusSampler {
        let train: Vec<u16> = (0..64).map(|i| i % 16).collect();
        let val: Vec<u16> = (0..val_len).map(|i| (i * 3) % 16).collect();
        CorpusSampler::new(train.into(), val.into(), 2, 4).unwrap()
    }

    #[test]
    fn evaluation_leaves_params_and_mode_untouched() {
        let mut model = model();
        let sampler = sampler(64);
        let mut rng = StdRng::seed_from_u64(0);
        let before = model.params().to_vec();

        let eval = Evaluator::new(3);
        let first = eval.estimate_loss(&mut model, &sampler, &mut rng).unwrap();
        let second = eval.estimate_loss(&mut model, &sampler, &mut rng).unwrap();

        assert_eq!(model.params(), before.as_slice());
        assert!(model.is_training());
        assert!(first.train.is_finite() && first.validation.is_finite());
        assert!(second.train.is_finite());
    }

    #[test]
    fn train_mode_is_restored_after_a_failure() {
        let mut model = model();
        let sampler = sampler(64);
        model.crop_context(2).unwrap();

        let eval = Evaluator::new(1);
        let res = eval.estimate_loss(&mut model, &sampler, &mut StdRng::seed_from_u64(0));

        assert!(res.is_err());
        assert!(model.is_training());
    }
}
