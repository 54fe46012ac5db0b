use std::path::Path;

use machine_learning::{Batch, MlErr};
use ndarray::Array2;
use rand::Rng;

use super::TokenArray;
use crate::error::{ConfigErr, Result};

/// One of the two corpus splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Validation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "val",
        }
    }
}

/// Draws random fixed-length windows from the train and validation token arrays.
///
/// Every call samples fresh offsets with replacement; nothing is carried between calls.
pub struct CorpusSampler {
    train: TokenArray,
    validation: TokenArray,
    batch_size: usize,
    block_size: usize,
}

impl CorpusSampler {
    /// Creates a new `CorpusSampler`.
    ///
    /// # Arguments
    /// * `train` - Tokens of the training split.
    /// * `validation` - Tokens of the validation split.
    /// * `batch_size` - Windows per batch.
    /// * `block_size` - Tokens per window.
    ///
    /// # Returns
    /// A `ConfigErr::CorpusTooShort` if a split can't fit one window plus its shifted target.
    pub fn new(
        train: TokenArray,
        validation: TokenArray,
        batch_size: usize,
        block_size: usize,
    ) -> Result<Self> {
        for (split, tokens) in [(Split::Train, &train), (Split::Validation, &validation)] {
            if tokens.len() < block_size + 1 {
                return Err(ConfigErr::CorpusTooShort {
                    split: split.as_str(),
                    len: tokens.len(),
                    required: block_size + 1,
                }
                .into());
            }
        }

        Ok(Self {
            train,
            validation,
            batch_size,
            block_size,
        })
    }

    /// Maps `<dir>/train.bin` and `<dir>/val.bin`.
    pub fn open(dir: &Path, batch_size: usize, block_size: usize) -> Result<Self> {
        let train = TokenArray::open(&dir.join("train.bin"))?;
        let validation = TokenArray::open(&dir.join("val.bin"))?;
        Self::new(train, validation, batch_size, block_size)
    }

    /// Samples `batch_size` input windows and their targets, shifted by one token.
    ///
    /// # Arguments
    /// * `split` - Which split to draw from.
    /// * `rng` - The rank-seeded generator that picks the offsets.
    pub fn get_batch<R: Rng + ?Sized>(&self, split: Split, rng: &mut R) -> Result<Batch> {
        let tokens = match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
        };

        let (b, l) = (self.batch_size, self.block_size);
        let mut inputs = Vec::with_capacity(b * l);
        let mut targets = Vec::with_capacity(b * l);

        for _ in 0..b {
            let start = rng.random_range(0..tokens.len() - l);
            tokens.extend_window(start..start + l, &mut inputs);
            tokens.extend_window(start + 1..start + l + 1, &mut targets);
        }

        let inputs = Array2::from_shape_vec((b, l), inputs).map_err(MlErr::from)?;
        let targets = Array2::from_shape_vec((b, l), targets).map_err(MlErr::from)?;
        Ok(Batch::new(inputs, targets)?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::s;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::error::TrainErr;

    fn counting(len: u16) -> TokenArray {
        (0..len).collect::<Vec<_>>().into()
    }

    #[test]
    fn targets_are_inputs_shifted_by_one() {
        let sampler = CorpusSampler::new(counting(100), counting(50), 4, 8).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        for split in Split::ALL {
            for _ in 0..20 {
                let batch = sampler.get_batch(split, &mut rng).unwrap();
                assert_eq!(batch.inputs().dim(), (4, 8));
                assert_eq!(batch.targets().dim(), (4, 8));

                for row in 0..4usize {
                    let x = batch.inputs().slice(s![row, ..]);
                    let y = batch.targets().slice(s![row, ..]);
                    for i in 0..8usize {
                        assert_eq!(y[i], x[i] + 1);
                    }
                }
            }
        }
    }

    #[test]
    fn windows_never_run_past_the_end() {
        let sampler = CorpusSampler::new(counting(9), counting(9), 16, 8).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let batch = sampler.get_batch(Split::Train, &mut rng).unwrap();
        assert!(batch.targets().iter().all(|&t| t < 9));
        assert!(batch.inputs().slice(s![.., 0]).iter().all(|&t| t == 0));
    }

    #[test]
    fn splits_shorter_than_a_window_are_fatal() {
        let err = CorpusSampler::new(counting(100), counting(8), 1, 8).err().unwrap();
        assert!(matches!(
            err,
            TrainErr::Config(ConfigErr::CorpusTooShort {
                split: "val",
                len: 8,
                required: 9
            })
        ));
    }

    #[test]
    fn same_seed_same_batches() {
        let sampler = CorpusSampler::new(counting(1000), counting(1000), 2, 4).unwrap();
        let a = sampler
            .get_batch(Split::Train, &mut StdRng::seed_from_u64(1337))
            .unwrap();
        let b = sampler
            .get_batch(Split::Train, &mut StdRng::seed_from_u64(1337))
            .unwrap();
        let c = sampler
            .get_batch(Split::Train, &mut StdRng::seed_from_u64(1338))
            .unwrap();

        assert_eq!(a.inputs(), b.inputs());
        assert_ne!(a.inputs(), c.inputs());
    }
}
