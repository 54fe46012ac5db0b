use ndarray::Array2;

use crate::{MlErr, Result};

/// A next-token-prediction batch: `targets[b, t]` is the token that follows `inputs[b, t]`.
///
/// Both arrays have shape `(batch_size, block_size)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    inputs: Array2<u32>,
    targets: Array2<u32>,
}

impl Batch {
    /// Creates a new `Batch`.
    ///
    /// # Errors
    /// Returns `MlErr::SizeMismatch` if the inputs and targets don't share a shape.
    pub fn new(inputs: Array2<u32>, targets: Array2<u32>) -> Result<Self> {
        if inputs.dim() != targets.dim() {
            return Err(MlErr::SizeMismatch {
                what: "batch targets",
                got: targets.len(),
                expected: inputs.len(),
            });
        }

        Ok(Self { inputs, targets })
    }

    pub fn inputs(&self) -> &Array2<u32> {
        &self.inputs
    }

    pub fn targets(&self) -> &Array2<u32> {
        &self.targets
    }

    /// Amount of windows in the batch.
    pub fn batch_size(&self) -> usize {
        self.inputs.nrows()
    }

    /// Length of every window.
    pub fn block_size(&self) -> usize {
        self.inputs.ncols()
    }
}
