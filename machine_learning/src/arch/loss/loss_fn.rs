use ndarray::{Array2, ArrayView2};

use crate::Result;

/// A loss over a batch of predictions, one row per sample.
pub trait LossFn {
    /// Mean loss of `y_pred` against the class indices in `targets`.
    fn loss(&self, y_pred: ArrayView2<f32>, targets: &[usize]) -> Result<f32>;

    /// Gradient of `loss` with respect to `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView2<f32>, targets: &[usize]) -> Result<Array2<f32>>;
}
