use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax cross-entropy over logits.
#[derive(Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    fn check(y_pred: &ArrayView2<f32>, targets: &[usize]) -> Result<()> {
        if y_pred.nrows() != targets.len() {
            return Err(MlErr::SizeMismatch {
                what: "loss targets",
                got: targets.len(),
                expected: y_pred.nrows(),
            });
        }

        if let Some(&bad) = targets.iter().find(|&&t| t >= y_pred.ncols()) {
            return Err(MlErr::TokenOutOfRange {
                token: bad as u32,
                vocab_size: y_pred.ncols(),
            });
        }

        Ok(())
    }

    /// Row-wise softmax, shifted by the row max for stability.
    pub fn softmax(y_pred: ArrayView2<f32>) -> Array2<f32> {
        let mut probs = y_pred.to_owned();
        for mut row in probs.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row /= sum;
        }
        probs
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, targets: &[usize]) -> Result<f32> {
        Self::check(&y_pred, targets)?;

        let total: f32 = y_pred
            .axis_iter(Axis(0))
            .zip(targets)
            .map(|(row, &t)| {
                let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
                let lse = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
                lse - row[t]
            })
            .sum();

        Ok(total / targets.len().max(1) as f32)
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, targets: &[usize]) -> Result<Array2<f32>> {
        Self::check(&y_pred, targets)?;

        let n = targets.len().max(1) as f32;
        let mut d = Self::softmax(y_pred);
        for (mut row, &t) in d.axis_iter_mut(Axis(0)).zip(targets) {
            row[t] -= 1.0;
        }
        d /= n;
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_cost_log_vocab() {
        let y_pred = Array2::zeros((3, 4));
        let loss = CrossEntropy::new().loss(y_pred.view(), &[0, 1, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn gradient_rows_sum_to_zero() {
        let y_pred = array![[1.0, 2.0, 0.5], [-1.0, 0.0, 3.0]];
        let d = CrossEntropy::new()
            .loss_prime(y_pred.view(), &[2, 0])
            .unwrap();

        for row in d.axis_iter(Axis(0)) {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!(d[[0, 2]] < 0.0);
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let y_pred = Array2::zeros((1, 2));
        assert!(CrossEntropy::new().loss(y_pred.view(), &[2]).is_err());
    }
}
