use std::ops::Range;

use crate::{Result, Snapshot};

/// A set of parameter ranges sharing one learning rate and weight decay.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub ranges: Vec<Range<usize>>,
    pub lr: f32,
    pub weight_decay: f32,
}

impl ParamGroup {
    /// Amount of parameters covered by this group.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(ExactSizeIterator::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates `params` in place using `grad`.
    ///
    /// # Arguments
    /// * `params` - The flat parameter buffer of the model.
    /// * `grad` - The gradient, same length as `params`.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad`, `params` and the optimizer state.
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;

    /// The parameter groups; their `lr` field is the one the driver schedules.
    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Snapshot of the optimizer's internal state.
    fn state_dict(&self) -> Result<Snapshot>;

    /// Restores the internal state from a snapshot produced by `state_dict`.
    fn load_state_dict(&mut self, snapshot: &Snapshot) -> Result<()>;
}
