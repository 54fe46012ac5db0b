use super::{Optimizer, ParamGroup};
use crate::{MlErr, Result, Snapshot};

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";
const STEP: &str = "step";

/// The step counter is stored as 16-bit limbs, low first, each exact in an `f32`.
const STEP_LIMBS: usize = 4;
const LIMB_BITS: u32 = 16;

/// Adam with decoupled weight decay.
#[derive(Debug, Clone)]
pub struct AdamW {
    groups: Vec<ParamGroup>,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: u64,
    m: Box<[f32]>,
    v: Box<[f32]>,
}

impl AdamW {
    /// Creates a new `AdamW` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold state for.
    /// * `groups` - The parameter groups, each with its own learning rate and weight decay.
    /// * `betas` - Decay rates of the first and second moment estimates.
    /// * `epsilon` - Term added to the denominator for numerical stability.
    ///
    /// # Returns
    /// A new `AdamW` instance.
    pub fn new(
        len: usize,
        groups: Vec<ParamGroup>,
        (beta1, beta2): (f32, f32),
        epsilon: f32,
    ) -> Self {
        Self {
            groups,
            beta1,
            beta2,
            epsilon,
            step: 0,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
        }
    }

    /// Amount of `step` calls applied so far.
    pub fn steps(&self) -> u64 {
        self.step
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        if grad.len() != params.len() {
            return Err(MlErr::SizeMismatch {
                what: "gradient",
                got: grad.len(),
                expected: params.len(),
            });
        }

        if params.len() != self.m.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer state",
                got: params.len(),
                expected: self.m.len(),
            });
        }

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.step += 1;
        let t = self.step as f32;
        let bc1 = 1. - b1.powf(t);
        let bc2 = 1. - b2.powf(t);

        for group in &self.groups {
            let (lr, wd) = (group.lr, group.weight_decay);

            for range in &group.ranges {
                params[range.clone()]
                    .iter_mut()
                    .zip(&grad[range.clone()])
                    .zip(&mut self.m[range.clone()])
                    .zip(&mut self.v[range.clone()])
                    .for_each(|(((p, g), m), v)| {
                        *p *= 1. - lr * wd;
                        *m = b1 * *m + (1. - b1) * g;
                        *v = b2 * *v + (1. - b2) * g.powi(2);
                        let m_hat = *m / bc1;
                        let v_hat = *v / bc2;
                        *p -= lr * m_hat / (v_hat.sqrt() + eps);
                    });
            }
        }

        Ok(())
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn state_dict(&self) -> Result<Snapshot> {
        let len = self.m.len();
        let mut snapshot = Snapshot::new();
        snapshot.insert(EXP_AVG, vec![len], self.m.to_vec())?;
        snapshot.insert(EXP_AVG_SQ, vec![len], self.v.to_vec())?;
        snapshot.insert(STEP, vec![STEP_LIMBS], encode_step(self.step))?;
        Ok(snapshot)
    }

    fn load_state_dict(&mut self, snapshot: &Snapshot) -> Result<()> {
        let len = self.m.len();
        let m = snapshot.expect(EXP_AVG, &[len])?;
        let v = snapshot.expect(EXP_AVG_SQ, &[len])?;
        let step = decode_step(&snapshot.expect(STEP, &[STEP_LIMBS])?.data)?;

        self.m.copy_from_slice(&m.data);
        self.v.copy_from_slice(&v.data);
        self.step = step;
        Ok(())
    }
}

fn encode_step(step: u64) -> Vec<f32> {
    let mask = (1 << LIMB_BITS) - 1;
    (0..STEP_LIMBS as u32)
        .map(|i| ((step >> (i * LIMB_BITS)) & mask) as f32)
        .collect()
}

fn decode_step(limbs: &[f32]) -> Result<u64> {
    limbs.iter().rev().try_fold(0u64, |acc, &limb| {
        if limb.fract() != 0.0 || !(0.0..65536.0).contains(&limb) {
            return Err(MlErr::Format(format!("invalid optimizer step limb {limb}")));
        }

        Ok((acc << LIMB_BITS) | limb as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_group(len: usize, lr: f32, weight_decay: f32) -> Vec<ParamGroup> {
        vec![ParamGroup {
            ranges: vec![0..len],
            lr,
            weight_decay,
        }]
    }

    #[test]
    fn first_step_moves_against_gradient_by_lr() {
        let mut opt = AdamW::new(2, single_group(2, 0.1, 0.0), (0.9, 0.999), 1e-8);
        let mut params = [1.0, -1.0];
        opt.step(&mut params, &[0.5, -2.0]).unwrap();

        // With bias correction the first update is lr * sign(g).
        assert!((params[0] - 0.9).abs() < 1e-5);
        assert!((params[1] + 0.9).abs() < 1e-5);
    }

    #[test]
    fn weight_decay_shrinks_params_without_gradient() {
        let mut opt = AdamW::new(1, single_group(1, 0.1, 0.5), (0.9, 0.999), 1e-8);
        let mut params = [2.0];
        opt.step(&mut params, &[0.0]).unwrap();
        assert!((params[0] - 2.0 * (1.0 - 0.05)).abs() < 1e-6);
    }

    #[test]
    fn params_outside_every_group_are_untouched() {
        let groups = vec![ParamGroup {
            ranges: vec![0..1],
            lr: 0.1,
            weight_decay: 0.0,
        }];
        let mut opt = AdamW::new(2, groups, (0.9, 0.999), 1e-8);
        let mut params = [1.0, 1.0];
        opt.step(&mut params, &[1.0, 1.0]).unwrap();
        assert_eq!(params[1], 1.0);
    }

    #[test]
    fn state_dict_restores_moments() {
        let mut opt = AdamW::new(3, single_group(3, 0.01, 0.1), (0.9, 0.95), 1e-8);
        let mut params = [0.1, 0.2, 0.3];
        opt.step(&mut params, &[1.0, -1.0, 0.5]).unwrap();
        opt.step(&mut params, &[0.2, 0.4, -0.5]).unwrap();

        let mut restored = AdamW::new(3, single_group(3, 0.01, 0.1), (0.9, 0.95), 1e-8);
        restored.load_state_dict(&opt.state_dict().unwrap()).unwrap();
        assert_eq!(restored.steps(), 2);

        let mut a = params;
        let mut b = params;
        opt.step(&mut a, &[0.3, 0.3, 0.3]).unwrap();
        restored.step(&mut b, &[0.3, 0.3, 0.3]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn step_counts_past_f32_precision_survive_a_restore() {
        let mut opt = AdamW::new(1, single_group(1, 0.01, 0.0), (0.9, 0.95), 1e-8);
        opt.step = (1 << 24) + 1;

        let mut restored = AdamW::new(1, single_group(1, 0.01, 0.0), (0.9, 0.95), 1e-8);
        restored.load_state_dict(&opt.state_dict().unwrap()).unwrap();
        assert_eq!(restored.steps(), (1 << 24) + 1);

        opt.step = u64::MAX;
        restored.load_state_dict(&opt.state_dict().unwrap()).unwrap();
        assert_eq!(restored.steps(), u64::MAX);
    }

    #[test]
    fn fractional_step_limbs_are_rejected() {
        let mut opt = AdamW::new(1, single_group(1, 0.01, 0.0), (0.9, 0.95), 1e-8);
        let mut snapshot = opt.state_dict().unwrap();
        snapshot.insert(STEP, vec![STEP_LIMBS], vec![0.5, 0.0, 0.0, 0.0]).unwrap();

        assert!(opt.load_state_dict(&snapshot).is_err());
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let mut opt = AdamW::new(2, single_group(2, 0.1, 0.0), (0.9, 0.999), 1e-8);
        let mut params = [0.0; 2];
        assert!(opt.step(&mut params, &[0.0; 3]).is_err());
    }
}
