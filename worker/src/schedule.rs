use std::f64::consts::PI;

use crate::config::TrainConfig;

/// Maps an iteration to the learning rate every parameter group trains with.
pub trait LrScheduler: Send {
    fn lr(&self, iteration: u64) -> f32;
}

/// Linear warmup to `peak`, then cosine decay down to `min_lr` at `decay_iters`.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmupCosine {
    pub peak: f32,
    pub min_lr: f32,
    pub warmup_iters: u64,
    pub decay_iters: u64,
}

impl LrScheduler for WarmupCosine {
    fn lr(&self, iteration: u64) -> f32 {
        let (peak, min_lr) = (self.peak as f64, self.min_lr as f64);

        if iteration < self.warmup_iters {
            return (peak * iteration as f64 / self.warmup_iters as f64) as f32;
        }

        if iteration > self.decay_iters {
            return self.min_lr;
        }

        let r = (iteration - self.warmup_iters) as f64
            / (self.decay_iters - self.warmup_iters) as f64;
        let coeff = 0.5 * (1.0 + (PI * r).cos());
        (min_lr + coeff * (peak - min_lr)) as f32
    }
}

/// The same rate for every iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantLr(pub f32);

impl LrScheduler for ConstantLr {
    fn lr(&self, _iteration: u64) -> f32 {
        self.0
    }
}

/// Builds the scheduler a configuration asks for.
pub fn from_config(config: &TrainConfig) -> Box<dyn LrScheduler> {
    if !config.decay_lr {
        return Box::new(ConstantLr(config.learning_rate));
    }

    Box::new(WarmupCosine {
        peak: config.learning_rate,
        min_lr: config.min_lr,
        warmup_iters: config.warmup_iters,
        decay_iters: config.lr_decay_iters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEAK: f32 = 2.5e-4;
    const MIN: f32 = 1e-5;

    fn schedule() -> WarmupCosine {
        WarmupCosine {
            peak: PEAK,
            min_lr: MIN,
            warmup_iters: 2000,
            decay_iters: 320_000,
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-9 + 1e-5 * b.abs()
    }

    #[test]
    fn boundaries() {
        let s = schedule();
        assert_eq!(s.lr(0), 0.0);
        assert!(close(s.lr(2000), PEAK));
        assert!(close(s.lr(320_000), MIN));
        assert_eq!(s.lr(500_000), MIN);
    }

    #[test]
    fn continuous_at_both_knots() {
        let s = schedule();
        assert!((s.lr(1999) - s.lr(2000)).abs() < PEAK / 1000.0);
        assert!((s.lr(320_000) - s.lr(320_001)).abs() < 1e-9);
    }

    #[test]
    fn rises_during_warmup_and_falls_during_decay() {
        let s = schedule();

        let warmup: Vec<f32> = (0..=2000).step_by(50).map(|i| s.lr(i)).collect();
        assert!(warmup.windows(2).all(|w| w[0] <= w[1]));

        let decay: Vec<f32> = (2000..=320_000).step_by(1000).map(|i| s.lr(i)).collect();
        assert!(decay.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn disabled_decay_uses_the_peak_rate() {
        let config = TrainConfig {
            decay_lr: false,
            ..TrainConfig::default()
        };
        let s = from_config(&config);

        for i in [0, 1, 2000, 1_000_000] {
            assert_eq!(s.lr(i), config.learning_rate);
        }
    }
}
