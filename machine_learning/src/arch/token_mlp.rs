use std::{collections::HashMap, fs, ops::Range, path::Path};

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::Normal;

use super::{
    ForwardOutput, LanguageModel, ModelArgs,
    layout::{LayoutEntry, ParameterLayout},
    loss::{CrossEntropy, LossFn},
};
use crate::{AdamW, Batch, MlErr, ParamGroup, Result, Snapshot};

const INIT_STD: f32 = 0.02;
const ADAM_EPSILON: f32 = 1e-8;
const MODEL_ARGS_KEY: &str = "model_args";

/// Activations kept by a train-mode forward pass.
struct ForwardCache {
    tokens: Vec<usize>,
    targets: Vec<usize>,
    mask: Option<Array2<f32>>,
    /// Input of every block, plus the input of the LM head as the last entry.
    xs: Vec<Array2<f32>>,
    /// `tanh` output of every block.
    acts: Vec<Array2<f32>>,
    logits: Array2<f32>,
}

/// A small residual next-token model.
///
/// Tokens are embedded, passed through dropout and `n_layer` blocks of `x + tanh(x W + b)`,
/// then projected back onto the vocabulary. Positions are independent of each other, so the
/// block size only bounds how long a sequence may be.
pub struct TokenMlp {
    args: ModelArgs,
    layout: ParameterLayout,
    params: Box<[f32]>,
    grads: Box<[f32]>,
    training: bool,
    rng: StdRng,
    loss_fn: CrossEntropy,
    cache: Option<ForwardCache>,
}

impl TokenMlp {
    /// Writes the parameters to `path` in the format `from_pretrained` reads.
    ///
    /// # Arguments
    /// * `path` - Destination file, usually `<dir>/<name>.safetensors`.
    ///
    /// # Returns
    /// An io or serialization error if the file couldn't be produced.
    pub fn save_pretrained(&self, path: &Path) -> Result<()> {
        let metadata = HashMap::from([(
            MODEL_ARGS_KEY.to_string(),
            serde_json::to_string(&self.args)?,
        )]);
        let bytes = self.state_dict()?.to_bytes(metadata)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    fn validate(args: &ModelArgs) -> Result<()> {
        let dims = [
            ("n_layer", args.n_layer),
            ("n_embd", args.n_embd),
            ("block_size", args.block_size),
            ("vocab_size", args.vocab_size),
        ];

        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(MlErr::InvalidArgs(format!("{name} must be positive")));
        }

        if !(0.0..1.0).contains(&args.dropout) {
            return Err(MlErr::InvalidArgs(format!(
                "dropout must be in [0, 1), got {}",
                args.dropout
            )));
        }

        Ok(())
    }

    fn flatten_tokens(&self, tokens: &Array2<u32>) -> Result<Vec<usize>> {
        tokens
            .iter()
            .map(|&t| {
                if (t as usize) < self.args.vocab_size {
                    Ok(t as usize)
                } else {
                    Err(MlErr::TokenOutOfRange {
                        token: t,
                        vocab_size: self.args.vocab_size,
                    })
                }
            })
            .collect()
    }

    fn dropout_mask(&mut self, shape: (usize, usize)) -> Option<Array2<f32>> {
        let p = self.args.dropout;
        if !self.training || p == 0.0 {
            return None;
        }

        let scale = 1.0 / (1.0 - p);
        let rng = &mut self.rng;
        Some(Array2::from_shape_simple_fn(shape, || {
            if rng.random_bool(p as f64) { 0.0 } else { scale }
        }))
    }
}

fn view1<'a>(buf: &'a [f32], entry: &LayoutEntry) -> Result<ArrayView1<'a, f32>> {
    Ok(ArrayView1::from_shape(entry.shape[0], &buf[entry.range.clone()])?)
}

fn view2<'a>(buf: &'a [f32], entry: &LayoutEntry) -> Result<ArrayView2<'a, f32>> {
    let shape = (entry.shape[0], entry.shape[1]);
    Ok(ArrayView2::from_shape(shape, &buf[entry.range.clone()])?)
}

fn view1_mut<'a>(buf: &'a mut [f32], entry: &LayoutEntry) -> Result<ArrayViewMut1<'a, f32>> {
    Ok(ArrayViewMut1::from_shape(entry.shape[0], &mut buf[entry.range.clone()])?)
}

fn view2_mut<'a>(buf: &'a mut [f32], entry: &LayoutEntry) -> Result<ArrayViewMut2<'a, f32>> {
    let shape = (entry.shape[0], entry.shape[1]);
    Ok(ArrayViewMut2::from_shape(shape, &mut buf[entry.range.clone()])?)
}

impl LanguageModel for TokenMlp {
    type Optimizer = AdamW;

    fn from_args(args: &ModelArgs, seed: u64) -> Result<Self> {
        Self::validate(args)?;

        let layout = ParameterLayout::new(args);
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, INIT_STD).map_err(|e| MlErr::InvalidArgs(e.to_string()))?;

        let mut params = vec![0.0; layout.size()].into_boxed_slice();
        for entry in layout.entries().filter(|e| e.shape.len() == 2) {
            params[entry.range.clone()]
                .iter_mut()
                .for_each(|p| *p = rng.sample(normal));
        }

        Ok(Self {
            args: args.clone(),
            grads: vec![0.0; layout.size()].into_boxed_slice(),
            layout,
            params,
            training: true,
            rng,
            loss_fn: CrossEntropy::new(),
            cache: None,
        })
    }

    fn from_pretrained(dir: &Path, name: &str, seed: u64) -> Result<Self> {
        let path = dir.join(format!("{name}.safetensors"));
        let bytes = fs::read(&path)?;
        let (snapshot, metadata) = Snapshot::from_bytes(&bytes)?;

        let raw_args = metadata.get(MODEL_ARGS_KEY).ok_or_else(|| {
            MlErr::Format(format!("{} has no {MODEL_ARGS_KEY} metadata", path.display()))
        })?;
        let args: ModelArgs = serde_json::from_str(raw_args)?;

        let mut model = Self::from_args(&args, seed)?;
        model.load_state_dict(&snapshot)?;
        Ok(model)
    }

    fn args(&self) -> &ModelArgs {
        &self.args
    }

    fn crop_context(&mut self, block_size: usize) -> Result<()> {
        if block_size > self.args.block_size {
            return Err(MlErr::ContextTooLong {
                got: block_size,
                max: self.args.block_size,
            });
        }

        if block_size == 0 {
            return Err(MlErr::InvalidArgs("block_size must be positive".into()));
        }

        self.args.block_size = block_size;
        Ok(())
    }

    fn forward(&mut self, batch: &Batch) -> Result<ForwardOutput> {
        if batch.block_size() > self.args.block_size {
            return Err(MlErr::ContextTooLong {
                got: batch.block_size(),
                max: self.args.block_size,
            });
        }

        let tokens = self.flatten_tokens(batch.inputs())?;
        let targets = self.flatten_tokens(batch.targets())?;
        let n = tokens.len();
        let e = self.args.n_embd;

        let wte = view2(&self.params, &self.layout.wte)?;
        let mut x = Array2::zeros((n, e));
        for (mut row, &t) in x.axis_iter_mut(Axis(0)).zip(&tokens) {
            row.assign(&wte.row(t));
        }

        let mask = self.dropout_mask((n, e));
        if let Some(mask) = &mask {
            x *= mask;
        }

        let mut xs = Vec::with_capacity(self.layout.blocks.len() + 1);
        let mut acts = Vec::with_capacity(self.layout.blocks.len());
        for block in &self.layout.blocks {
            let w = view2(&self.params, &block.weight)?;
            let b = view1(&self.params, &block.bias)?;

            let mut a = Array2::zeros((n, e));
            linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut a);
            a += &b;
            a.mapv_inplace(f32::tanh);

            let next = &x + &a;
            xs.push(x);
            acts.push(a);
            x = next;
        }

        let head = view2(&self.params, &self.layout.lm_head)?;
        let mut logits = Array2::zeros((n, self.args.vocab_size));
        linalg::general_mat_mul(1.0, &x, &head, 0.0, &mut logits);
        xs.push(x);

        let loss = self.loss_fn.loss(logits.view(), &targets)?;

        self.cache = self.training.then(|| ForwardCache {
            tokens,
            targets,
            mask,
            xs,
            acts,
            logits: logits.clone(),
        });

        Ok(ForwardOutput { logits, loss })
    }

    fn backward(&mut self) -> Result<()> {
        let cache = self.cache.take().ok_or(MlErr::NoForwardCache)?;
        let layout = &self.layout;
        let params = &self.params;
        let grads = &mut self.grads;

        let d_logits = self.loss_fn.loss_prime(cache.logits.view(), &cache.targets)?;

        let head = view2(params, &layout.lm_head)?;
        let x_last = &cache.xs[layout.blocks.len()];
        let mut d_head = view2_mut(grads, &layout.lm_head)?;
        linalg::general_mat_mul(1.0, &x_last.t(), &d_logits, 1.0, &mut d_head);

        let mut dx = Array2::zeros(x_last.raw_dim());
        linalg::general_mat_mul(1.0, &d_logits, &head.t(), 0.0, &mut dx);

        for (l, block) in layout.blocks.iter().enumerate().rev() {
            let (x, a) = (&cache.xs[l], &cache.acts[l]);

            let mut dz = dx.clone();
            dz.zip_mut_with(a, |d, &a| *d *= 1.0 - a * a);

            let mut dw = view2_mut(grads, &block.weight)?;
            linalg::general_mat_mul(1.0, &x.t(), &dz, 1.0, &mut dw);

            let mut db = view1_mut(grads, &block.bias)?;
            db += &dz.sum_axis(Axis(0));

            let w = view2(params, &block.weight)?;
            linalg::general_mat_mul(1.0, &dz, &w.t(), 1.0, &mut dx);
        }

        if let Some(mask) = &cache.mask {
            dx *= mask;
        }

        let mut d_wte = view2_mut(grads, &layout.wte)?;
        for (row, &t) in dx.axis_iter(Axis(0)).zip(&cache.tokens) {
            let mut target = d_wte.row_mut(t);
            target += &row;
        }

        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grads.fill(0.0);
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn grads(&self) -> &[f32] {
        &self.grads
    }

    fn grads_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn params_and_grads(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    fn state_dict(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for entry in self.layout.entries() {
            snapshot.insert(
                entry.name.clone(),
                entry.shape.clone(),
                self.params[entry.range.clone()].to_vec(),
            )?;
        }
        Ok(snapshot)
    }

    fn load_state_dict(&mut self, snapshot: &Snapshot) -> Result<()> {
        for entry in self.layout.entries() {
            let blob = snapshot.expect(&entry.name, &entry.shape)?;
            self.params[entry.range.clone()].copy_from_slice(&blob.data);
        }
        self.cache = None;
        Ok(())
    }

    fn configure_optimizer(&self, weight_decay: f32, lr: f32, betas: (f32, f32)) -> AdamW {
        let (decay, no_decay): (Vec<_>, Vec<_>) = self.layout.entries().partition(|e| e.decay);
        let ranges = |entries: Vec<&LayoutEntry>| -> Vec<Range<usize>> {
            entries.into_iter().map(|e| e.range.clone()).collect()
        };

        let groups = vec![
            ParamGroup {
                ranges: ranges(decay),
                lr,
                weight_decay,
            },
            ParamGroup {
                ranges: ranges(no_decay),
                lr,
                weight_decay: 0.0,
            },
        ];

        AdamW::new(self.layout.size(), groups, betas, ADAM_EPSILON)
    }

    fn train_mode(&mut self) {
        self.training = true;
    }

    fn eval_mode(&mut self) {
        self.training = false;
        self.cache = None;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::Optimizer;

    fn args(dropout: f32) -> ModelArgs {
        ModelArgs {
            n_layer: 2,
            n_embd: 4,
            block_size: 3,
            vocab_size: 6,
            dropout,
        }
    }

    fn batch() -> Batch {
        Batch::new(array![[0, 1, 2], [3, 4, 5]], array![[1, 2, 3], [4, 5, 0]]).unwrap()
    }

    #[test]
    fn same_seed_same_params() {
        let a = TokenMlp::from_args(&args(0.0), 7).unwrap();
        let b = TokenMlp::from_args(&args(0.0), 7).unwrap();
        let c = TokenMlp::from_args(&args(0.0), 8).unwrap();

        assert_eq!(a.params(), b.params());
        assert_ne!(a.params(), c.params());
    }

    #[test]
    fn fresh_model_loss_is_near_log_vocab() {
        let mut model = TokenMlp::from_args(&args(0.0), 0).unwrap();
        let out = model.forward(&batch()).unwrap();

        assert_eq!(out.logits.dim(), (6, 6));
        assert!((out.loss - 6f32.ln()).abs() < 0.1);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut model = TokenMlp::from_args(&args(0.0), 3).unwrap();
        let batch = batch();

        model.forward(&batch).unwrap();
        model.backward().unwrap();
        let analytic = model.grads().to_vec();

        let eps = 1e-2;
        let probes = [0, 7, 25, 30, 44, model.params().len() - 1];
        for &i in &probes {
            let original = model.params[i];

            model.params[i] = original + eps;
            let up = model.forward(&batch).unwrap().loss;
            model.params[i] = original - eps;
            let down = model.forward(&batch).unwrap().loss;
            model.params[i] = original;

            let numeric = (up - down) / (2.0 * eps);
            assert!(
                (numeric - analytic[i]).abs() < 1e-3,
                "param {i}: numeric {numeric}, analytic {}",
                analytic[i]
            );
        }
    }

    #[test]
    fn backward_accumulates_until_zero_grad() {
        let mut model = TokenMlp::from_args(&args(0.0), 1).unwrap();

        model.forward(&batch()).unwrap();
        model.backward().unwrap();
        let once = model.grads().to_vec();

        model.forward(&batch()).unwrap();
        model.backward().unwrap();
        for (twice, once) in model.grads().iter().zip(&once) {
            assert!((twice - 2.0 * once).abs() < 1e-5);
        }

        model.zero_grad();
        assert!(model.grads().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn eval_mode_is_deterministic_and_keeps_no_cache() {
        let mut model = TokenMlp::from_args(&args(0.5), 2).unwrap();
        model.eval_mode();

        let a = model.forward(&batch()).unwrap().loss;
        let b = model.forward(&batch()).unwrap().loss;

        assert_eq!(a, b);
        assert!(matches!(model.backward(), Err(MlErr::NoForwardCache)));
    }

    #[test]
    fn sequences_longer_than_block_size_are_rejected() {
        let mut model = TokenMlp::from_args(&args(0.0), 0).unwrap();
        model.crop_context(2).unwrap();

        assert!(matches!(
            model.forward(&batch()),
            Err(MlErr::ContextTooLong { got: 3, max: 2 })
        ));
        assert!(model.crop_context(3).is_err());
    }

    #[test]
    fn state_dict_round_trips_through_a_fresh_model() {
        let source = TokenMlp::from_args(&args(0.0), 10).unwrap();
        let mut target = TokenMlp::from_args(&args(0.0), 11).unwrap();

        target.load_state_dict(&source.state_dict().unwrap()).unwrap();
        assert_eq!(source.params(), target.params());
    }

    #[test]
    fn pretrained_weights_bring_their_args() {
        let dir = tempfile::tempdir().unwrap();
        let source = TokenMlp::from_args(&args(0.0), 4).unwrap();
        source
            .save_pretrained(&dir.path().join("tiny.safetensors"))
            .unwrap();

        let loaded = TokenMlp::from_pretrained(dir.path(), "tiny", 0).unwrap();
        assert_eq!(loaded.args(), source.args());
        assert_eq!(loaded.params(), source.params());
    }

    #[test]
    fn optimizer_groups_split_by_decay() {
        let model = TokenMlp::from_args(&args(0.0), 0).unwrap();
        let opt = model.configure_optimizer(0.1, 1e-3, (0.9, 0.95));
        let groups = opt.param_groups();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].weight_decay, 0.1);
        assert_eq!(groups[1].weight_decay, 0.0);
        assert_eq!(groups[0].len() + groups[1].len(), model.params().len());
    }

    #[test]
    fn a_few_steps_reduce_the_loss() {
        let mut model = TokenMlp::from_args(&args(0.0), 5).unwrap();
        let mut opt = model.configure_optimizer(0.0, 1e-2, (0.9, 0.95));
        let batch = batch();

        let first = model.forward(&batch).unwrap().loss;
        for _ in 0..20 {
            model.zero_grad();
            model.forward(&batch).unwrap();
            model.backward().unwrap();
            let (params, grads) = model.params_and_grads();
            opt.step(params, grads).unwrap();
        }
        let last = model.forward(&batch).unwrap().loss;

        assert!(last < first);
    }
}
