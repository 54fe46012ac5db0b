use std::{fmt, fs, path::PathBuf};

use machine_learning::ModelArgs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigErr, Result};

/// Where the model's initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InitFrom {
    Scratch,
    Resume,
    /// Any other name refers to a pretrained weights file.
    Pretrained(String),
}

impl From<String> for InitFrom {
    fn from(value: String) -> Self {
        match value.as_str() {
            "scratch" => Self::Scratch,
            "resume" => Self::Resume,
            _ => Self::Pretrained(value),
        }
    }
}

impl From<InitFrom> for String {
    fn from(value: InitFrom) -> Self {
        value.to_string()
    }
}

impl fmt::Display for InitFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitFrom::Scratch => f.write_str("scratch"),
            InitFrom::Resume => f.write_str("resume"),
            InitFrom::Pretrained(name) => f.write_str(name),
        }
    }
}

/// Every knob of a training run, built once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrainConfig {
    // I/O
    pub out_dir: PathBuf,
    pub eval_interval: u64,
    pub log_interval: u64,
    pub eval_iters: usize,
    pub eval_only: bool,

    // Data
    pub data_dir: PathBuf,
    pub dataset: String,
    pub batch_size: usize,
    pub block_size: usize,

    // Model
    pub init_from: InitFrom,
    pub pretrained_dir: PathBuf,
    pub dropout: f32,
    pub n_layer: usize,
    pub n_embd: usize,
    pub vocab_size: usize,

    // Optimizer
    pub learning_rate: f32,
    pub max_iters: u64,
    pub weight_decay: f32,
    pub betas: (f32, f32),

    // Schedule
    pub decay_lr: bool,
    pub warmup_iters: u64,
    pub lr_decay_iters: u64,
    pub min_lr: f32,

    // Distributed
    pub backend: String,
    pub seed: u64,
    pub sync_timeout_secs: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
            eval_interval: 500,
            log_interval: 1,
            eval_iters: 50,
            eval_only: false,
            data_dir: "data".into(),
            dataset: "openwebtext".into(),
            batch_size: 8,
            block_size: 1024,
            init_from: InitFrom::Scratch,
            pretrained_dir: "pretrained".into(),
            dropout: 0.1,
            n_layer: 12,
            n_embd: 768,
            vocab_size: 50257,
            learning_rate: 2.5e-4,
            max_iters: 500_000,
            weight_decay: 1e-2,
            betas: (0.9, 0.95),
            decay_lr: true,
            warmup_iters: 2000,
            lr_decay_iters: 320_000,
            min_lr: 1e-5,
            backend: "tcp".into(),
            seed: 1337,
            sync_timeout_secs: None,
        }
    }
}

impl TrainConfig {
    /// The model hyperparameters this configuration requests.
    pub fn model_args(&self) -> ModelArgs {
        ModelArgs {
            n_layer: self.n_layer,
            n_embd: self.n_embd,
            block_size: self.block_size,
            vocab_size: self.vocab_size,
            dropout: self.dropout,
        }
    }

    /// Directory holding the `train.bin` and `val.bin` token files.
    pub fn corpus_dir(&self) -> PathBuf {
        self.data_dir.join(&self.dataset)
    }

    /// Checks every cross-field and range constraint.
    ///
    /// # Returns
    /// The first violated constraint as a `ConfigErr::InvalidValue`.
    pub fn validate(&self) -> std::result::Result<(), ConfigErr> {
        let positive = [
            ("eval_interval", self.eval_interval as usize),
            ("log_interval", self.log_interval as usize),
            ("eval_iters", self.eval_iters),
            ("batch_size", self.batch_size),
            ("block_size", self.block_size),
            ("n_layer", self.n_layer),
            ("n_embd", self.n_embd),
            ("vocab_size", self.vocab_size),
        ];

        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(key, "must be greater than zero"));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(invalid("dropout", "must be in [0, 1)"));
        }

        if self.learning_rate <= 0.0 {
            return Err(invalid("learning_rate", "must be greater than zero"));
        }

        if self.weight_decay < 0.0 {
            return Err(invalid("weight_decay", "must not be negative"));
        }

        let (b1, b2) = self.betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return Err(invalid("betas", "both must be in [0, 1)"));
        }

        if self.decay_lr && self.lr_decay_iters <= self.warmup_iters {
            return Err(invalid(
                "lr_decay_iters",
                "must be greater than warmup_iters",
            ));
        }

        if !(0.0..=self.learning_rate).contains(&self.min_lr) {
            return Err(invalid("min_lr", "must be in [0, learning_rate]"));
        }

        if self.backend != "tcp" {
            return Err(invalid("backend", "the only supported backend is tcp"));
        }

        if self.sync_timeout_secs == Some(0) {
            return Err(invalid("sync_timeout_secs", "must be greater than zero"));
        }

        Ok(())
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigErr {
    ConfigErr::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Builds a `TrainConfig` from defaults, an optional JSON file and `--key=value` overrides.
///
/// Every key must already exist in the defaults and every value must deserialize into its
/// field, so a typo fails at startup instead of silently being ignored.
pub struct ConfigLoader {
    values: Map<String, Value>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader holding the default configuration.
    pub fn new() -> Self {
        let values = match serde_json::to_value(TrainConfig::default()) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Self { values }
    }

    /// Applies command line arguments in order.
    ///
    /// # Arguments
    /// * `args` - Arguments without the program name. A bare argument is a JSON config file,
    ///   `--key=value` overrides one key.
    ///
    /// # Returns
    /// The loader, for chaining into `build`.
    pub fn with_args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref();
            match arg.strip_prefix("--") {
                Some(pair) => {
                    let (key, raw) = pair.split_once('=').ok_or_else(|| {
                        invalid(pair, "overrides must have the form --key=value")
                    })?;
                    self.set(key, raw)?;
                }
                None => self.merge_file(arg)?,
            }
        }

        Ok(self)
    }

    /// Merges every key of the JSON object stored at `path`.
    pub fn merge_file(&mut self, path: &str) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| invalid(path, format!("not valid json: {e}")))?;

        let Value::Object(map) = parsed else {
            return Err(invalid(path, "a config file must hold a json object").into());
        };

        for (key, value) in map {
            self.insert(&key, value)?;
        }

        Ok(())
    }

    /// Overrides one key with a raw command line value.
    ///
    /// The value is read as a json literal; anything that doesn't parse, or that would put a
    /// non-string into a string field, is taken verbatim as a string.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let current_is_string = matches!(self.values.get(key), Some(Value::String(_)));
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(Value::String(s)) => Value::String(s),
            Ok(_) if current_is_string => Value::String(raw.to_string()),
            Ok(parsed) => parsed,
            Err(_) => Value::String(raw.to_string()),
        };

        self.insert(key, value)
    }

    fn insert(&mut self, key: &str, value: Value) -> Result<()> {
        if !self.values.contains_key(key) {
            return Err(ConfigErr::UnknownKey(key.to_string()).into());
        }

        log::debug!("overriding config key {key} with {value}");
        let previous = self.values.insert(key.to_string(), value);

        if let Err(e) = self.deserialize() {
            if let Some(previous) = previous {
                self.values.insert(key.to_string(), previous);
            }
            return Err(invalid(key, e.to_string()).into());
        }

        Ok(())
    }

    fn deserialize(&self) -> serde_json::Result<TrainConfig> {
        serde_json::from_value(Value::Object(self.values.clone()))
    }

    /// Produces the validated configuration.
    pub fn build(self) -> Result<TrainConfig> {
        let config = self
            .deserialize()
            .map_err(|e| invalid("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
