#![allow(dead_code)]

use std::{fs, path::Path};

use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};

use comms::{OnoReceiver, OnoSender};
use worker::{
    MetricsSink, TrainConfig,
    metrics::{EvalRecord, StepRecord},
};

pub const VOCAB: u16 = 16;

pub type Channel = (
    OnoReceiver<ReadHalf<DuplexStream>>,
    OnoSender<WriteHalf<DuplexStream>>,
);

/// Writes a corpus where every token is followed by its successor modulo the vocabulary.
pub fn write_corpus(data_dir: &Path, dataset: &str) {
    let dir = data_dir.join(dataset);
    fs::create_dir_all(&dir).unwrap();

    for (file, len) in [("train.bin", 512), ("val.bin", 128)] {
        let bytes: Vec<u8> = (0..len)
            .flat_map(|i: u16| (i % VOCAB).to_le_bytes())
            .collect();
        fs::write(dir.join(file), bytes).unwrap();
    }
}

/// A small run over the corpus of `write_corpus`, rooted at `root`.
pub fn tiny_config(root: &Path) -> TrainConfig {
    write_corpus(&root.join("data"), "counting");

    TrainConfig {
        out_dir: root.join("out"),
        data_dir: root.join("data"),
        dataset: "counting".into(),
        eval_interval: 10,
        eval_iters: 4,
        batch_size: 2,
        block_size: 8,
        n_layer: 1,
        n_embd: 8,
        vocab_size: VOCAB as usize,
        dropout: 0.0,
        learning_rate: 1e-2,
        min_lr: 1e-3,
        warmup_iters: 2,
        lr_decay_iters: 50,
        max_iters: 21,
        ..TrainConfig::default()
    }
}

pub fn channel_pair() -> (Channel, Channel) {
    let (stream1, stream2) = io::duplex(4096);
    let (rx1, tx1) = io::split(stream1);
    let (rx2, tx2) = io::split(stream2);
    (comms::channel(rx1, tx1), comms::channel(rx2, tx2))
}

/// Keeps every record it's handed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub evals: Vec<EvalRecord>,
    pub steps: Vec<StepRecord>,
    pub checkpoints: Vec<u64>,
}

impl RecordingSink {
    pub fn is_empty(&self) -> bool {
        self.evals.is_empty() && self.steps.is_empty() && self.checkpoints.is_empty()
    }
}

impl MetricsSink for RecordingSink {
    fn on_eval(&mut self, record: &EvalRecord) {
        self.evals.push(record.clone());
    }

    fn on_step(&mut self, record: &StepRecord) {
        self.steps.push(record.clone());
    }

    fn on_checkpoint(&mut self, iteration: u64, _path: &Path) {
        self.checkpoints.push(iteration);
    }
}
