pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod eval;
pub mod loop_;
pub mod metrics;
pub mod schedule;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{ConfigLoader, InitFrom, TrainConfig};
pub use error::{ConfigErr, Result, TrainErr};
pub use loop_::{LoopParts, LoopState, TrainingLoop, TrainingState};
pub use metrics::{LogSink, MetricsSink, TrainMetrics};
