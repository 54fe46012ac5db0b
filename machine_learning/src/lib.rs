pub mod arch;
pub mod batch;
pub mod error;
pub mod optimization;
pub mod snapshot;

pub use arch::{ForwardOutput, LanguageModel, ModelArgs, TokenMlp};
pub use batch::Batch;
pub use error::{MlErr, Result};
pub use optimization::{AdamW, Optimizer, ParamGroup};
pub use snapshot::{Snapshot, TensorBlob};
