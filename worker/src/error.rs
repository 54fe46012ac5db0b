use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// A configuration that can't be run. Always fatal.
#[derive(Debug)]
pub enum ConfigErr {
    UnknownKey(String),
    InvalidValue {
        key: String,
        reason: String,
    },
    HyperparameterMismatch {
        key: String,
        checkpoint: String,
        requested: String,
    },
    CorpusTooShort {
        split: &'static str,
        len: usize,
        required: usize,
    },
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErr::UnknownKey(key) => write!(f, "unknown configuration key: {key}"),
            ConfigErr::InvalidValue { key, reason } => {
                write!(f, "invalid value for {key}: {reason}")
            }
            ConfigErr::HyperparameterMismatch {
                key,
                checkpoint,
                requested,
            } => write!(
                f,
                "hyperparameter {key} mismatch: checkpoint has {checkpoint}, run requests {requested}"
            ),
            ConfigErr::CorpusTooShort {
                split,
                len,
                required,
            } => write!(
                f,
                "the {split} split holds {len} tokens, at least {required} are needed for one window"
            ),
        }
    }
}

impl Error for ConfigErr {}

/// Training runtime failures.
#[derive(Debug)]
pub enum TrainErr {
    Config(ConfigErr),
    Checkpoint { path: PathBuf, reason: String },
    Sync(String),
    Model(MlErr),
    Io(io::Error),
}

impl TrainErr {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Config(e) => write!(f, "configuration error: {e}"),
            TrainErr::Checkpoint { path, reason } => write!(
                f,
                "corrupt or missing checkpoint at {}: {reason}",
                path.display()
            ),
            TrainErr::Sync(detail) => write!(f, "gradient synchronization failed: {detail}"),
            TrainErr::Model(e) => write!(f, "model error: {e}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Config(e) => Some(e),
            TrainErr::Model(e) => Some(e),
            TrainErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigErr> for TrainErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Model(value)
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Lets the binary's `main` return `io::Result`.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
