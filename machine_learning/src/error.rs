use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    MissingTensor(String),
    TokenOutOfRange {
        token: u32,
        vocab_size: usize,
    },
    ContextTooLong {
        got: usize,
        max: usize,
    },
    InvalidArgs(String),
    NoForwardCache,
    Format(String),
    Io(io::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch in {what}: got {got}, expected {expected}"),
            MlErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "tensor {name} has shape {got:?}, expected {expected:?}"
            ),
            MlErr::MissingTensor(name) => write!(f, "tensor {name} is missing from the snapshot"),
            MlErr::TokenOutOfRange { token, vocab_size } => {
                write!(f, "token {token} is outside the vocabulary of size {vocab_size}")
            }
            MlErr::ContextTooLong { got, max } => {
                write!(f, "sequence length {got} exceeds the model's block size {max}")
            }
            MlErr::InvalidArgs(msg) => write!(f, "invalid model arguments: {msg}"),
            MlErr::NoForwardCache => {
                f.write_str("backward called without a preceding forward pass in train mode")
            }
            MlErr::Format(msg) => write!(f, "malformed tensor file: {msg}"),
            MlErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ndarray::ShapeError> for MlErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Format(value.to_string())
    }
}

impl From<safetensors::SafeTensorError> for MlErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::Format(value.to_string())
    }
}

impl From<serde_json::Error> for MlErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Format(value.to_string())
    }
}
