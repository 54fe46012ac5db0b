pub mod layout;
pub mod loss;
mod model;
mod token_mlp;

pub use model::{ForwardOutput, LanguageModel, ModelArgs};
pub use token_mlp::TokenMlp;
