mod sampler;
mod tokens;

pub use sampler::{CorpusSampler, Split};
pub use tokens::TokenArray;
