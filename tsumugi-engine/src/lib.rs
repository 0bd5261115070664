pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod model;
pub mod numa;
pub mod rng;
pub mod sampler;
pub mod tokenizer;
pub mod weights;

pub use config::{ChatTemplates, ModelFamily, RunConfig, RunMode, apply_template};
pub use engine::Engine;
pub use error::{Result, RtError};
pub use kernels::{Kernels, SimdLevel, WType};
pub use model::{CTok, TConf, Transformer};
pub use sampler::ProbIndex;
pub use tokenizer::Tokenizer;
