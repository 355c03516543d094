//! Adversarial training.
//!
//! ## Components
//!
//! - [`optim`]: RMSprop on candle `Var`s
//! - [`grad`]: gradient health checks, global-norm clipping, store accumulation
//! - [`baseline`]: moving-average reward baseline for the stop policy
//! - [`checkpoint`]: four-blob safetensors checkpoints
//! - [`trainer`]: the orchestrator alternating critic and generator phases

pub mod baseline;
pub mod checkpoint;
pub mod grad;
pub mod optim;
pub mod trainer;

pub use trainer::{DiscriminatorStats, GeneratorStats, RunState, Trainer};
