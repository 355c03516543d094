//! Model components.
//!
//! ## Components
//!
//! - [`lstm`]: unidirectional and bidirectional stacks of candle LSTM cells
//! - [`sequence`]: length masks and packed variable-length recurrence
//! - [`layers`]: feed-forward heads and initialisers
//! - [`sampling`]: seeded Gaussian noise and Bernoulli stop draws
//! - [`embedder`]: character sequence → conditioning vector
//! - [`generator`]: autoregressive frame generator with a learned stopper
//! - [`discriminator`]: per-frame critic with an embedding-ranking head

pub mod discriminator;
pub mod embedder;
pub mod generator;
pub mod layers;
pub mod lstm;
pub mod sampling;
pub mod sequence;
