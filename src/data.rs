//! Training data interfaces.
//!
//! The trainer pulls real batches and conditioning words through two traits;
//! [`memory::InMemoryDataset`] implements both over utterances held in RAM.
//! Calls block until data is available; there is no timeout or cancellation.

pub mod batch;
pub mod memory;

pub use batch::{CharBatch, RealBatch};
pub use memory::{InMemoryDataset, Utterance};

use crate::Result;

/// Source of real, padded training batches.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<RealBatch>;

    /// A fixed batch for reference summaries. Must not advance or reshuffle
    /// the training stream.
    fn reference_batch(&mut self) -> Result<RealBatch>;
}

/// Source of conditioning words drawn from the training vocabulary.
pub trait WordSource {
    fn pick_words(&mut self, n: usize) -> Result<CharBatch>;
}
