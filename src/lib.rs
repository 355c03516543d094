//! Word-conditioned audio GAN in pure Rust.
//!
//! A candle-based training harness for a recurrent conditional GAN that
//! learns to "say" a word as a variable-length sequence of magnitude
//! spectrogram frames.
//!
//! ## Architecture
//!
//! ```text
//! chars ─→ Embedder (BiLSTM) ──→ conditioning vector ─┐
//!                                                     ├→ Generator (LSTM stack, autoregressive)
//! noise ──────────────────────────────────────────────┘        │
//!                                                  frames + stop decisions
//!                                                              ↓
//! chars ─→ Embedder (BiLSTM) ──→ conditioning vector ─→ Discriminator (BiLSTM)
//!                                                              ↓
//!                                        per-frame logits + ranking score
//! ```
//!
//! The stop decision is a Bernoulli sample per step, trained with a
//! REINFORCE-style gradient; everything else is trained by backprop.
//!
//! ## Modules
//!
//! - [`model`]: LSTM cells, packed variable-length recurrence, embedder, generator, critic
//! - [`loss`]: numerically stable cross-entropy, ranking hinge, feature statistics
//! - [`train`]: RMSprop, gradient health, reward baseline, checkpoints, the orchestrator
//! - [`data`]: batch/word source interfaces and an in-memory dataset
//! - [`audio`]: STFT, Griffin-Lim phase reconstruction, WAV I/O
//! - [`telemetry`]: scalar/spectrogram/audio summary writers

pub mod audio;
pub mod config;
pub mod data;
pub mod loss;
pub mod model;
pub mod telemetry;
pub mod train;

mod error;

pub use error::{Error, Phase, Result};
