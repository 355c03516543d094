//! Character-level text embedder.
//!
//! ```text
//! chars [N, L] ─→ Embedding(num_chars, char_embed) ─→ [L, N, C]
//!               ─→ BiLSTM(C, E/2, e_layers) ─→ [fwd_h ‖ bwd_h] of top layer ─→ [N, E]
//! ```
//!
//! The generator and the critic each own an independently parameterised
//! instance.

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::lstm::BiLstm;
use super::sequence::dynamic_sequence;
use crate::config::TrainConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Embedder {
    chars: Embedding,
    rnn: BiLstm,
    output_size: usize,
}

impl Embedder {
    pub fn new(cfg: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        Self::with_sizes(
            cfg.num_chars,
            cfg.char_embed_size,
            cfg.embed_size,
            cfg.e_layers,
            vb,
        )
    }

    pub fn with_sizes(
        num_chars: usize,
        char_embed_size: usize,
        output_size: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if output_size % 2 != 0 {
            return Err(Error::Config(format!(
                "embedder output size must be even, got {output_size}"
            )));
        }
        let chars = candle_nn::embedding(num_chars, char_embed_size, vb.pp("chars"))?;
        let rnn = BiLstm::new(char_embed_size, output_size / 2, num_layers, vb.pp("rnn"))?;
        Ok(Self {
            chars,
            rnn,
            output_size,
        })
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Embed a padded batch of character ids `[N, L]` (u32) with per-row lengths.
    pub fn forward(&self, chars: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let (_batch, max_chars) = chars.dims2()?;
        if lengths.iter().any(|&l| l == 0 || l > max_chars) {
            return Err(Error::Shape(format!(
                "embedder: lengths {lengths:?} must lie in 1..={max_chars}"
            )));
        }
        let embedded = self.chars.forward(chars)?;
        let time_major = embedded.transpose(0, 1)?.contiguous()?;
        let out = dynamic_sequence(&self.rnn, &time_major, lengths, None)?;
        out.last_layer_hidden()
    }
}
