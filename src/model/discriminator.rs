//! Bidirectional recurrent critic.
//!
//! ```text
//! frames [N, T, F] ─→ BiLSTM(F, S/2, d_layers) ─┬→ per-step [T, N, S] ─→ classifier ─→ logits [N, T]
//!                                               └→ top-layer [fwd_h ‖ bwd_h] [N, S] ─→ encoder ─→ code [N, E]
//! ranking = ⟨code / ‖code‖, cond / ‖cond‖⟩ ∈ [-1, 1]
//! ```

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::FeedForward;
use super::lstm::BiLstm;
use super::sequence::{dynamic_sequence, length_mask};
use crate::config::TrainConfig;
use crate::{Error, Result};

/// Added to norms before dividing.
pub const NORM_EPS: f64 = 1e-4;

/// Critic scores for one batch.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// Per-frame real/fake logits `[N, T]`, zero at padded frames.
    pub logits: Tensor,
    /// Code/conditioning agreement `[N]`.
    pub ranking: Tensor,
    pub lengths: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Discriminator {
    rnn: BiLstm,
    classifier: FeedForward,
    encoder: FeedForward,
    frame_size: usize,
    embed_size: usize,
}

impl Discriminator {
    pub fn new(cfg: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let state = cfg.d_state_size;
        if state % 2 != 0 {
            return Err(Error::Config(format!(
                "d_state_size must be even, got {state}"
            )));
        }
        Ok(Self {
            rnn: BiLstm::new(cfg.frame_size, state / 2, cfg.d_layers, vb.pp("rnn"))?,
            classifier: FeedForward::new(state, state / 2, 1, vb.pp("classifier"))?,
            encoder: FeedForward::new(state, state, cfg.embed_size, vb.pp("encoder"))?,
            frame_size: cfg.frame_size,
            embed_size: cfg.embed_size,
        })
    }

    /// Score `frames` `[N, T, F]` with per-sample `lengths` against `cond` `[N, E]`.
    pub fn forward(
        &self,
        frames: &Tensor,
        lengths: &[usize],
        cond: &Tensor,
    ) -> Result<DiscriminatorOutput> {
        let (batch, steps, features) = frames.dims3()?;
        if features != self.frame_size {
            return Err(Error::Shape(format!(
                "discriminator: frame width {features}, expected {}",
                self.frame_size
            )));
        }
        let (cond_batch, cond_width) = cond.dims2()?;
        if cond_batch != batch || cond_width != self.embed_size {
            return Err(Error::Shape(format!(
                "discriminator: conditioning {:?} for batch {batch}, width {}",
                cond.dims(),
                self.embed_size
            )));
        }

        let time_major = frames.transpose(0, 1)?.contiguous()?;
        let seq = dynamic_sequence(&self.rnn, &time_major, lengths, None)?;

        // [T, N, S] -> [N, T, S] -> [N, T]
        let hidden = seq.output.transpose(0, 1)?.contiguous()?;
        let mask = length_mask((batch, steps), lengths, frames.device())?.to_dtype(frames.dtype())?;
        let logits = (self.classifier.forward(&hidden)?.squeeze(D::Minus1)? * mask)?;

        let code = self.encoder.forward(&seq.last_layer_hidden()?)?;
        let ranking = (unit_norm(&code)? * unit_norm(cond)?)?.sum(D::Minus1)?;

        Ok(DiscriminatorOutput {
            logits,
            ranking,
            lengths: lengths.to_vec(),
        })
    }
}

/// Row-wise `x / (‖x‖₂ + eps)`.
pub fn unit_norm(xs: &Tensor) -> Result<Tensor> {
    // Inner epsilon keeps the sqrt slope finite at the origin.
    let norm = (xs.sqr()?.sum_keepdim(D::Minus1)? + 1e-12)?.sqrt()?;
    Ok(xs.broadcast_div(&(norm + NORM_EPS)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> TrainConfig {
        TrainConfig {
            frame_size: 8,
            d_state_size: 10,
            d_layers: 2,
            embed_size: 6,
            ..Default::default()
        }
    }

    #[test]
    fn scores_have_expected_shapes_and_ranking_is_bounded() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let d = Discriminator::new(&cfg, vb).unwrap();

        let frames = Tensor::randn(0f32, 1.0, (4, 5, 8), &dev).unwrap();
        let cond = Tensor::randn(0f32, 10.0, (4, 6), &dev).unwrap();
        let out = d.forward(&frames, &[5, 3, 1, 4], &cond).unwrap();
        assert_eq!(out.logits.dims(), &[4, 5]);
        assert_eq!(out.ranking.dims(), &[4]);
        assert_eq!(out.lengths, vec![5, 3, 1, 4]);

        let ranking: Vec<f32> = out.ranking.to_vec1().unwrap();
        assert!(ranking.iter().all(|r| (-1.0..=1.0).contains(r)));
        let logits: Vec<Vec<f32>> = out.logits.to_vec2().unwrap();
        assert!(logits[2][1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn unit_norm_of_parallel_vectors_has_unit_dot() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[[3f32, 4.0], [-1.0, 0.0]], &dev).unwrap();
        let b = Tensor::new(&[[6f32, 8.0], [1.0, 0.0]], &dev).unwrap();
        let dot: Vec<f32> = (unit_norm(&a).unwrap() * unit_norm(&b).unwrap())
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((dot[0] - 1.0).abs() < 1e-3);
        assert!((dot[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_mismatched_conditioning() {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let d = Discriminator::new(&cfg, vb).unwrap();
        let frames = Tensor::zeros((2, 3, 8), DType::F32, &dev).unwrap();
        let cond = Tensor::zeros((3, 6), DType::F32, &dev).unwrap();
        assert!(matches!(
            d.forward(&frames, &[3, 2], &cond),
            Err(Error::Shape(_))
        ));
    }
}
