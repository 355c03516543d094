//! Autoregressive frame generator with a learned stochastic stopper.
//!
//! ```text
//! step t:  [prev_frame ‖ z_t ‖ cond] ─→ LSTM stack ─→ h_t
//!          h_t ─→ proj ─→ tanh(· + frame_bias) / frame_scale ─→ frame_t
//!          h_t ─→ stopper ─→ · + stop_bias ─→ stop logit ─→ Bernoulli draw
//! ```
//!
//! Each sample runs a two-state machine (generating → stopped). The batch is
//! computed densely every step; a host-side `active` vector zeroes the outputs
//! of stopped samples and decides which samples count towards their length.
//! A stop draw only takes effect from step `min_steps_before_stop` on, and the
//! loop ends early once every sample has stopped.

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;
use rand::Rng;

use super::layers::FeedForward;
use super::lstm::LstmStack;
use super::sampling::{categorical, gaussian};
use crate::config::TrainConfig;
use crate::loss::{log_one_minus_sigmoid, log_sigmoid};
use crate::{Error, Result};

/// Output of one generation call. `T` is the number of steps actually run.
#[derive(Debug, Clone)]
pub struct GeneratorOutput {
    /// `[N, T, F]`, zero past each sample's length.
    pub frames: Tensor,
    /// `[N, T]`, zero past each sample's length.
    pub stop_logits: Tensor,
    /// `[N, T, 2]` probabilities of (continue, stop).
    pub stop_probs: Tensor,
    /// Realised stop draws, indexed `[t][sample]`.
    pub stops: Vec<Vec<bool>>,
    /// Valid frames per sample, in `1..=T`.
    pub lengths: Vec<usize>,
}

impl GeneratorOutput {
    pub fn steps(&self) -> usize {
        self.stops.len()
    }

    pub fn max_length(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Generator {
    rnn: LstmStack,
    proj: FeedForward,
    stopper: FeedForward,
    frame_size: usize,
    noise_size: usize,
    embed_size: usize,
    frame_bias: f64,
    frame_scale: f64,
    stop_bias: f64,
    min_steps_before_stop: usize,
}

impl Generator {
    pub fn new(cfg: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let state = cfg.g_state_size;
        let input = cfg.frame_size + cfg.noise_size + cfg.embed_size;
        Ok(Self {
            rnn: LstmStack::new(input, state, cfg.g_layers, vb.pp("rnn"))?,
            proj: FeedForward::new(state, state, cfg.frame_size, vb.pp("proj"))?,
            stopper: FeedForward::new(state, (state / 2).max(1), 1, vb.pp("stopper"))?,
            frame_size: cfg.frame_size,
            noise_size: cfg.noise_size,
            embed_size: cfg.embed_size,
            frame_bias: cfg.frame_bias,
            frame_scale: cfg.frame_scale,
            stop_bias: cfg.stop_bias,
            min_steps_before_stop: cfg.min_steps_before_stop,
        })
    }

    /// Draw a noise tensor `[N, max_steps, noise_size]` for [`Self::forward`].
    pub fn sample_noise<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        batch: usize,
        max_steps: usize,
        like: &Tensor,
    ) -> Result<Tensor> {
        gaussian(rng, (batch, max_steps, self.noise_size), 1.0, like.device())
    }

    /// Generate up to `max_steps` frames for each conditioning row `[N, E]`.
    ///
    /// `noise` is `[N, >= max_steps, noise_size]`; drawn from `rng` when absent.
    /// `rng` also drives the stop draws.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        cond: &Tensor,
        noise: Option<&Tensor>,
        max_steps: usize,
        rng: &mut R,
    ) -> Result<GeneratorOutput> {
        let (batch, embed) = cond.dims2()?;
        if embed != self.embed_size {
            return Err(Error::Shape(format!(
                "generator: conditioning width {embed}, expected {}",
                self.embed_size
            )));
        }
        if max_steps == 0 {
            return Err(Error::Shape("generator: max_steps must be positive".into()));
        }
        let noise = match noise {
            Some(z) => {
                let (zb, zt, zf) = z.dims3()?;
                if zb != batch || zt < max_steps || zf != self.noise_size {
                    return Err(Error::Shape(format!(
                        "generator: noise {:?} for batch {batch}, {max_steps} steps, {} features",
                        z.dims(),
                        self.noise_size
                    )));
                }
                z.clone()
            }
            None => self.sample_noise(rng, batch, max_steps, cond)?,
        };

        let device = cond.device();
        let mut prev = Tensor::zeros((batch, self.frame_size), cond.dtype(), device)?;
        let mut states = self.rnn.zero_state(batch)?;
        let mut active = vec![true; batch];
        let mut lengths = vec![0usize; batch];

        let mut frames = Vec::with_capacity(max_steps);
        let mut logits = Vec::with_capacity(max_steps);
        let mut probs = Vec::with_capacity(max_steps);
        let mut stops = Vec::with_capacity(max_steps);

        for t in 0..max_steps {
            let alive: Vec<f32> = active.iter().map(|&a| if a { 1.0 } else { 0.0 }).collect();
            let alive = Tensor::from_vec(alive, (batch, 1), device)?.to_dtype(cond.dtype())?;

            let z_t = noise.narrow(1, t, 1)?.squeeze(1)?;
            let x = Tensor::cat(&[&prev, &z_t, cond], D::Minus1)?;
            let h = self.rnn.step(&x, &mut states)?;

            let raw = self.proj.forward(&h)?;
            let frame = (((raw + self.frame_bias)?.tanh()? / self.frame_scale)?)
                .broadcast_mul(&alive)?;
            let logit = (self.stopper.forward(&h)? + self.stop_bias)?;

            let log_p = Tensor::cat(&[log_one_minus_sigmoid(&logit)?, log_sigmoid(&logit)?], 1)?;
            let p = log_p.exp()?;
            let draws = categorical(rng, &p.to_dtype(candle_core::DType::F32)?.to_vec2()?);
            let stop_t: Vec<bool> = draws.iter().map(|&d| d == 1).collect();

            for i in 0..batch {
                if active[i] {
                    lengths[i] += 1;
                    if t >= self.min_steps_before_stop && stop_t[i] {
                        active[i] = false;
                    }
                }
            }

            frames.push(frame.clone());
            logits.push(logit.broadcast_mul(&alive)?.squeeze(1)?);
            probs.push(p);
            stops.push(stop_t);
            prev = frame;

            if !active.iter().any(|&a| a) {
                break;
            }
        }

        Ok(GeneratorOutput {
            frames: Tensor::stack(&frames, 1)?,
            stop_logits: Tensor::stack(&logits, 1)?,
            stop_probs: Tensor::stack(&probs, 1)?,
            stops,
            lengths,
        })
    }
}
