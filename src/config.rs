//! Training configuration.
//!
//! Defaults describe the full-size word model: a 2-layer
//! generator LSTM with 1024 units, a 2-layer bidirectional critic with 256
//! units, RMSprop at 1e-4 on both sides and 1025-bin magnitude frames.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Target the generator's adversarial term pushes the critic towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorObjective {
    /// Drive the critic to maximal uncertainty (target 0.5).
    BoundarySeeking,
    /// Plain cross-entropy against target 0.
    Plain,
}

impl GeneratorObjective {
    /// Per-frame target used in the generator's cross-entropy.
    pub fn target(&self) -> f64 {
        match self {
            GeneratorObjective::BoundarySeeking => 0.5,
            GeneratorObjective::Plain => 0.0,
        }
    }
}

/// Which sides of the game are trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Both,
    GeneratorOnly,
    DiscriminatorOnly,
}

impl RunMode {
    pub fn trains_generator(&self) -> bool {
        !matches!(self, RunMode::DiscriminatorOnly)
    }

    pub fn trains_discriminator(&self) -> bool {
        !matches!(self, RunMode::GeneratorOnly)
    }
}

/// Generator loss composition.
///
/// `Ranking` adds ranking and feature-matching terms to the adversarial
/// cross-entropy; `Plain` trains on the cross-entropy alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossProfile {
    /// Adversarial + ranking + feature matching + policy gradient.
    Ranking,
    /// Adversarial + policy gradient only.
    Plain,
}

/// Full configuration for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    // --- Schedule ---
    pub critic_iter: usize,
    pub gen_catchup: usize,
    pub pretrain_d: usize,
    pub require_acc: f32,
    pub run_mode: RunMode,
    pub profile: LossProfile,

    // --- Model sizes ---
    /// Magnitude bins per frame (nfreq).
    pub frame_size: usize,
    pub noise_size: usize,
    pub g_state_size: usize,
    pub d_state_size: usize,
    pub g_layers: usize,
    pub d_layers: usize,
    pub e_layers: usize,
    pub embed_size: usize,
    pub char_embed_size: usize,
    pub num_chars: usize,
    /// Generation ceiling in frames.
    pub max_len: usize,
    pub batch_size: usize,

    // --- Generator output stabilizers ---
    pub frame_bias: f64,
    pub frame_scale: f64,
    pub stop_bias: f64,
    /// Steps that must be emitted before a stop draw can freeze a sample.
    pub min_steps_before_stop: usize,

    // --- Optimisation ---
    pub g_lr: f64,
    pub d_lr: f64,
    /// Global gradient-norm ceiling; 0 disables clipping.
    pub g_grad_clip: f64,
    pub d_grad_clip: f64,
    pub grad_value_limit: f32,
    pub max_consecutive_grad_failures: usize,

    // --- Losses ---
    pub g_objective: GeneratorObjective,
    /// One-sided label smoothing target for real data.
    pub real_target: f64,
    pub noise_scale: f64,
    pub lambda_pg: f64,
    pub lambda_rank: f64,
    pub lambda_fp: f64,
    pub rank_scale: f64,
    pub length_penalty_scale: f64,

    // --- Reward baseline ---
    pub baseline_warmup: usize,
    pub baseline_fast_decay: f32,
    pub baseline_slow_decay: f32,

    // --- Side effects ---
    pub sample_every: usize,
    pub checkpoint_every: usize,
    pub sample_rate: u32,
    pub griffin_lim_iters: usize,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub model_name_save: String,
    pub model_name_load: Option<String>,
    pub load_iterations: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            critic_iter: 10,
            gen_catchup: 1,
            pretrain_d: 0,
            require_acc: 0.5,
            run_mode: RunMode::Both,
            profile: LossProfile::Ranking,
            frame_size: 1025,
            noise_size: 100,
            g_state_size: 1024,
            d_state_size: 256,
            g_layers: 2,
            d_layers: 2,
            e_layers: 1,
            embed_size: 100,
            char_embed_size: 128,
            num_chars: 256,
            max_len: 30,
            batch_size: 32,
            frame_bias: -2.0,
            frame_scale: 1.9,
            stop_bias: -2.0,
            min_steps_before_stop: 2,
            g_lr: 1e-4,
            d_lr: 1e-4,
            g_grad_clip: 1.0,
            d_grad_clip: 1.0,
            grad_value_limit: 1e5,
            max_consecutive_grad_failures: 2,
            g_objective: GeneratorObjective::BoundarySeeking,
            real_target: 0.9,
            noise_scale: 0.01,
            lambda_pg: 0.1,
            lambda_rank: 10.0,
            lambda_fp: 10.0,
            rank_scale: 0.1,
            length_penalty_scale: 1.0 / 3.0,
            baseline_warmup: 100,
            baseline_fast_decay: 0.5,
            baseline_slow_decay: 0.8,
            sample_every: 20,
            checkpoint_every: 200,
            sample_rate: 8000,
            griffin_lim_iters: 100,
            log_dir: PathBuf::from("."),
            checkpoint_dir: PathBuf::from("."),
            model_name_save: "audiogan".to_string(),
            model_name_load: None,
            load_iterations: 0,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the models cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("batch_size", self.batch_size),
            ("frame_size", self.frame_size),
            ("noise_size", self.noise_size),
            ("g_state_size", self.g_state_size),
            ("d_state_size", self.d_state_size),
            ("g_layers", self.g_layers),
            ("d_layers", self.d_layers),
            ("e_layers", self.e_layers),
            ("embed_size", self.embed_size),
            ("char_embed_size", self.char_embed_size),
            ("num_chars", self.num_chars),
            ("max_len", self.max_len),
            ("critic_iter", self.critic_iter),
            ("gen_catchup", self.gen_catchup),
            ("max_consecutive_grad_failures", self.max_consecutive_grad_failures),
            ("sample_every", self.sample_every),
            ("checkpoint_every", self.checkpoint_every),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        // Bidirectional encoders split these sizes into two directions.
        if self.embed_size % 2 != 0 {
            return Err(Error::Config(format!(
                "embed_size must be even, got {}",
                self.embed_size
            )));
        }
        if self.d_state_size % 2 != 0 {
            return Err(Error::Config(format!(
                "d_state_size must be even, got {}",
                self.d_state_size
            )));
        }
        if self.frame_size < 2 {
            return Err(Error::Config("frame_size must be at least 2".into()));
        }
        if self.frame_scale == 0.0 {
            return Err(Error::Config("frame_scale must be non-zero".into()));
        }
        if self.g_grad_clip < 0.0 || self.d_grad_clip < 0.0 {
            return Err(Error::Config("gradient clip ceilings must be >= 0".into()));
        }
        if self.checkpoint_every % self.sample_every != 0 {
            return Err(Error::Config(format!(
                "checkpoint_every ({}) must be a multiple of sample_every ({})",
                self.checkpoint_every, self.sample_every
            )));
        }
        Ok(())
    }
}
