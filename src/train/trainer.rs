//! Training orchestrator.
//!
//! One outer iteration alternates the two players:
//!
//! ```text
//! critic phase     ×critic_iter (early exit once acc_d and acc_g > require_acc)
//!   real, real2 ← data          fake ← G(E_g(words2))  (detached)
//!   loss = CE(D(real, E_d(words)), 0.9) + CE(D(fake, E_d(words2)), 0)
//!        + rank_scale · hinge(D(real, own), D(real, words2), D(real2, own))
//!
//! generator phase  ×gen_catchup
//!   fake ← G(E_g(words))        scored ← D(fake, E_d(words))   D frozen
//!   grads = ∇ CE(scored, target)  +  λ_rank ∇(-rank_scale · ranking)
//!         + λ_fp ∇ feature-match  +  REINFORCE(stop draws, reward - baseline)
//! ```
//!
//! Each generator term is back-propagated into its own gradient store so its
//! norm can be reported before the stores are summed. Steps whose gradients
//! are non-finite or oversized are skipped; a second consecutive failure in a
//! phase aborts the run.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info};

use super::baseline::RewardBaseline;
use super::checkpoint::{CheckpointStore, ModelStores};
use super::grad::{GradientHealth, HealthTracker, accumulate, clip_global_norm, global_norm};
use super::optim::{ParamsRmsProp, RmsProp};
use crate::audio::frames_to_waveform;
use crate::config::{LossProfile, TrainConfig};
use crate::data::{BatchSource, CharBatch, RealBatch, WordSource};
use crate::loss::{
    binary_cross_entropy_with_logits_per_sample, length_moments, length_penalty, masked_accuracy,
    masked_moments, ranking_hinge,
};
use crate::model::discriminator::{Discriminator, DiscriminatorOutput};
use crate::model::embedder::Embedder;
use crate::model::generator::{Generator, GeneratorOutput};
use crate::model::sampling::gaussian;
use crate::model::sequence::length_mask;
use crate::telemetry::SummaryWriter;
use crate::{Phase, Result};

/// Statistics of the most recent real batch, matched by the generator.
#[derive(Debug, Clone)]
pub struct RealReference {
    pub mean: f32,
    pub std: f32,
    pub lengths: Vec<usize>,
}

/// Mutable run state owned by the trainer.
#[derive(Debug, Clone)]
pub struct RunState {
    pub iteration: usize,
    pub gen_iter: usize,
    pub dis_iter: usize,
    pub epoch: usize,
    pub baseline: RewardBaseline,
    pub d_health: HealthTracker,
    pub g_health: HealthTracker,
    pub real_reference: Option<RealReference>,
}

impl RunState {
    pub fn new(cfg: &TrainConfig) -> Self {
        Self {
            iteration: 0,
            gen_iter: 0,
            dis_iter: 0,
            epoch: 1,
            baseline: RewardBaseline::new(
                cfg.baseline_warmup,
                cfg.baseline_fast_decay,
                cfg.baseline_slow_decay,
            ),
            d_health: HealthTracker::new(Phase::Discriminator, cfg.max_consecutive_grad_failures),
            g_health: HealthTracker::new(Phase::Generator, cfg.max_consecutive_grad_failures),
            real_reference: None,
        }
    }
}

/// Result of one critic step.
#[derive(Debug, Clone, Default)]
pub struct DiscriminatorStats {
    pub loss: f32,
    pub loss_real: f32,
    pub loss_fake: f32,
    pub loss_rank: f32,
    pub acc_real: f32,
    pub acc_fake: f32,
    /// Norm before clipping; `None` when the step was skipped.
    pub grad_norm: Option<f32>,
    pub fake_lengths: Vec<usize>,
}

impl DiscriminatorStats {
    pub fn skipped(&self) -> bool {
        self.grad_norm.is_none()
    }
}

/// Result of one generator step.
#[derive(Debug, Clone, Default)]
pub struct GeneratorStats {
    /// Batch mean of the per-sample loss the reward is derived from.
    pub loss: f32,
    pub loss_adv: f32,
    pub rank_mean: f32,
    pub loss_fp_data: f32,
    pub loss_fp_len: f32,
    pub reward_mean: f32,
    pub reward_std: f32,
    pub baseline: f32,
    pub adv_grad_norm: f32,
    pub rank_grad_norm: f32,
    pub fp_grad_norm: f32,
    pub pg_grad_norm: f32,
    /// Combined norm before clipping; `None` when the step was skipped.
    pub grad_norm: Option<f32>,
    pub lengths: Vec<usize>,
}

impl GeneratorStats {
    pub fn skipped(&self) -> bool {
        self.grad_norm.is_none()
    }
}

/// Noise and words decoded every `sample_every` generator iterations.
struct FixedSample {
    noise: Tensor,
    words: CharBatch,
    chars: Tensor,
}

pub struct Trainer<S, W> {
    cfg: TrainConfig,
    device: Device,
    generator: Generator,
    discriminator: Discriminator,
    embed_g: Embedder,
    embed_d: Embedder,
    gen_vars: VarMap,
    dis_vars: VarMap,
    eg_vars: VarMap,
    ed_vars: VarMap,
    g_params: Vec<Var>,
    d_params: Vec<Var>,
    opt_g: RmsProp,
    opt_d: RmsProp,
    data: S,
    writer: W,
    checkpoints: CheckpointStore,
    rng: ChaCha8Rng,
    fixed: FixedSample,
    state: RunState,
}

impl<S, W> Trainer<S, W>
where
    S: BatchSource + WordSource,
    W: SummaryWriter,
{
    /// Build all four modules, both optimizers and the fixed sample batch.
    /// Resumes from `model_name_load` at `load_iterations` when set.
    pub fn new(cfg: TrainConfig, mut data: S, writer: W, device: Device) -> Result<Self> {
        cfg.validate()?;
        let gen_vars = VarMap::new();
        let dis_vars = VarMap::new();
        let eg_vars = VarMap::new();
        let ed_vars = VarMap::new();

        let vb = |vars: &VarMap| VarBuilder::from_varmap(vars, DType::F32, &device);
        let generator = Generator::new(&cfg, vb(&gen_vars))?;
        let discriminator = Discriminator::new(&cfg, vb(&dis_vars))?;
        let embed_g = Embedder::new(&cfg, vb(&eg_vars))?;
        let embed_d = Embedder::new(&cfg, vb(&ed_vars))?;

        let mut g_params = gen_vars.all_vars();
        g_params.extend(eg_vars.all_vars());
        let mut d_params = dis_vars.all_vars();
        d_params.extend(ed_vars.all_vars());

        let opt_g = RmsProp::new(
            g_params.clone(),
            ParamsRmsProp {
                lr: cfg.g_lr,
                ..Default::default()
            },
        )?;
        let opt_d = RmsProp::new(
            d_params.clone(),
            ParamsRmsProp {
                lr: cfg.d_lr,
                ..Default::default()
            },
        )?;

        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let noise = gaussian(
            &mut rng,
            (cfg.batch_size, cfg.max_len, cfg.noise_size),
            1.0,
            &device,
        )?;
        let words = data.pick_words(cfg.batch_size)?;
        let chars = words.to_tensor(&device)?;

        info!(
            g_params = count_params(&g_params),
            d_params = count_params(&d_params),
            batch_size = cfg.batch_size,
            max_len = cfg.max_len,
            "models built"
        );

        let mut trainer = Self {
            checkpoints: CheckpointStore::new(cfg.checkpoint_dir.clone()),
            state: RunState::new(&cfg),
            cfg,
            device,
            generator,
            discriminator,
            embed_g,
            embed_d,
            gen_vars,
            dis_vars,
            eg_vars,
            ed_vars,
            g_params,
            d_params,
            opt_g,
            opt_d,
            data,
            writer,
            rng,
            fixed: FixedSample {
                noise,
                words,
                chars,
            },
        };
        if let Some(run) = trainer.cfg.model_name_load.clone() {
            trainer.load_checkpoint(&run, trainer.cfg.load_iterations)?;
        }
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainConfig {
        &self.cfg
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    // -----------------------------------------------------------------------
    // Critic
    // -----------------------------------------------------------------------

    /// One critic update on two fresh real batches and one fake batch.
    pub fn discriminator_step(&mut self) -> Result<DiscriminatorStats> {
        self.state.dis_iter += 1;
        let real = self.data.next_batch()?;
        let real2 = self.data.next_batch()?;
        self.state.epoch = real2.epoch;

        let real_frames = self.add_noise(&real.frames)?;
        let real2_frames = self.add_noise(&real2.frames)?;
        let chars = real.chars.to_tensor(&self.device)?;
        let chars2 = real2.chars.to_tensor(&self.device)?;

        let embed_d = self.embed_d.forward(&chars, &real.chars.lengths)?;
        let embed_g2 = self.embed_g.forward(&chars2, &real2.chars.lengths)?;
        let embed_d2 = self.embed_d.forward(&chars2, &real2.chars.lengths)?;

        let own = self.discriminator.forward(&real_frames, &real.lengths, &embed_d)?;
        let mismatched = self.discriminator.forward(&real_frames, &real.lengths, &embed_d2)?;
        let mismatched2 = self.discriminator.forward(&real2_frames, &real2.lengths, &embed_d)?;

        let (fake_frames, fake_lengths) = self.detached_fake(&embed_g2)?;
        let fake_frames = self.add_noise(&fake_frames)?;
        let scored_fake = self.discriminator.forward(&fake_frames, &fake_lengths, &embed_d2)?;

        let (loss_real, acc_real) = self.classification(&own, self.cfg.real_target, true)?;
        let (loss_fake, acc_fake) = self.classification(&scored_fake, 0.0, false)?;
        let loss_real = loss_real.mean_all()?;
        let loss_fake = loss_fake.mean_all()?;
        let loss_rank = ranking_hinge(&own.ranking, &mismatched.ranking, &mismatched2.ranking)?;
        let loss = match self.cfg.profile {
            LossProfile::Ranking => ((&loss_real + &loss_fake)? + (&loss_rank * self.cfg.rank_scale)?)?,
            LossProfile::Plain => (&loss_real + &loss_fake)?,
        };

        let mut stats = DiscriminatorStats {
            loss: loss.to_scalar()?,
            loss_real: loss_real.to_scalar()?,
            loss_fake: loss_fake.to_scalar()?,
            loss_rank: loss_rank.to_scalar()?,
            acc_real,
            acc_fake,
            grad_norm: None,
            fake_lengths: fake_lengths.clone(),
        };

        let mut grads = loss.backward()?;
        let health = GradientHealth::check(&self.d_params, &grads, self.cfg.grad_value_limit)?;
        if !health.is_healthy() {
            self.state.d_health.record_failure(health)?;
            return Ok(stats);
        }
        self.state.d_health.record_success();
        let norm = clip_global_norm(&self.d_params, &mut grads, self.cfg.d_grad_clip)?;
        self.opt_d.step(&grads)?;
        stats.grad_norm = Some(norm);

        let (mean, std) = masked_moments(&real_frames, &self.mask(&real_frames, &real.lengths)?)?;
        self.state.real_reference = Some(RealReference {
            mean: mean.to_scalar()?,
            std: std.to_scalar()?,
            lengths: real.lengths.clone(),
        });

        let step = self.state.dis_iter;
        for (tag, value) in [
            ("loss_d", stats.loss_real),
            ("loss_g", stats.loss_fake),
            ("loss_rank", stats.loss_rank),
            ("loss", stats.loss),
            ("acc_d", stats.acc_real),
            ("acc_g", stats.acc_fake),
            ("d_grad_norm", norm),
            ("rank_d/mean", host_mean(&own.ranking)?),
            ("rank_d_x/mean", host_mean(&mismatched.ranking)?),
            ("rank_d_x2/mean", host_mean(&mismatched2.ranking)?),
        ] {
            self.writer.add_scalar(tag, value, step)?;
        }
        if step % 10 == 0 {
            let (fake_mean, fake_std) = length_moments(&fake_lengths);
            let (real_mean, real_std) = length_moments(&real.lengths);
            info!(
                epoch = real.epoch,
                batch = real.batch_id,
                loss = stats.loss,
                acc_d = stats.acc_real,
                acc_g = stats.acc_fake,
                "D"
            );
            debug!(fake_mean, fake_std, real_mean, real_std, "lengths");
        }
        Ok(stats)
    }

    /// Generator rollout for the critic. Conditioning and output are detached
    /// and the rollout graph is dropped here, so the critic backward pass
    /// never reaches generator or embedder parameters.
    fn detached_fake(&mut self, embed: &Tensor) -> Result<(Tensor, Vec<usize>)> {
        let GeneratorOutput { frames, lengths, .. } =
            self.generator
                .forward(&embed.detach(), None, self.cfg.max_len, &mut self.rng)?;
        Ok((frames.detach(), lengths))
    }

    /// Up to `critic_iter` critic steps, stopping early once both accuracies
    /// exceed `require_acc`.
    pub fn discriminator_phase(&mut self) -> Result<Vec<DiscriminatorStats>> {
        let mut all = Vec::with_capacity(self.cfg.critic_iter);
        for _ in 0..self.cfg.critic_iter {
            let stats = self.discriminator_step()?;
            let done = !stats.skipped()
                && stats.acc_real > self.cfg.require_acc
                && stats.acc_fake > self.cfg.require_acc;
            all.push(stats);
            if done {
                break;
            }
        }
        Ok(all)
    }

    /// Critic warm-up: real data with its own embedding (target 1) against a
    /// second real batch scored with that same, mismatched embedding (target 0).
    pub fn pretrain_discriminator(&mut self, steps: usize) -> Result<()> {
        for step in 1..=steps {
            let real = self.data.next_batch()?;
            let wrong = self.data.next_batch()?;
            let chars = real.chars.to_tensor(&self.device)?;
            let embed = self.embed_d.forward(&chars, &real.chars.lengths)?;

            let own = self.discriminator.forward(&real.frames, &real.lengths, &embed)?;
            let other = self.discriminator.forward(&wrong.frames, &wrong.lengths, &embed)?;
            let (loss_own, acc_own) = self.classification(&own, 1.0, true)?;
            let (loss_other, acc_other) = self.classification(&other, 0.0, false)?;
            let loss = (loss_own.mean_all()? + loss_other.mean_all()?)?;

            let mut grads = loss.backward()?;
            let health = GradientHealth::check(&self.d_params, &grads, self.cfg.grad_value_limit)?;
            if !health.is_healthy() {
                self.state.d_health.record_failure(health)?;
                continue;
            }
            self.state.d_health.record_success();
            let norm = clip_global_norm(&self.d_params, &mut grads, self.cfg.d_grad_clip)?;
            self.opt_d.step(&grads)?;

            let loss: f32 = loss.to_scalar()?;
            self.writer.add_scalar("pretrain/loss", loss, step)?;
            self.writer.add_scalar("pretrain/acc_d", acc_own, step)?;
            self.writer.add_scalar("pretrain/acc_d_wrong", acc_other, step)?;
            if step % 10 == 0 {
                info!(step, loss, acc_own, acc_other, grad_norm = norm, "D pretrain");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generator
    // -----------------------------------------------------------------------

    /// One generator update with the critic frozen.
    pub fn generator_step(&mut self) -> Result<GeneratorStats> {
        self.state.gen_iter += 1;
        let cfg = &self.cfg;
        let words = self.data.pick_words(cfg.batch_size)?;
        let chars = words.to_tensor(&self.device)?;
        let embed_g = self.embed_g.forward(&chars, &words.lengths)?;
        let embed_d = self.embed_d.forward(&chars, &words.lengths)?.detach();

        let fake = self
            .generator
            .forward(&embed_g, None, cfg.max_len, &mut self.rng)?;
        let fake_frames = self.add_noise(&fake.frames)?;
        let scored = self.discriminator.forward(&fake_frames, &fake.lengths, &embed_d)?;
        let reference = self.real_reference()?;
        let cfg = &self.cfg;
        let ranking_terms = cfg.profile == LossProfile::Ranking;

        let (adv, _) = self.classification(&scored, cfg.g_objective.target(), false)?;
        let per_sample = if ranking_terms {
            (&adv - (&scored.ranking * cfg.rank_scale)?)?
        } else {
            adv.clone()
        };

        // Reward and baseline on the host.
        let loss_fp_len = if ranking_terms {
            length_penalty(&fake.lengths, &reference.lengths, cfg.length_penalty_scale)
        } else {
            0.0
        };
        let rewards: Vec<f32> = per_sample
            .to_vec1::<f32>()?
            .into_iter()
            .map(|l| -l - loss_fp_len)
            .collect();
        let (reward_mean, reward_std) = population_moments(&rewards);
        let baseline = self.state.baseline.update(reward_mean, self.state.gen_iter);

        // Adversarial term.
        let loss_adv = adv.mean_all()?;
        let mut grads = loss_adv.backward()?;
        let adv_grad_norm = global_norm(&self.g_params, &grads)?;

        // Ranking and feature matching.
        let mut rank_grad_norm = 0.0;
        let mut fp_grad_norm = 0.0;
        let mut loss_fp_data = 0.0;
        if ranking_terms {
            let rank_term = ((&scored.ranking * -cfg.rank_scale)?.mean_all()? * cfg.lambda_rank)?;
            let rank_grads = rank_term.backward()?;
            rank_grad_norm = global_norm(&self.g_params, &rank_grads)?;

            let mask = self.mask(&fake_frames, &fake.lengths)?;
            let (mean, std) = masked_moments(&fake_frames, &mask)?;
            let fp = ((mean - reference.mean as f64)?.sqr()? + (std - reference.std as f64)?.sqr()?)?;
            loss_fp_data = fp.to_scalar::<f32>()?;
            let fp_grads = (fp * cfg.lambda_fp)?.backward()?;
            fp_grad_norm = global_norm(&self.g_params, &fp_grads)?;

            accumulate(&mut grads, &rank_grads, &self.g_params)?;
            accumulate(&mut grads, &fp_grads, &self.g_params)?;
        }

        // Policy gradient for the stop draws.
        let advantages: Vec<f32> = rewards.iter().map(|r| r - baseline).collect();
        let surrogate = self.policy_surrogate(&fake, &advantages)?;
        let pg_grads = surrogate.backward()?;
        let pg_grad_norm = global_norm(&self.g_params, &pg_grads)?;
        accumulate(&mut grads, &pg_grads, &self.g_params)?;

        let mut stats = GeneratorStats {
            loss: per_sample.mean_all()?.to_scalar()?,
            loss_adv: loss_adv.to_scalar()?,
            rank_mean: host_mean(&scored.ranking)?,
            loss_fp_data,
            loss_fp_len,
            reward_mean,
            reward_std,
            baseline,
            adv_grad_norm,
            rank_grad_norm,
            fp_grad_norm,
            pg_grad_norm,
            grad_norm: None,
            lengths: fake.lengths.clone(),
        };

        let health = GradientHealth::check(&self.g_params, &grads, self.cfg.grad_value_limit)?;
        if !health.is_healthy() {
            self.state.g_health.record_failure(health)?;
            return Ok(stats);
        }
        self.state.g_health.record_success();
        let norm = clip_global_norm(&self.g_params, &mut grads, self.cfg.g_grad_clip)?;
        self.opt_g.step(&grads)?;
        stats.grad_norm = Some(norm);

        let step = self.state.gen_iter;
        let (len_mean, len_std) = length_moments(&fake.lengths);
        for (tag, value) in [
            ("g_loss", stats.loss),
            ("g_loss_adv", stats.loss_adv),
            ("rank_g/mean", stats.rank_mean),
            ("loss_fp_data", stats.loss_fp_data),
            ("loss_fp_len", stats.loss_fp_len),
            ("reward_baseline", baseline),
            ("reward/mean", reward_mean),
            ("reward/std", reward_std),
            ("g_grad_norm", norm),
            ("g_loss_grad_norm", adv_grad_norm),
            ("g_rank_grad_norm", rank_grad_norm),
            ("g_fp_data_grad_norm", fp_grad_norm),
            ("g_pg_grad_norm", pg_grad_norm),
            ("fake_len/mean", len_mean),
            ("fake_len/std", len_std),
        ] {
            self.writer.add_scalar(tag, value, step)?;
        }
        debug!(gen_iter = step, loss = stats.loss, baseline, grad_norm = norm, "G");
        Ok(stats)
    }

    /// `gen_catchup` generator steps with periodic samples and checkpoints.
    pub fn generator_phase(&mut self) -> Result<Vec<GeneratorStats>> {
        let mut all = Vec::with_capacity(self.cfg.gen_catchup);
        for _ in 0..self.cfg.gen_catchup {
            all.push(self.generator_step()?);
            let step = self.state.gen_iter;
            if step % self.cfg.sample_every == 0 {
                self.emit_samples()?;
            }
            if step % self.cfg.checkpoint_every == 0 {
                self.save_checkpoint()?;
            }
        }
        Ok(all)
    }

    /// Scalar whose gradient w.r.t. each valid stop logit is
    /// `-λ_pg · advantage · (stop - σ(logit))`, i.e. REINFORCE on the draws.
    ///
    /// Only draws that could take effect (from `min_steps_before_stop` on,
    /// within the sample's length) contribute.
    fn policy_surrogate(&self, fake: &GeneratorOutput, advantages: &[f32]) -> Result<Tensor> {
        let (batch, steps) = fake.stop_logits.dims2()?;
        let probs: Vec<Vec<Vec<f32>>> = fake.stop_probs.to_dtype(DType::F32)?.to_vec3()?;
        let lambda = self.cfg.lambda_pg as f32;
        let mut coeff = vec![0f32; batch * steps];
        for i in 0..batch {
            for t in self.cfg.min_steps_before_stop..fake.lengths[i].min(steps) {
                let drawn = if fake.stops[t][i] { 1.0 } else { 0.0 };
                let p_stop = probs[i][t][1];
                coeff[i * steps + t] = -lambda * advantages[i] * (drawn - p_stop);
            }
        }
        let coeff = Tensor::from_vec(coeff, (batch, steps), &self.device)?
            .to_dtype(fake.stop_logits.dtype())?;
        Ok((&fake.stop_logits * coeff)?.sum_all()?)
    }

    // -----------------------------------------------------------------------
    // Sampling, checkpoints, loop
    // -----------------------------------------------------------------------

    /// Decode the fixed noise/word batch.
    pub fn sample_fixed(&mut self) -> Result<GeneratorOutput> {
        let embed = self
            .embed_g
            .forward(&self.fixed.chars, &self.fixed.words.lengths)?
            .detach();
        self.generator
            .forward(&embed, Some(&self.fixed.noise), self.cfg.max_len, &mut self.rng)
    }

    /// Spectrogram heatmaps of the fixed batch; audio too on checkpoint steps.
    pub fn emit_samples(&mut self) -> Result<()> {
        let out = self.sample_fixed()?;
        let frames: Vec<Vec<Vec<f32>>> = out.frames.detach().to_vec3()?;
        let step = self.state.gen_iter;
        let with_audio = step % self.cfg.checkpoint_every == 0;
        let words = self.fixed.words.words.clone();
        for (i, word) in words.iter().enumerate() {
            let sample = &frames[i][..out.lengths[i]];
            self.writer
                .add_spectrogram(&format!("fake_spectrogram/{i}-{word}"), sample, step)?;
            if with_audio {
                let waveform = frames_to_waveform(sample, self.cfg.griffin_lim_iters)?;
                self.writer.add_audio(
                    &format!("fake_audio/{i}-{word}"),
                    &waveform,
                    self.cfg.sample_rate,
                    step,
                )?;
            }
        }
        Ok(())
    }

    /// Heatmaps and audio of the source's reference batch at step 0.
    pub fn emit_real_reference(&mut self) -> Result<()> {
        let batch = self.data.reference_batch()?;
        let frames: Vec<Vec<Vec<f32>>> = batch.frames.to_vec3()?;
        for (i, word) in batch.chars.words.iter().enumerate() {
            let sample = &frames[i][..batch.lengths[i]];
            self.writer
                .add_spectrogram(&format!("real_spectrogram/{i}-{word}"), sample, 0)?;
            let waveform = frames_to_waveform(sample, self.cfg.griffin_lim_iters)?;
            self.writer
                .add_audio(&format!("real_audio/{i}-{word}"), &waveform, self.cfg.sample_rate, 0)?;
        }
        Ok(())
    }

    /// Persist all four modules at `gen_iter + load_iterations`.
    pub fn save_checkpoint(&self) -> Result<Vec<PathBuf>> {
        let iteration = self.state.gen_iter + self.cfg.load_iterations;
        self.checkpoints
            .save(&self.cfg.model_name_save, iteration, &self.stores())
    }

    pub fn load_checkpoint(&mut self, run: &str, iteration: usize) -> Result<()> {
        self.checkpoints.load(run, iteration, &self.stores())
    }

    /// One outer iteration, honouring the run mode.
    pub fn train_iteration(&mut self) -> Result<()> {
        self.state.iteration += 1;
        if self.cfg.run_mode.trains_discriminator() {
            self.discriminator_phase()?;
        }
        if self.cfg.run_mode.trains_generator() {
            self.generator_phase()?;
        }
        Ok(())
    }

    /// Pretrain, then alternate phases for `max_iterations` outer iterations
    /// (forever when `None`). Telemetry is flushed before any error returns.
    pub fn train(&mut self, max_iterations: Option<usize>) -> Result<()> {
        let result = self.run(max_iterations);
        let flushed = self.writer.flush();
        if let Err(e) = &result {
            error!(error = %e, iteration = self.state.iteration, "training aborted");
        }
        result.and(flushed)
    }

    fn run(&mut self, max_iterations: Option<usize>) -> Result<()> {
        if self.cfg.pretrain_d > 0 && self.cfg.run_mode.trains_discriminator() {
            info!(steps = self.cfg.pretrain_d, "pretraining discriminator");
            self.pretrain_discriminator(self.cfg.pretrain_d)?;
        }
        self.emit_real_reference()?;
        let mut done = 0;
        while max_iterations.is_none_or(|max| done < max) {
            self.train_iteration()?;
            done += 1;
        }
        info!(
            iterations = done,
            gen_iter = self.state.gen_iter,
            dis_iter = self.state.dis_iter,
            "training finished"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn stores(&self) -> ModelStores<'_> {
        ModelStores {
            gen_vars: &self.gen_vars,
            dis_vars: &self.dis_vars,
            eg_vars: &self.eg_vars,
            ed_vars: &self.ed_vars,
        }
    }

    fn add_noise(&mut self, frames: &Tensor) -> Result<Tensor> {
        let noise = gaussian(&mut self.rng, frames.dims(), self.cfg.noise_scale, &self.device)?
            .to_dtype(frames.dtype())?;
        Ok((frames + noise)?)
    }

    fn mask(&self, frames: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let (n, t, _) = frames.dims3()?;
        Ok(length_mask((n, t), lengths, &self.device)?.to_dtype(frames.dtype())?)
    }

    /// Length-normalised masked cross-entropy per sample `[N]` and accuracy.
    fn classification(
        &self,
        scores: &DiscriminatorOutput,
        target: f64,
        real: bool,
    ) -> Result<(Tensor, f32)> {
        let (n, t) = scores.logits.dims2()?;
        let mask = length_mask((n, t), &scores.lengths, &self.device)?
            .to_dtype(scores.logits.dtype())?;
        let targets = (mask.ones_like()? * target)?;
        let per_sample =
            binary_cross_entropy_with_logits_per_sample(&scores.logits, &targets, Some(&mask))?;
        let lengths: Vec<f32> = scores.lengths.iter().map(|&l| l as f32).collect();
        let lengths = Tensor::from_vec(lengths, n, &self.device)?.to_dtype(per_sample.dtype())?;
        let loss = (per_sample / lengths)?;
        let acc = masked_accuracy(&scores.logits.to_dtype(DType::F32)?, &mask.to_dtype(DType::F32)?, real)?;
        Ok((loss, acc))
    }

    /// Last critic-phase real statistics, or a fresh batch when none exist.
    fn real_reference(&mut self) -> Result<RealReference> {
        if let Some(reference) = &self.state.real_reference {
            return Ok(reference.clone());
        }
        let RealBatch { frames, lengths, .. } = self.data.next_batch()?;
        let (mean, std) = masked_moments(&frames, &self.mask(&frames, &lengths)?)?;
        let reference = RealReference {
            mean: mean.to_scalar()?,
            std: std.to_scalar()?,
            lengths,
        };
        self.state.real_reference = Some(reference.clone());
        Ok(reference)
    }
}

fn count_params(vars: &[Var]) -> usize {
    vars.iter().map(|v| v.elem_count()).sum()
}

fn host_mean(values: &Tensor) -> Result<f32> {
    Ok(values.mean_all()?.to_dtype(DType::F32)?.to_scalar()?)
}

/// Mean and population standard deviation.
fn population_moments(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}
