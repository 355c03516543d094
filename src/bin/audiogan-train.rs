//! audiogan training CLI.
//!
//! Trains the word-conditioned GAN on a directory of `<word>[_<take>].wav`
//! recordings. Summaries go to `<log-dir>/<model-name>-<unix_time>/` and
//! checkpoints to `<checkpoint-dir>/<model-name>-{gen,dis,eg,ed}-<iter>.safetensors`.
//!
//! Settings are layered: defaults, then `--config <file.json>`, then flags.
//!
//! Exit code 0 when the requested iterations finish, non-zero on error
//! (including gradient divergence).

use std::path::PathBuf;

use audiogan_rs::config::{LossProfile, RunMode, TrainConfig};
use audiogan_rs::data::InMemoryDataset;
use audiogan_rs::telemetry::FileWriter;
use audiogan_rs::train::Trainer;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "audiogan-train",
    about = "Train a word-conditioned recurrent audio GAN",
    long_about = "Train a generator that says words as spectrogram frames against a\n\
                  bidirectional critic. Runs forever unless --iterations is given."
)]
struct Args {
    /// Directory of `<word>.wav` or `<word>_<take>.wav` recordings.
    #[arg(long, short = 'd')]
    data_dir: PathBuf,

    /// JSON file overriding the default configuration.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Outer iterations to run. Omit to train until interrupted.
    #[arg(long, short = 'n')]
    iterations: Option<usize>,

    /// Train only the generator.
    #[arg(long, conflicts_with = "dis_only")]
    gen_only: bool,

    /// Train only the discriminator.
    #[arg(long)]
    dis_only: bool,

    /// Use the adversarial term alone (no ranking or feature matching).
    #[arg(long)]
    plain: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Generation ceiling in frames.
    #[arg(long)]
    max_len: Option<usize>,

    #[arg(long)]
    g_state_size: Option<usize>,

    #[arg(long)]
    d_state_size: Option<usize>,

    #[arg(long)]
    critic_iter: Option<usize>,

    /// Critic warm-up steps before the first outer iteration.
    #[arg(long)]
    pretrain_d: Option<usize>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Run name used for saved summaries and checkpoints.
    #[arg(long)]
    model_name_save: Option<String>,

    /// Run name to resume from.
    #[arg(long, requires = "load_iterations")]
    model_name_load: Option<String>,

    /// Iteration of the checkpoint to resume; also offsets saved iterations.
    #[arg(long)]
    load_iterations: Option<usize>,

    #[arg(long, short = 's')]
    seed: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(TrainConfig, PathBuf, Option<usize>)> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        if self.gen_only {
            cfg.run_mode = RunMode::GeneratorOnly;
        }
        if self.dis_only {
            cfg.run_mode = RunMode::DiscriminatorOnly;
        }
        if self.plain {
            cfg.profile = LossProfile::Plain;
        }
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { cfg.$field = v; })*
            };
        }
        set!(
            batch_size,
            max_len,
            g_state_size,
            d_state_size,
            critic_iter,
            pretrain_d,
            log_dir,
            checkpoint_dir,
            model_name_save,
            load_iterations,
            seed
        );
        if self.model_name_load.is_some() {
            cfg.model_name_load = self.model_name_load;
        }
        cfg.validate()?;
        Ok((cfg, self.data_dir, self.iterations))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (cfg, data_dir, iterations) = Args::parse().into_config()?;

    for dir in [&cfg.log_dir, &cfg.checkpoint_dir] {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let data = InMemoryDataset::from_wav_dir(&data_dir, &cfg, device.clone())
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", data_dir.display()))?;
    tracing::info!(
        utterances = data.len(),
        words = data.vocabulary().len(),
        "dataset ready"
    );

    let writer = FileWriter::create(&cfg.log_dir, &cfg.model_name_save)?;
    let mut trainer = Trainer::new(cfg, data, writer, device)
        .map_err(|e| anyhow::anyhow!("failed to build trainer: {e}"))?;

    trainer
        .train(iterations)
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;

    let state = trainer.state();
    println!(
        "{}",
        serde_json::json!({
            "iterations": state.iteration,
            "gen_iter": state.gen_iter,
            "dis_iter": state.dis_iter,
            "epoch": state.epoch,
        })
    );
    Ok(())
}
