//! In-memory dataset of word utterances.

use std::path::Path;

use candle_core::Device;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use super::{BatchSource, CharBatch, RealBatch, WordSource};
use crate::audio::{read_wav_mono, waveform_to_frames};
use crate::config::TrainConfig;
use crate::{Error, Result};

/// One spoken word as `[T][F]` frame values.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub word: String,
    pub frames: Vec<Vec<f32>>,
}

/// Shuffled, seeded batching over utterances held in RAM.
///
/// Utterances longer than `max_len` frames are cropped. A new epoch begins
/// (with a fresh shuffle) whenever the current order is exhausted.
pub struct InMemoryDataset {
    utterances: Vec<Utterance>,
    vocabulary: Vec<String>,
    frame_size: usize,
    batch_size: usize,
    device: Device,
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    batch_id: usize,
}

impl InMemoryDataset {
    pub fn new(
        mut utterances: Vec<Utterance>,
        frame_size: usize,
        batch_size: usize,
        max_len: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if utterances.is_empty() {
            return Err(Error::Data("dataset has no utterances".into()));
        }
        if batch_size == 0 || max_len == 0 {
            return Err(Error::Data("batch_size and max_len must be positive".into()));
        }
        for utt in utterances.iter_mut() {
            if utt.word.is_empty() {
                return Err(Error::Data("utterance with an empty word".into()));
            }
            if utt.frames.is_empty() {
                return Err(Error::Data(format!("utterance '{}' has no frames", utt.word)));
            }
            if let Some(frame) = utt.frames.iter().find(|f| f.len() != frame_size) {
                return Err(Error::Data(format!(
                    "utterance '{}' has frames of width {}, expected {frame_size}",
                    utt.word,
                    frame.len()
                )));
            }
            utt.frames.truncate(max_len);
        }

        let mut vocabulary: Vec<String> = utterances.iter().map(|u| u.word.clone()).collect();
        vocabulary.sort();
        vocabulary.dedup();

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..utterances.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            utterances,
            vocabulary,
            frame_size,
            batch_size,
            device,
            rng,
            order,
            cursor: 0,
            epoch: 1,
            batch_id: 0,
        })
    }

    pub fn from_config(utterances: Vec<Utterance>, cfg: &TrainConfig, device: Device) -> Result<Self> {
        Self::new(
            utterances,
            cfg.frame_size,
            cfg.batch_size,
            cfg.max_len,
            cfg.seed,
            device,
        )
    }

    /// Load every `<word>.wav` (or `<word>_<take>.wav`) file in `dir`.
    pub fn from_wav_dir(dir: impl AsRef<Path>, cfg: &TrainConfig, device: Device) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
            })
            .collect();
        paths.sort();

        let mut utterances = Vec::with_capacity(paths.len());
        for path in &paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let word = stem.split('_').next().unwrap_or(stem).to_string();
            let (samples, sample_rate) = read_wav_mono(path)?;
            if sample_rate != cfg.sample_rate {
                warn!(
                    path = %path.display(),
                    sample_rate,
                    expected = cfg.sample_rate,
                    "sample rate mismatch, frames will be off-pitch"
                );
            }
            if samples.is_empty() {
                warn!(path = %path.display(), "skipping empty recording");
                continue;
            }
            let frames = waveform_to_frames(&samples, cfg.frame_size)?;
            utterances.push(Utterance { word, frames });
        }
        if utterances.is_empty() {
            return Err(Error::Data(format!("no WAV files in {}", dir.display())));
        }
        info!(dir = %dir.display(), count = utterances.len(), "loaded utterances");
        Self::from_config(utterances, cfg, device)
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
            self.batch_id = 0;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }
}

impl InMemoryDataset {
    fn batch_of(&self, indices: &[usize], epoch: usize, batch_id: usize) -> Result<RealBatch> {
        let words: Vec<&str> = indices.iter().map(|&i| self.utterances[i].word.as_str()).collect();
        let chars = CharBatch::from_words(&words)?;
        let frames: Vec<&[Vec<f32>]> = indices
            .iter()
            .map(|&i| self.utterances[i].frames.as_slice())
            .collect();
        RealBatch::from_frames(epoch, batch_id, &frames, chars, self.frame_size, &self.device)
    }
}

impl BatchSource for InMemoryDataset {
    fn next_batch(&mut self) -> Result<RealBatch> {
        let indices: Vec<usize> = (0..self.batch_size).map(|_| self.next_index()).collect();
        let batch = self.batch_of(&indices, self.epoch, self.batch_id)?;
        self.batch_id += 1;
        Ok(batch)
    }

    /// The first `batch_size` utterances in load order, cycled when there are
    /// fewer. Reported as epoch 0, batch 0.
    fn reference_batch(&mut self) -> Result<RealBatch> {
        let indices: Vec<usize> = (0..self.batch_size).map(|i| i % self.utterances.len()).collect();
        self.batch_of(&indices, 0, 0)
    }
}

impl WordSource for InMemoryDataset {
    fn pick_words(&mut self, n: usize) -> Result<CharBatch> {
        let words: Vec<&str> = (0..n)
            .map(|_| {
                let i = self.rng.random_range(0..self.vocabulary.len());
                self.vocabulary[i].as_str()
            })
            .collect();
        CharBatch::from_words(&words)
    }
}
