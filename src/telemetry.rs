//! Summary writers for scalars, spectrogram heatmaps and audio.
//!
//! [`FileWriter`] lays a run out as:
//!
//! ```text
//! <log_dir>/<model_name>-<unix_time>/
//!   scalars.jsonl                  {"tag": "loss_d", "step": 20, "value": 1.38}
//!   fake_spectrogram_yes-00020.png
//!   fake_audio_yes-00200.wav
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::griffin_lim::frame_to_magnitude;
use crate::audio::{peak_normalize, write_wav};
use crate::{Error, Result};

/// Horizontal pixels per frame in heatmaps.
const HEATMAP_REPEAT: usize = 4;

/// Sink for training telemetry keyed by iteration.
pub trait SummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()>;

    /// `frames` is `[T][F]` in frame-value space.
    fn add_spectrogram(&mut self, tag: &str, frames: &[Vec<f32>], step: usize) -> Result<()>;

    fn add_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize)
    -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Writer that only logs scalars through `tracing`.
#[derive(Debug, Default)]
pub struct TracingWriter;

impl SummaryWriter for TracingWriter {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        debug!(tag, value, step, "scalar");
        Ok(())
    }

    fn add_spectrogram(&mut self, tag: &str, frames: &[Vec<f32>], step: usize) -> Result<()> {
        debug!(tag, frames = frames.len(), step, "spectrogram");
        Ok(())
    }

    fn add_audio(
        &mut self,
        tag: &str,
        samples: &[f32],
        sample_rate: u32,
        step: usize,
    ) -> Result<()> {
        debug!(tag, samples = samples.len(), sample_rate, step, "audio");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One line of `scalars.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: usize,
    pub value: f32,
}

/// Writer persisting everything under one run directory.
pub struct FileWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl FileWriter {
    /// Create `<log_dir>/<model_name>-<unix_time>`.
    pub fn create(log_dir: impl AsRef<Path>, model_name: &str) -> Result<Self> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::in_dir(log_dir.as_ref().join(format!("{model_name}-{stamp}")))
    }

    /// Use `dir` as the run directory, creating it if needed.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() && !dir.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} is not a directory", dir.display()),
            )));
        }
        std::fs::create_dir_all(&dir)?;
        let scalars = BufWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("scalars.jsonl"))?,
        );
        info!(dir = %dir.display(), "writing summaries");
        Ok(Self { dir, scalars })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, tag: &str, step: usize, ext: &str) -> PathBuf {
        let name: String = tag
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}-{step:05}.{ext}"))
    }
}

impl SummaryWriter for FileWriter {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
        };
        serde_json::to_writer(&mut self.scalars, &record)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    fn add_spectrogram(&mut self, tag: &str, frames: &[Vec<f32>], step: usize) -> Result<()> {
        let image = heatmap(frames)?;
        image.save(self.artifact_path(tag, step, "png"))?;
        Ok(())
    }

    fn add_audio(
        &mut self,
        tag: &str,
        samples: &[f32],
        sample_rate: u32,
        step: usize,
    ) -> Result<()> {
        let mut samples = samples.to_vec();
        peak_normalize(&mut samples);
        write_wav(self.artifact_path(tag, step, "wav"), &samples, sample_rate)
    }

    fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }
}

/// Grayscale heatmap: time on x (repeated per frame), frequency on y with
/// low bins at the bottom, brightness proportional to magnitude.
pub fn heatmap(frames: &[Vec<f32>]) -> Result<image::GrayImage> {
    let bins = frames.first().map(Vec::len).unwrap_or(0);
    if bins == 0 {
        return Err(Error::Audio("cannot draw an empty spectrogram".into()));
    }
    let magnitudes: Vec<Vec<f64>> = frames
        .iter()
        .map(|f| f.iter().map(|&v| frame_to_magnitude(v)).collect())
        .collect();
    let peak = magnitudes
        .iter()
        .flatten()
        .copied()
        .fold(0.0f64, f64::max)
        .max(1e-8);

    let width = frames.len() * HEATMAP_REPEAT;
    let mut pixels = vec![0u8; width * bins];
    for (t, column) in magnitudes.iter().enumerate() {
        for (bin, &m) in column.iter().enumerate().take(bins) {
            let value = (m / peak * 255.0).round() as u8;
            let y = bins - 1 - bin;
            for r in 0..HEATMAP_REPEAT {
                pixels[y * width + t * HEATMAP_REPEAT + r] = value;
            }
        }
    }
    image::GrayImage::from_raw(width as u32, bins as u32, pixels)
        .ok_or_else(|| Error::Audio("heatmap buffer size mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heatmap_dimensions_and_orientation() {
        // Three frames of four bins; only the lowest bin of frame 1 is loud.
        let mut frames = vec![vec![-0.5f32; 4]; 3];
        frames[1][0] = 0.5;
        let img = heatmap(&frames).unwrap();
        assert_eq!(img.width(), 12);
        assert_eq!(img.height(), 4);
        assert_eq!(img.get_pixel(4, 3)[0], 255);
        assert_eq!(img.get_pixel(4, 0)[0], 0);
        assert_eq!(img.get_pixel(0, 3)[0], 0);
    }

    #[test]
    fn file_writer_persists_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = FileWriter::create(tmp.path(), "run").unwrap();
        writer.add_scalar("loss_d", 1.5, 3).unwrap();
        writer.add_scalar("acc/g", 0.25, 3).unwrap();
        writer
            .add_spectrogram("fake/yes", &vec![vec![0.0f32; 5]; 2], 20)
            .unwrap();
        writer.add_audio("fake/yes", &[0.0, 0.2, -0.1], 8000, 200).unwrap();
        writer.flush().unwrap();

        let dir = writer.dir().to_path_buf();
        assert!(dir.file_name().unwrap().to_str().unwrap().starts_with("run-"));
        let lines: Vec<ScalarRecord> = std::fs::read_to_string(dir.join("scalars.jsonl"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].tag, "acc/g");
        assert!(dir.join("fake_yes-00020.png").exists());
        assert!(dir.join("fake_yes-00200.wav").exists());
    }

    #[test]
    fn empty_spectrogram_rejected() {
        assert!(heatmap(&[]).is_err());
    }
}
