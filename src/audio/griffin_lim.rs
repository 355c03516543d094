//! Spectrogram frames ↔ waveform conversion.
//!
//! Dataset frames are magnitudes mapped through `m / 20 - 0.5` and clamped to
//! `[-0.5, 0.5]`. Going back, `(m + 0.5).max(0) * 20` recovers a magnitude
//! and Griffin-Lim estimates a consistent phase:
//!
//! ```text
//! x_0     = istft(|S|)
//! x_{k+1} = istft(|S| · e^{i∠stft(x_k)})
//! ```

use rustfft::num_complex::Complex;

use super::stft::{Stft, magnitudes};
use crate::{Error, Result};

/// Magnitude that maps to frame value 0.5.
const MAGNITUDE_SCALE: f64 = 20.0;
const FRAME_OFFSET: f64 = 0.5;

/// Frame value → linear magnitude.
pub fn frame_to_magnitude(value: f32) -> f64 {
    ((value as f64 + FRAME_OFFSET).max(0.0)) * MAGNITUDE_SCALE
}

/// Linear magnitude → frame value in `[-0.5, 0.5]`.
pub fn magnitude_to_frame(magnitude: f64) -> f32 {
    (magnitude / MAGNITUDE_SCALE - FRAME_OFFSET).clamp(-FRAME_OFFSET, FRAME_OFFSET) as f32
}

/// Griffin-Lim phase reconstruction of a `[frames][bins]` magnitude spectrogram.
pub fn griffin_lim(stft: &Stft, magnitude: &[Vec<f64>], iterations: usize) -> Vec<f32> {
    let zero_phase: Vec<Vec<Complex<f64>>> = magnitude
        .iter()
        .map(|frame| frame.iter().map(|&m| Complex::new(m, 0.0)).collect())
        .collect();
    let mut audio = stft.inverse(&zero_phase);

    for _ in 0..iterations {
        let estimate = stft.forward(&audio);
        let rephased: Vec<Vec<Complex<f64>>> = magnitude
            .iter()
            .zip(estimate.iter())
            .map(|(mags, bins)| {
                mags.iter()
                    .zip(bins.iter())
                    .map(|(&m, c)| Complex::from_polar(m, c.arg()))
                    .collect()
            })
            .collect();
        audio = stft.inverse(&rephased);
    }
    audio
}

/// Decode `[frames][bins]` frame values to a mono waveform.
pub fn frames_to_waveform(frames: &[Vec<f32>], iterations: usize) -> Result<Vec<f32>> {
    let bins = validate_frames(frames)?;
    let stft = Stft::for_bins(bins);
    let magnitude: Vec<Vec<f64>> = frames
        .iter()
        .map(|frame| frame.iter().map(|&v| frame_to_magnitude(v)).collect())
        .collect();
    Ok(griffin_lim(&stft, &magnitude, iterations))
}

/// Encode a mono waveform as `[frames][frame_size]` frame values.
pub fn waveform_to_frames(samples: &[f32], frame_size: usize) -> Result<Vec<Vec<f32>>> {
    if frame_size < 2 {
        return Err(Error::Audio(format!(
            "frame size must be at least 2, got {frame_size}"
        )));
    }
    if samples.is_empty() {
        return Err(Error::Audio("cannot encode an empty waveform".into()));
    }
    let stft = Stft::for_bins(frame_size);
    Ok(magnitudes(&stft.forward(samples))
        .into_iter()
        .map(|frame| frame.into_iter().map(magnitude_to_frame).collect())
        .collect())
}

fn validate_frames(frames: &[Vec<f32>]) -> Result<usize> {
    let bins = frames
        .first()
        .map(Vec::len)
        .ok_or_else(|| Error::Audio("no frames to decode".into()))?;
    if bins < 2 {
        return Err(Error::Audio(format!("frames need at least 2 bins, got {bins}")));
    }
    if let Some(bad) = frames.iter().position(|f| f.len() != bins) {
        return Err(Error::Audio(format!(
            "frame {bad} has {} bins, expected {bins}",
            frames[bad].len()
        )));
    }
    Ok(bins)
}
