//! Short-time Fourier transform and its overlap-add inverse.
//!
//! Configuration:
//! - Window: periodic Hann, length `n_fft`
//! - Hop length: `n_fft / 4` by default
//! - Padding: centered, reflect, `n_fft / 2` on both sides
//! - Inverse: windowed overlap-add normalised by the summed squared window

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// One-sided complex spectrum per frame, `[frames][n_fft / 2 + 1]`.
pub type Spectrum = Vec<Vec<Complex<f64>>>;

/// STFT processor.
///
/// Pre-computes the Hann window and both FFT plans on construction.
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            n_fft,
            hop_length: hop_length.max(1),
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    /// `n_fft` chosen so the one-sided spectrum has `num_bins` bins, hop `n_fft / 4`.
    pub fn for_bins(num_bins: usize) -> Self {
        let n_fft = 2 * num_bins.saturating_sub(1).max(1);
        Self::new(n_fft, n_fft / 4)
    }

    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Samples produced by [`Self::inverse`] for `frames` frames.
    pub fn output_len(&self, frames: usize) -> usize {
        frames.saturating_sub(1) * self.hop_length
    }

    /// Centered STFT of mono `samples`.
    pub fn forward(&self, samples: &[f32]) -> Spectrum {
        if samples.is_empty() {
            return Vec::new();
        }
        let signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let pad = self.n_fft / 2;
        let mut padded = reflect_pad(&signal, pad, pad);
        if padded.len() < self.n_fft {
            padded.resize(self.n_fft, 0.0);
        }

        let num_bins = self.num_bins();
        let num_frames = (padded.len() - self.n_fft) / self.hop_length + 1;
        let mut frames = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let start = frame_idx * self.hop_length;
            let mut buffer: Vec<Complex<f64>> = (0..self.n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();
            self.forward.process(&mut buffer);
            buffer.truncate(num_bins);
            frames.push(buffer);
        }
        frames
    }

    /// Inverse of [`Self::forward`]; returns [`Self::output_len`] samples.
    pub fn inverse(&self, spectrum: &[Vec<Complex<f64>>]) -> Vec<f32> {
        let num_frames = spectrum.len();
        if num_frames == 0 {
            return Vec::new();
        }
        let n = self.n_fft;
        let full_len = n + self.hop_length * (num_frames - 1);
        let mut signal = vec![0.0f64; full_len];
        let mut norm = vec![0.0f64; full_len];

        for (frame_idx, bins) in spectrum.iter().enumerate() {
            let mut buffer = vec![Complex::new(0.0, 0.0); n];
            // Hermitian mirror of the one-sided spectrum.
            for (k, &value) in bins.iter().enumerate().take(n / 2 + 1) {
                buffer[k] = value;
                if k > 0 && k < n - k {
                    buffer[n - k] = value.conj();
                }
            }
            self.inverse.process(&mut buffer);

            let start = frame_idx * self.hop_length;
            for i in 0..n {
                let w = self.window[i];
                signal[start + i] += buffer[i].re / n as f64 * w;
                norm[start + i] += w * w;
            }
        }

        let pad = n / 2;
        let len = self.output_len(num_frames);
        (pad..pad + len)
            .map(|i| {
                if norm[i] > 1e-8 {
                    (signal[i] / norm[i]) as f32
                } else {
                    0.0
                }
            })
            .collect()
    }
}

/// Magnitude of each bin.
pub fn magnitudes(spectrum: &[Vec<Complex<f64>>]) -> Vec<Vec<f64>> {
    spectrum
        .iter()
        .map(|frame| frame.iter().map(|c| c.norm()).collect())
        .collect()
}

/// Periodic Hann window of the given length.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);

    // Left reflection: signal[pad_left], ..., signal[1]
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }
    padded.extend_from_slice(signal);
    // Right reflection: signal[len-2], signal[len-3], ...
    for i in 0..pad_right {
        padded.push(signal[len.saturating_sub(2 + i)]);
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sr: f64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sr).sin() as f32)
            .collect()
    }

    #[test]
    fn hann_window_properties() {
        let w = hann_window(64);
        assert!(w[0].abs() < 1e-12);
        assert!((w[32] - 1.0).abs() < 1e-12);
        assert!((w[10] - w[54]).abs() < 1e-12);
    }

    #[test]
    fn reflect_pad_basic() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2, 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn forward_frame_count_and_bins() {
        let stft = Stft::new(64, 16);
        let spec = stft.forward(&sine(440.0, 8000.0, 640));
        assert_eq!(spec.len(), 640 / 16 + 1);
        assert!(spec.iter().all(|f| f.len() == 33));
        assert_eq!(stft.output_len(spec.len()), 640);
    }

    #[test]
    fn tone_peaks_at_its_bin() {
        let stft = Stft::new(64, 16);
        // 1000 Hz at 8 kHz with n_fft 64 is bin 8.
        let mags = magnitudes(&stft.forward(&sine(1000.0, 8000.0, 1024)));
        let mid = &mags[mags.len() / 2];
        let peak = mid
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 8);
    }

    #[test]
    fn inverse_reconstructs_signal() {
        let stft = Stft::new(64, 16);
        let x = sine(523.0, 8000.0, 800);
        let y = stft.inverse(&stft.forward(&x));
        assert_eq!(y.len(), x.len());
        for (a, b) in x.iter().zip(y.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn short_and_empty_inputs() {
        let stft = Stft::for_bins(9);
        assert_eq!((stft.n_fft, stft.hop_length), (16, 4));
        assert_eq!(stft.num_bins(), 9);
        assert!(stft.forward(&[]).is_empty());
        assert!(stft.inverse(&[]).is_empty());
        let spec = stft.forward(&[0.5, -0.5, 0.25]);
        assert!(!spec.is_empty());
    }
}
