//! Audio utilities: STFT, Griffin-Lim phase reconstruction and WAV I/O.
//!
//! Frames in this crate are one-sided magnitude spectra squashed into
//! `[-0.5, 0.5]`. [`griffin_lim`] converts between that representation and
//! waveforms; [`stft`] holds the transform itself.

pub mod griffin_lim;
pub mod stft;
mod wav;

pub use griffin_lim::{frames_to_waveform, waveform_to_frames};
pub use wav::{downmix, peak_normalize, read_wav, read_wav_mono, write_wav};
