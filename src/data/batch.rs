//! Padded batch containers.

use candle_core::{Device, Tensor};

use crate::{Error, Result};

/// Words as padded byte-id rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CharBatch {
    pub words: Vec<String>,
    /// `[N][max_chars]`, zero-padded.
    pub ids: Vec<Vec<u32>>,
    pub lengths: Vec<usize>,
}

impl CharBatch {
    /// Encode words as their UTF-8 bytes. Empty words are rejected.
    pub fn from_words<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        if words.is_empty() {
            return Err(Error::Data("cannot build an empty character batch".into()));
        }
        let width = words.iter().map(|w| w.as_ref().len()).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(words.len());
        let mut lengths = Vec::with_capacity(words.len());
        for word in words {
            let bytes = word.as_ref().as_bytes();
            if bytes.is_empty() {
                return Err(Error::Data("empty word in character batch".into()));
            }
            let mut row: Vec<u32> = bytes.iter().map(|&b| b as u32).collect();
            row.resize(width, 0);
            ids.push(row);
            lengths.push(bytes.len());
        }
        Ok(Self {
            words: words.iter().map(|w| w.as_ref().to_string()).collect(),
            ids,
            lengths,
        })
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn max_chars(&self) -> usize {
        self.ids.first().map(Vec::len).unwrap_or(0)
    }

    /// `[N, max_chars]` u32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.ids.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (self.len(), self.max_chars()), device)?)
    }
}

/// One batch of real utterances.
#[derive(Debug, Clone)]
pub struct RealBatch {
    pub epoch: usize,
    pub batch_id: usize,
    /// `[N, T, F]`, zero past each sample's length.
    pub frames: Tensor,
    pub lengths: Vec<usize>,
    pub chars: CharBatch,
}

impl RealBatch {
    /// Pad `[T_i][F]` host frame sequences into a batch.
    pub fn from_frames(
        epoch: usize,
        batch_id: usize,
        sequences: &[&[Vec<f32>]],
        chars: CharBatch,
        frame_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if sequences.len() != chars.len() {
            return Err(Error::Data(format!(
                "{} frame sequences for {} words",
                sequences.len(),
                chars.len()
            )));
        }
        let steps = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
        if steps == 0 {
            return Err(Error::Data("batch has no frames".into()));
        }
        let mut data = vec![0f32; sequences.len() * steps * frame_size];
        let mut lengths = Vec::with_capacity(sequences.len());
        for (i, seq) in sequences.iter().enumerate() {
            if seq.is_empty() {
                return Err(Error::Data(format!("utterance '{}' has no frames", chars.words[i])));
            }
            for (t, frame) in seq.iter().enumerate() {
                if frame.len() != frame_size {
                    return Err(Error::Data(format!(
                        "frame of width {} in a batch of width {frame_size}",
                        frame.len()
                    )));
                }
                let start = (i * steps + t) * frame_size;
                data[start..start + frame_size].copy_from_slice(frame);
            }
            lengths.push(seq.len());
        }
        Ok(Self {
            epoch,
            batch_id,
            frames: Tensor::from_vec(data, (sequences.len(), steps, frame_size), device)?,
            lengths,
            chars,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_become_padded_bytes() {
        let batch = CharBatch::from_words(&["no", "yes"]).unwrap();
        assert_eq!(batch.ids, vec![vec![110, 111, 0], vec![121, 101, 115]]);
        assert_eq!(batch.lengths, vec![2, 3]);
        let t = batch.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
    }

    #[test]
    fn empty_word_rejected() {
        assert!(CharBatch::from_words(&["ok", ""]).is_err());
        assert!(CharBatch::from_words::<&str>(&[]).is_err());
    }

    #[test]
    fn frames_are_padded_to_longest() {
        let a = vec![vec![1.0f32, 1.0]; 3];
        let b = vec![vec![2.0f32, 2.0]; 1];
        let chars = CharBatch::from_words(&["a", "b"]).unwrap();
        let batch =
            RealBatch::from_frames(1, 0, &[&a, &b], chars, 2, &Device::Cpu).unwrap();
        assert_eq!(batch.lengths, vec![3, 1]);
        let v: Vec<Vec<Vec<f32>>> = batch.frames.to_vec3().unwrap();
        assert_eq!(v[1][0], vec![2.0, 2.0]);
        assert_eq!(v[1][2], vec![0.0, 0.0]);
        assert_eq!(batch.batch_size(), 2);
    }

    #[test]
    fn wrong_frame_width_rejected() {
        let a = vec![vec![1.0f32; 3]];
        let chars = CharBatch::from_words(&["a"]).unwrap();
        assert!(RealBatch::from_frames(1, 0, &[&a], chars, 2, &Device::Cpu).is_err());
    }
}
