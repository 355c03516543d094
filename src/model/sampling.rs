//! Seeded randomness for noise inputs and stop decisions.
//!
//! Everything draws from a caller-owned RNG so that a run is reproducible
//! from its seed; candle's device RNG is never used during training.

use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{Error, Result};

/// Tensor of i.i.d. `N(0, std²)` samples.
pub fn gaussian<R: Rng + ?Sized>(
    rng: &mut R,
    shape: impl Into<Shape>,
    std: f64,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let normal = Normal::new(0.0f32, std as f32)
        .map_err(|e| Error::Config(format!("noise std {std}: {e}")))?;
    let data: Vec<f32> = (0..shape.elem_count()).map(|_| normal.sample(rng)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Draw one outcome index from each row of a categorical distribution.
///
/// Walks the CDF of every row; rounding slack falls on the last outcome.
pub fn categorical<R: Rng + ?Sized>(rng: &mut R, probs: &[Vec<f32>]) -> Vec<usize> {
    probs
        .iter()
        .map(|row| {
            let sample: f64 = rng.random();
            let mut cumulative = 0.0f64;
            for (i, &p) in row.iter().enumerate() {
                cumulative += p as f64;
                if sample < cumulative {
                    return i;
                }
            }
            row.len().saturating_sub(1)
        })
        .collect()
}
