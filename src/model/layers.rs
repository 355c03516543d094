//! Small building blocks shared by the generator, critic and embedder.
//!
//! Weights are xavier-uniform, biases start at zero.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Negative slope of every LeakyReLU in the models.
pub const LEAKY_SLOPE: f64 = 0.01;

/// Xavier-uniform bound for a `fan_in x fan_out` weight.
pub fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Linear layer with xavier-uniform weight and zero bias.
pub fn xavier_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let bound = xavier_bound(in_dim, out_dim);
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Two-layer head: `Linear -> LeakyReLU -> Linear`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    hidden: Linear,
    output: Linear,
}

impl FeedForward {
    pub fn new(in_dim: usize, hidden_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: xavier_linear(in_dim, hidden_dim, vb.pp("0"))?,
            output: xavier_linear(hidden_dim, out_dim, vb.pp("2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = candle_nn::ops::leaky_relu(&self.hidden.forward(xs)?, LEAKY_SLOPE)?;
        self.output.forward(&h)
    }
}
