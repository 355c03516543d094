//! RMSprop.
//!
//! ```text
//! v ← α·v + (1 - α)·g²
//! p ← p - lr · g / (√v + ε)
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub alpha: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            alpha: 0.99,
            eps: 1e-8,
        }
    }
}

#[derive(Debug)]
struct VarRmsProp {
    var: Var,
    square_avg: Var,
}

#[derive(Debug)]
pub struct RmsProp {
    vars: Vec<VarRmsProp>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let square_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarRmsProp { var, square_avg })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsRmsProp { lr, alpha, eps } = self.params;
        for state in self.vars.iter() {
            let Some(g) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let square_avg = ((state.square_avg.as_tensor() * alpha)? + (g.sqr()? * (1.0 - alpha))?)?;
            let update = (g / (square_avg.sqrt()? + eps)?)?;
            state.var.set(&state.var.as_tensor().sub(&(update * lr)?)?)?;
            state.square_avg.set(&square_avg)?;
        }
        Ok(())
    }
}
