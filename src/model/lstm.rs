//! LSTM stacks built from candle's `rnn::LSTM` cells.
//!
//! Parameters use the `weight_ih_l{k}` / `weight_hh_l{k}` naming, with a
//! `_reverse` suffix for the backward direction of a bidirectional layer.
//! Input weights are xavier-uniform, recurrent weights uniform in
//! `±1/sqrt(H)`, biases zero.

use candle_core::{Result, Tensor};
use candle_nn::rnn::{Direction, LSTM, LSTMConfig, LSTMState, RNN};
use candle_nn::{Init, VarBuilder};

use super::layers::xavier_bound;

fn cell(
    input_size: usize,
    hidden_size: usize,
    layer_idx: usize,
    direction: Direction,
    vb: VarBuilder,
) -> Result<LSTM> {
    let ih = xavier_bound(input_size, 4 * hidden_size);
    let hh = 1.0 / (hidden_size as f64).sqrt();
    let config = LSTMConfig {
        w_ih_init: Init::Uniform { lo: -ih, up: ih },
        w_hh_init: Init::Uniform { lo: -hh, up: hh },
        b_ih_init: Some(Init::Const(0.0)),
        b_hh_init: Some(Init::Const(0.0)),
        layer_idx,
        direction,
    };
    candle_nn::rnn::lstm(input_size, hidden_size, config, vb)
}

/// Deep unidirectional stack where each layer's output feeds the next.
#[derive(Debug, Clone)]
pub struct LstmStack {
    cells: Vec<LSTM>,
}

impl LstmStack {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cells = (0..num_layers)
            .map(|layer| {
                let in_dim = if layer == 0 { input_size } else { hidden_size };
                cell(in_dim, hidden_size, layer, Direction::Forward, vb.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { cells })
    }

    pub fn zero_state(&self, batch: usize) -> Result<Vec<LSTMState>> {
        self.cells.iter().map(|cell| cell.zero_state(batch)).collect()
    }

    /// Advance every layer by one step; returns the top layer's hidden state.
    pub fn step(&self, x: &Tensor, states: &mut [LSTMState]) -> Result<Tensor> {
        let mut input = x.clone();
        for (cell, state) in self.cells.iter().zip(states.iter_mut()) {
            *state = cell.step(&input, state)?;
            input = state.h.clone();
        }
        Ok(input)
    }
}

/// Bidirectional multi-layer LSTM.
///
/// Layer `l > 0` consumes the concatenated forward/backward outputs of layer
/// `l - 1`. Driven by [`super::sequence::dynamic_sequence`].
#[derive(Debug, Clone)]
pub struct BiLstm {
    layers: Vec<(LSTM, LSTM)>,
    hidden_size: usize,
}

impl BiLstm {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let in_dim = if layer == 0 {
                input_size
            } else {
                2 * hidden_size
            };
            let fwd = cell(in_dim, hidden_size, layer, Direction::Forward, vb.clone())?;
            let bwd = cell(in_dim, hidden_size, layer, Direction::Backward, vb.clone())?;
            layers.push((fwd, bwd));
        }
        Ok(Self {
            layers,
            hidden_size,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Hidden size of a single direction.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn layer(&self, idx: usize) -> &(LSTM, LSTM) {
        &self.layers[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn stack_feeds_layers_in_sequence() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let stack = LstmStack::new(6, 4, 3, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 6), &dev).unwrap();
        let mut states = stack.zero_state(2).unwrap();
        let top = stack.step(&x, &mut states).unwrap();
        assert_eq!(top.dims(), &[2, 4]);
        assert_eq!(states.len(), 3);
        let h: Vec<f32> = top.flatten_all().unwrap().to_vec1().unwrap();
        assert!(h.iter().all(|v| v.abs() < 1.0));
        // 4 tensors per cell
        assert_eq!(varmap.all_vars().len(), 12);
    }

    #[test]
    fn bilstm_builds_both_directions() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let rnn = BiLstm::new(7, 5, 2, vb).unwrap();
        assert_eq!(rnn.num_layers(), 2);
        assert_eq!(rnn.hidden_size(), 5);
        assert_eq!(varmap.all_vars().len(), 16);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["weight_ih_l0"].dims(), &[20, 7]);
        assert_eq!(data["weight_ih_l1_reverse"].dims(), &[20, 10]);
        let bias: Vec<f32> = data["bias_hh_l1"].as_tensor().to_vec1().unwrap();
        assert!(bias.iter().all(|v| *v == 0.0));
        let bound = 1.0 / 5f32.sqrt();
        let hh: Vec<f32> = data["weight_hh_l0_reverse"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(hh.iter().all(|v| v.abs() <= bound));
    }
}
