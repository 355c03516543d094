//! Length masks and packed variable-length recurrence.
//!
//! Batches are padded to their longest sample. [`dynamic_sequence`] runs a
//! [`BiLstm`] over a time-major batch so that padded timesteps never touch a
//! sample's state:
//!
//! ```text
//! lengths        [2, 4, 1]
//! sort desc  →   [4, 2, 1]   perm = [1, 0, 2]
//! batch_sizes    t=0:3  t=1:2  t=2:1  t=3:1
//! ```
//!
//! After sorting, the samples still valid at timestep `t` are a prefix of the
//! batch, so each step only advances the first `batch_sizes[t]` rows. Outputs
//! and final states are permuted back to input order at the end.

use candle_core::{D, DType, Device, Tensor};

use candle_nn::rnn::{LSTM, LSTMState, RNN};

use super::lstm::BiLstm;
use crate::{Error, Result};

/// `[n, t]` matrix with row `i` set to 1 for its first `lengths[i]` columns.
pub fn length_mask(shape: (usize, usize), lengths: &[usize], device: &Device) -> Result<Tensor> {
    let (rows, cols) = shape;
    if lengths.len() != rows {
        return Err(Error::Shape(format!(
            "length_mask: {} lengths for {rows} rows",
            lengths.len()
        )));
    }
    let mut data = vec![0f32; rows * cols];
    for (i, &len) in lengths.iter().enumerate() {
        if len > cols {
            return Err(Error::Shape(format!(
                "length_mask: length {len} exceeds {cols} columns"
            )));
        }
        data[i * cols..i * cols + len].fill(1.0);
    }
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// Permute `tensor` along `axis` so that output slice `k` is input slice
/// `index[k]`. `index` must be a permutation of the axis.
pub fn advanced_index(tensor: &Tensor, axis: usize, index: &[usize]) -> Result<Tensor> {
    let size = tensor.dim(axis)?;
    if index.len() != size {
        return Err(Error::Shape(format!(
            "advanced_index: {} indices for axis {axis} of size {size}",
            index.len()
        )));
    }
    let mut seen = vec![false; size];
    for &i in index {
        if i >= size || seen[i] {
            return Err(Error::Shape(format!(
                "advanced_index: {index:?} is not a permutation of 0..{size}"
            )));
        }
        seen[i] = true;
    }
    let ids: Vec<u32> = index.iter().map(|&i| i as u32).collect();
    let ids = Tensor::from_vec(ids, size, tensor.device())?;
    Ok(tensor.index_select(&ids, axis)?)
}

/// Stable length-descending order and its inverse.
pub fn sort_by_length_desc(lengths: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..lengths.len()).collect();
    order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
    let mut inverse = vec![0; order.len()];
    for (pos, &idx) in order.iter().enumerate() {
        inverse[idx] = pos;
    }
    (order, inverse)
}

/// Output of [`dynamic_sequence`].
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    /// `[T, B, 2H]`, zero at padded timesteps.
    pub output: Tensor,
    /// Final hidden states `[layers * 2, B, H]` ordered `l0 fwd, l0 bwd, l1 fwd, ...`.
    pub h: Tensor,
    /// Final cell states, same layout as `h`.
    pub c: Tensor,
}

impl SequenceOutput {
    /// Concatenated forward/backward final hidden state of the top layer, `[B, 2H]`.
    pub fn last_layer_hidden(&self) -> Result<Tensor> {
        let directions = self.h.dim(0)?;
        let top = self.h.narrow(0, directions - 2, 2)?;
        let (_, batch, hidden) = top.dims3()?;
        Ok(top.transpose(0, 1)?.contiguous()?.reshape((batch, 2 * hidden))?)
    }
}

/// Run `rnn` over a padded time-major batch `seq` of shape `[T, B, F]`.
///
/// `initial_state`, when given, is `(h0, c0)` each `[layers * 2, B, H]` in
/// input order; zeros otherwise. The result is in input order regardless of
/// the internal sort, and each sample's final state reflects exactly its own
/// `lengths[i]` steps in each direction.
pub fn dynamic_sequence(
    rnn: &BiLstm,
    seq: &Tensor,
    lengths: &[usize],
    initial_state: Option<(&Tensor, &Tensor)>,
) -> Result<SequenceOutput> {
    let (max_steps, batch, _features) = seq.dims3()?;
    if lengths.len() != batch {
        return Err(Error::Shape(format!(
            "dynamic_sequence: {} lengths for batch of {batch}",
            lengths.len()
        )));
    }
    if let Some(&too_long) = lengths.iter().find(|&&l| l > max_steps) {
        return Err(Error::Shape(format!(
            "dynamic_sequence: length {too_long} exceeds {max_steps} timesteps"
        )));
    }
    let hidden = rnn.hidden_size();
    let directions = 2 * rnn.num_layers();
    if let Some((h0, c0)) = initial_state {
        let expected = [directions, batch, hidden];
        if h0.dims() != expected || c0.dims() != expected {
            return Err(Error::Shape(format!(
                "dynamic_sequence: initial state {:?}/{:?}, expected {expected:?}",
                h0.dims(),
                c0.dims()
            )));
        }
    }

    let (order, inverse) = sort_by_length_desc(lengths);
    let sorted_lengths: Vec<usize> = order.iter().map(|&i| lengths[i]).collect();
    let batch_sizes: Vec<usize> = (0..max_steps)
        .map(|t| sorted_lengths.iter().filter(|&&l| l > t).count())
        .collect();

    let mut input = advanced_index(seq, 1, &order)?;
    let initial = match initial_state {
        Some((h0, c0)) => Some((advanced_index(h0, 1, &order)?, advanced_index(c0, 1, &order)?)),
        None => None,
    };

    let mut final_h = Vec::with_capacity(directions);
    let mut final_c = Vec::with_capacity(directions);
    for layer in 0..rnn.num_layers() {
        let (fwd, bwd) = rnn.layer(layer);
        let mut outputs = Vec::with_capacity(2);
        for (dir, cell) in [fwd, bwd].into_iter().enumerate() {
            let state = match &initial {
                Some((h0, c0)) => LSTMState {
                    h: h0.get(2 * layer + dir)?,
                    c: c0.get(2 * layer + dir)?,
                },
                None => cell.zero_state(batch)?,
            };
            let reverse = dir == 1;
            let (out, state) = run_packed(cell, hidden, &input, &batch_sizes, state, reverse)?;
            outputs.push(out);
            final_h.push(state.h);
            final_c.push(state.c);
        }
        input = Tensor::cat(&outputs, D::Minus1)?;
    }

    Ok(SequenceOutput {
        output: advanced_index(&input, 1, &inverse)?,
        h: advanced_index(&Tensor::stack(&final_h, 0)?, 1, &inverse)?,
        c: advanced_index(&Tensor::stack(&final_c, 0)?, 1, &inverse)?,
    })
}

/// One direction of one layer over a length-sorted batch.
fn run_packed(
    cell: &LSTM,
    hidden: usize,
    input: &Tensor,
    batch_sizes: &[usize],
    mut state: LSTMState,
    reverse: bool,
) -> Result<(Tensor, LSTMState)> {
    let (max_steps, batch, _) = input.dims3()?;
    let dtype: DType = input.dtype();
    let device = input.device();

    let mut outputs: Vec<Option<Tensor>> = vec![None; max_steps];
    let steps: Vec<usize> = if reverse {
        (0..max_steps).rev().collect()
    } else {
        (0..max_steps).collect()
    };
    for t in steps {
        let active = batch_sizes[t];
        if active == 0 {
            outputs[t] = Some(Tensor::zeros((batch, hidden), dtype, device)?);
            continue;
        }
        let x_t = input.get(t)?.narrow(0, 0, active)?;
        let head = LSTMState {
            h: state.h.narrow(0, 0, active)?,
            c: state.c.narrow(0, 0, active)?,
        };
        let next = cell.step(&x_t, &head)?;
        if active == batch {
            outputs[t] = Some(next.h.clone());
            state = next;
        } else {
            let rest = batch - active;
            let pad = Tensor::zeros((rest, hidden), dtype, device)?;
            outputs[t] = Some(Tensor::cat(&[&next.h, &pad], 0)?);
            state = LSTMState {
                h: Tensor::cat(&[&next.h, &state.h.narrow(0, active, rest)?], 0)?,
                c: Tensor::cat(&[&next.c, &state.c.narrow(0, active, rest)?], 0)?,
            };
        }
    }
    let outputs: Vec<Tensor> = outputs.into_iter().flatten().collect();
    Ok((Tensor::stack(&outputs, 0)?, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{VarBuilder, VarMap};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn mask_rows_are_contiguous_prefixes() {
        let lengths = [3, 0, 5, 1];
        let mask = length_mask((4, 5), &lengths, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        for (row, &len) in rows.iter().zip(lengths.iter()) {
            let sum: f32 = row.iter().sum();
            assert_eq!(sum as usize, len);
            assert!(row[..len].iter().all(|&v| v == 1.0));
            assert!(row[len..].iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn mask_rejects_overlong_length() {
        assert!(matches!(
            length_mask((2, 3), &[1, 4], &Device::Cpu),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn advanced_index_permutes_non_leading_axis() {
        let dev = Device::Cpu;
        let t = Tensor::arange(0f32, 12.0, &dev)
            .unwrap()
            .reshape((2, 3, 2))
            .unwrap();
        let p = advanced_index(&t, 1, &[2, 0, 1]).unwrap();
        let v: Vec<Vec<Vec<f32>>> = p.to_vec3().unwrap();
        assert_eq!(v[0], vec![vec![4.0, 5.0], vec![0.0, 1.0], vec![2.0, 3.0]]);
        assert_eq!(v[1][0], vec![10.0, 11.0]);
        // Inverse permutation restores the input exactly.
        let back = advanced_index(&p, 1, &[1, 2, 0]).unwrap();
        assert_eq!(max_abs_diff(&back, &t), 0.0);
    }

    #[test]
    fn advanced_index_rejects_non_permutation() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(advanced_index(&t, 1, &[0, 0, 1]).is_err());
        assert!(advanced_index(&t, 1, &[0, 1]).is_err());
    }

    #[test]
    fn sort_is_stable_and_inverse_roundtrips() {
        let (order, inverse) = sort_by_length_desc(&[2, 4, 2, 5]);
        assert_eq!(order, vec![3, 1, 0, 2]);
        for (pos, &idx) in order.iter().enumerate() {
            assert_eq!(inverse[idx], pos);
        }
    }

    fn small_rnn(varmap: &VarMap) -> BiLstm {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        BiLstm::new(3, 4, 2, vb).unwrap()
    }

    #[test]
    fn output_shapes_and_zero_padding() {
        let varmap = VarMap::new();
        let rnn = small_rnn(&varmap);
        let seq = Tensor::randn(0f32, 1.0, (5, 3, 3), &Device::Cpu).unwrap();
        let out = dynamic_sequence(&rnn, &seq, &[2, 5, 1], None).unwrap();
        assert_eq!(out.output.dims(), &[5, 3, 8]);
        assert_eq!(out.h.dims(), &[4, 3, 4]);
        assert_eq!(out.last_layer_hidden().unwrap().dims(), &[3, 8]);
        // Sample 0 has length 2: timesteps 2.. must be zero.
        let padded = out.output.narrow(0, 2, 3).unwrap().get_on_dim(1, 0).unwrap();
        let total: f32 = padded.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn padding_values_do_not_leak_into_state() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let rnn = small_rnn(&varmap);
        let lengths = [2, 4];
        let seq = Tensor::randn(0f32, 1.0, (4, 2, 3), &dev).unwrap();
        // Overwrite sample 0's padded timesteps with garbage.
        let garbage = Tensor::full(100f32, (2, 1, 3), &dev).unwrap();
        let noisy = Tensor::cat(
            &[
                &Tensor::cat(&[&seq.narrow(0, 0, 2).unwrap().narrow(1, 0, 1).unwrap(), &garbage], 0)
                    .unwrap(),
                &seq.narrow(1, 1, 1).unwrap(),
            ],
            1,
        )
        .unwrap();
        let a = dynamic_sequence(&rnn, &seq, &lengths, None).unwrap();
        let b = dynamic_sequence(&rnn, &noisy, &lengths, None).unwrap();
        assert!(max_abs_diff(&a.h, &b.h) < 1e-6);
        assert!(max_abs_diff(&a.output, &b.output) < 1e-6);
    }

    #[test]
    fn final_state_matches_unpadded_run() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let rnn = small_rnn(&varmap);
        let seq = Tensor::randn(0f32, 1.0, (6, 2, 3), &dev).unwrap();
        let batched = dynamic_sequence(&rnn, &seq, &[3, 6], None).unwrap();
        let alone_seq = seq.narrow(0, 0, 3).unwrap().narrow(1, 0, 1).unwrap();
        let alone = dynamic_sequence(&rnn, &alone_seq, &[3], None).unwrap();
        let batched_h0 = batched.h.narrow(1, 0, 1).unwrap();
        assert!(max_abs_diff(&batched_h0, &alone.h) < 1e-5);
    }

    #[test]
    fn output_order_invariant_to_input_permutation() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let rnn = small_rnn(&varmap);
        let lengths = [1, 4, 3, 4];
        let seq = Tensor::randn(0f32, 1.0, (4, 4, 3), &dev).unwrap();
        let perm = [2, 0, 3, 1];
        let permuted_seq = advanced_index(&seq, 1, &perm).unwrap();
        let permuted_lengths: Vec<usize> = perm.iter().map(|&i| lengths[i]).collect();

        let base = dynamic_sequence(&rnn, &seq, &lengths, None).unwrap();
        let permuted = dynamic_sequence(&rnn, &permuted_seq, &permuted_lengths, None).unwrap();

        let expected_out = advanced_index(&base.output, 1, &perm).unwrap();
        let expected_h = advanced_index(&base.h, 1, &perm).unwrap();
        assert!(max_abs_diff(&expected_out, &permuted.output) < 1e-5);
        assert!(max_abs_diff(&expected_h, &permuted.h) < 1e-5);
    }

    #[test]
    fn rejects_wrong_initial_state_shape() {
        let varmap = VarMap::new();
        let rnn = small_rnn(&varmap);
        let seq = Tensor::zeros((2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let bad = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let result = dynamic_sequence(&rnn, &seq, &[2, 1], Some((&bad, &bad)));
        assert!(matches!(result, Err(Error::Shape(_))));
    }
}
