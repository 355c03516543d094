//! Loss terms and numerically stable log-probability helpers.
//!
//! Everything here is differentiable through candle's autograd except
//! [`length_penalty`] and [`masked_accuracy`], which are host-side statistics
//! used for rewards and monitoring.

use candle_core::{D, Tensor};

use crate::{Error, Result};

/// `ln(1 + e^x)` without overflow: `max(x, 0) + ln(1 + e^-|x|)`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let pos = xs.relu()?;
    let abs = (&pos + xs.neg()?.relu()?)?;
    let tail = (abs.neg()?.exp()? + 1.0)?.log()?;
    Ok((pos + tail)?)
}

/// `ln σ(x) = -softplus(-x)`.
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    Ok(softplus(&xs.neg()?)?.neg()?)
}

/// `ln(1 - σ(x)) = -x - softplus(-x)`.
pub fn log_one_minus_sigmoid(xs: &Tensor) -> Result<Tensor> {
    Ok((xs.neg()? - softplus(&xs.neg()?)?)?)
}

/// Binary cross-entropy with logits, summed over dimension 1.
///
/// `input` and `target` are `[N, T]`; the optional `weight` masks elements
/// (usually a [`crate::model::sequence::length_mask`]). Returns `[N]`.
pub fn binary_cross_entropy_with_logits_per_sample(
    input: &Tensor,
    target: &Tensor,
    weight: Option<&Tensor>,
) -> Result<Tensor> {
    if input.dims() != target.dims() {
        return Err(Error::Shape(format!(
            "target size {:?} must match input size {:?}",
            target.dims(),
            input.dims()
        )));
    }
    if let Some(w) = weight {
        if w.dims() != input.dims() {
            return Err(Error::Shape(format!(
                "weight size {:?} must match input size {:?}",
                w.dims(),
                input.dims()
            )));
        }
    }
    // x - x*t + m + ln(e^-m + e^(-x-m)), m = max(-x, 0)
    let max_val = input.neg()?.relu()?;
    let log_term = (max_val.neg()?.exp()? + (input.neg()? - &max_val)?.exp()?)?.log()?;
    let mut loss = (((input - (input * target)?)? + max_val)? + log_term)?;
    if let Some(w) = weight {
        loss = (loss * w)?;
    }
    Ok(loss.sum(1)?)
}

/// Margin-1 hinge pushing the matched ranking `own` above two mismatched ones.
pub fn ranking_hinge(own: &Tensor, mismatched_a: &Tensor, mismatched_b: &Tensor) -> Result<Tensor> {
    let a = ((mismatched_a - own)? + 1.0)?.relu()?;
    let b = ((mismatched_b - own)? + 1.0)?.relu()?;
    Ok((a + b)?.mean_all()?)
}

/// Mean and unbiased standard deviation of `values` `[N, T, F]` over the frames
/// selected by `mask` `[N, T]`. Both results are scalar tensors.
pub fn masked_moments(values: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let (n, t, f) = values.dims3()?;
    if mask.dims() != [n, t] {
        return Err(Error::Shape(format!(
            "mask size {:?} must be [{n}, {t}]",
            mask.dims()
        )));
    }
    let mask = mask.unsqueeze(D::Minus1)?;
    let count = mask.sum_all()?.to_scalar::<f32>()? as f64 * f as f64;
    if count < 2.0 {
        return Err(Error::Shape(format!(
            "masked_moments needs at least two valid entries, got {count}"
        )));
    }
    let mean = (values.broadcast_mul(&mask)?.sum_all()? / count)?;
    let centered = values.broadcast_sub(&mean)?.broadcast_mul(&mask)?;
    let var = (centered.sqr()?.sum_all()? / (count - 1.0))?;
    // sqrt has an infinite slope at 0
    let std = (var + 1e-12)?.sqrt()?;
    Ok((mean, std))
}

/// Host-side mean and unbiased standard deviation of integer lengths.
pub fn length_moments(lengths: &[usize]) -> (f32, f32) {
    let n = lengths.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = lengths.iter().sum::<usize>() as f32 / n as f32;
    if n == 1 {
        return (mean, 0.0);
    }
    let var = lengths
        .iter()
        .map(|&l| (l as f32 - mean).powi(2))
        .sum::<f32>()
        / (n - 1) as f32;
    (mean, var.sqrt())
}

/// `(|Δmean| + |Δstd|) * scale` between fake and real length distributions.
pub fn length_penalty(fake: &[usize], real: &[usize], scale: f64) -> f32 {
    let (fake_mean, fake_std) = length_moments(fake);
    let (real_mean, real_std) = length_moments(real);
    ((fake_mean - real_mean).abs() + (fake_std - real_std).abs()) * scale as f32
}

/// Fraction of valid frames classified as real (`positive`) or fake.
pub fn masked_accuracy(logits: &Tensor, mask: &Tensor, positive: bool) -> Result<f32> {
    let logits: Vec<Vec<f32>> = logits.to_vec2()?;
    let mask: Vec<Vec<f32>> = mask.to_vec2()?;
    let mut correct = 0.0f32;
    let mut total = 0.0f32;
    for (row, mask_row) in logits.iter().zip(mask.iter()) {
        for (&logit, &m) in row.iter().zip(mask_row.iter()) {
            let hit = if positive { logit > 0.0 } else { logit < 0.0 };
            if hit {
                correct += m;
            }
            total += m;
        }
    }
    Ok(if total > 0.0 { correct / total } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    fn vec1(t: &Tensor) -> Vec<f32> {
        t.to_vec1().unwrap()
    }

    #[test]
    fn bce_at_zero_logit_is_ln2_per_element() {
        let dev = Device::Cpu;
        let input = Tensor::zeros((2, 3), DType::F32, &dev).unwrap();
        let target = Tensor::full(0.9f32, (2, 3), &dev).unwrap();
        let weight = Tensor::new(&[[1f32, 1.0, 1.0], [1.0, 0.0, 0.0]], &dev).unwrap();
        let loss = binary_cross_entropy_with_logits_per_sample(&input, &target, Some(&weight))
            .unwrap();
        let v = vec1(&loss);
        let ln2 = std::f32::consts::LN_2;
        assert!((v[0] - 3.0 * ln2).abs() < 1e-5);
        assert!((v[1] - ln2).abs() < 1e-5);
    }

    #[test]
    fn bce_is_finite_for_extreme_logits() {
        let dev = Device::Cpu;
        let input = Tensor::new(&[[1e4f32, -1e4], [-1e4, 1e4]], &dev).unwrap();
        for t in [0f32, 0.5, 1.0] {
            let target = Tensor::full(t, (2, 2), &dev).unwrap();
            let loss = binary_cross_entropy_with_logits_per_sample(&input, &target, None).unwrap();
            assert!(vec1(&loss).iter().all(|v| v.is_finite()), "target {t}");
        }
        // Confident and correct: near-zero loss.
        let target = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &dev).unwrap();
        let loss = binary_cross_entropy_with_logits_per_sample(&input, &target, None).unwrap();
        assert!(vec1(&loss).iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn bce_gradient_is_finite_for_extreme_logits() {
        let dev = Device::Cpu;
        let x = Var::from_tensor(&Tensor::new(&[[1e4f32, -1e4, 0.0]], &dev).unwrap()).unwrap();
        let target = Tensor::full(0.5f32, (1, 3), &dev).unwrap();
        let loss = binary_cross_entropy_with_logits_per_sample(x.as_tensor(), &target, None)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(x.as_tensor()).unwrap().flatten_all().unwrap();
        let g = vec1(&g);
        assert!(g.iter().all(|v| v.is_finite()));
        // d/dx = σ(x) - t
        assert!((g[0] - 0.5).abs() < 1e-4);
        assert!((g[1] + 0.5).abs() < 1e-4);
        assert!(g[2].abs() < 1e-4);
    }

    #[test]
    fn bce_rejects_shape_mismatch() {
        let dev = Device::Cpu;
        let input = Tensor::zeros((2, 3), DType::F32, &dev).unwrap();
        let target = Tensor::zeros((2, 4), DType::F32, &dev).unwrap();
        let result = binary_cross_entropy_with_logits_per_sample(&input, &target, None);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn log_sigmoid_pair_is_stable_and_normalised() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-1e4f32, -3.0, 0.0, 3.0, 1e4], &dev).unwrap();
        let ls = vec1(&log_sigmoid(&x).unwrap());
        let l1 = vec1(&log_one_minus_sigmoid(&x).unwrap());
        for (a, b) in ls.iter().zip(l1.iter()) {
            assert!(a.is_finite() && b.is_finite());
            assert!((a.exp() + b.exp() - 1.0).abs() < 1e-5);
        }
        assert!((ls[2] + std::f32::consts::LN_2).abs() < 1e-6);
        assert!((ls[0] + 1e4).abs() < 1.0);
    }

    #[test]
    fn ranking_hinge_zero_when_margin_met() {
        let dev = Device::Cpu;
        let own = Tensor::new(&[1f32, 1.0], &dev).unwrap();
        let bad = Tensor::new(&[-0.5f32, -1.0], &dev).unwrap();
        let loss: f32 = ranking_hinge(&own, &bad, &bad).unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);

        let tied = Tensor::new(&[1f32, 1.0], &dev).unwrap();
        let loss: f32 = ranking_hinge(&own, &tied, &bad).unwrap().to_scalar().unwrap();
        assert!((loss - 1.0).abs() < 1e-6);
    }

    #[test]
    fn masked_moments_ignore_padding() {
        let dev = Device::Cpu;
        // Sample 0: frames [1, 3]; sample 1: frame [5] then padding 100.
        let values = Tensor::new(&[[[1f32], [3.0]], [[5.0], [100.0]]], &dev).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0], [1.0, 0.0]], &dev).unwrap();
        let (mean, std) = masked_moments(&values, &mask).unwrap();
        let mean: f32 = mean.to_scalar().unwrap();
        let std: f32 = std.to_scalar().unwrap();
        assert!((mean - 3.0).abs() < 1e-5);
        assert!((std - 2.0).abs() < 1e-4);
    }

    #[test]
    fn length_penalty_matches_hand_computation() {
        // fake: mean 2, std 0; real: mean 4, std 2 -> (2 + 2) / 3
        let p = length_penalty(&[2, 2, 2], &[2, 4, 6], 1.0 / 3.0);
        assert!((p - 4.0 / 3.0).abs() < 1e-5);
        assert_eq!(length_penalty(&[3, 5], &[3, 5], 1.0), 0.0);
    }

    #[test]
    fn accuracy_counts_only_valid_frames() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[1f32, -1.0, 5.0], [2.0, 2.0, -9.0]], &dev).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0], [1.0, 1.0, 1.0]], &dev).unwrap();
        let real = masked_accuracy(&logits, &mask, true).unwrap();
        assert!((real - 0.6).abs() < 1e-6);
        let fake = masked_accuracy(&logits, &mask, false).unwrap();
        assert!((fake - 0.4).abs() < 1e-6);
    }
}
