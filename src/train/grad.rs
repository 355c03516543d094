//! Gradient health, clipping and accumulation over a parameter group.
//!
//! A gradient store from `backward()` holds entries for every tensor in the
//! graph; the functions here only look at the `vars` of the group being
//! updated.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use tracing::{error, warn};

use crate::{Error, Phase, Result};

/// Outcome of [`GradientHealth::check`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientHealth {
    Healthy,
    /// Some gradient entry is NaN or infinite.
    NonFinite { var: usize },
    /// Some gradient entry exceeds the magnitude limit.
    TooLarge { var: usize, value: f32 },
}

impl GradientHealth {
    /// Scan every gradient of `vars`; missing gradients count as healthy.
    pub fn check(vars: &[Var], grads: &GradStore, limit: f32) -> Result<Self> {
        for (idx, var) in vars.iter().enumerate() {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let values: Vec<f32> = g.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
            for v in values {
                if !v.is_finite() {
                    return Ok(GradientHealth::NonFinite { var: idx });
                }
                if v.abs() > limit {
                    return Ok(GradientHealth::TooLarge { var: idx, value: v });
                }
            }
        }
        Ok(GradientHealth::Healthy)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, GradientHealth::Healthy)
    }
}

/// L2 norm over all gradients of `vars`.
pub fn global_norm(vars: &[Var], grads: &GradStore) -> Result<f32> {
    let mut sum = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sum.sqrt() as f32)
}

/// Rescale gradients so their global norm is at most `ceiling`. A ceiling of
/// 0 disables clipping. Returns the norm before clipping.
pub fn clip_global_norm(vars: &[Var], grads: &mut GradStore, ceiling: f64) -> Result<f32> {
    let norm = global_norm(vars, grads)?;
    if ceiling > 0.0 && norm as f64 > ceiling {
        let scale = ceiling / norm as f64;
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled = (g * scale)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}

/// Add the gradients of `vars` found in `from` into `into`.
pub fn accumulate(into: &mut GradStore, from: &GradStore, vars: &[Var]) -> Result<()> {
    for var in vars {
        let Some(g) = from.get(var.as_tensor()) else {
            continue;
        };
        let sum = match into.get(var.as_tensor()) {
            Some(existing) => (existing + g)?,
            None => g.clone(),
        };
        into.insert(var.as_tensor(), sum);
    }
    Ok(())
}

/// Consecutive and cumulative gradient failures of one phase.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    phase: Phase,
    max_consecutive: usize,
    consecutive: usize,
    total: usize,
}

impl HealthTracker {
    pub fn new(phase: Phase, max_consecutive: usize) -> Self {
        Self {
            phase,
            max_consecutive: max_consecutive.max(1),
            consecutive: 0,
            total: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Count a skipped step. Fails once the consecutive limit is reached.
    pub fn record_failure(&mut self, health: GradientHealth) -> Result<()> {
        self.consecutive += 1;
        self.total += 1;
        if self.consecutive >= self.max_consecutive {
            error!(
                phase = %self.phase,
                consecutive = self.consecutive,
                total = self.total,
                ?health,
                "gradient divergence, aborting"
            );
            return Err(Error::GradientDivergence {
                phase: self.phase,
                consecutive: self.consecutive,
                total: self.total,
            });
        }
        warn!(
            phase = %self.phase,
            total = self.total,
            ?health,
            "gradient exploded, skipping step"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    /// Gradient store where `d loss / d var_i = g_i`.
    fn grads_for(values: &[&[f32]]) -> (Vec<Var>, GradStore) {
        let dev = Device::Cpu;
        let vars: Vec<Var> = values
            .iter()
            .map(|v| Var::new(&vec![0f32; v.len()][..], &dev).unwrap())
            .collect();
        let mut loss = Tensor::new(0f32, &dev).unwrap();
        for (var, v) in vars.iter().zip(values.iter()) {
            let coeff = Tensor::new(*v, &dev).unwrap();
            loss = (loss + (var.as_tensor() * coeff).unwrap().sum_all().unwrap()).unwrap();
        }
        let grads = loss.backward().unwrap();
        (vars, grads)
    }

    #[test]
    fn nan_gradient_is_unhealthy() {
        let (vars, grads) = grads_for(&[&[0.1, 0.2], &[0.3, f32::NAN, 0.0]]);
        let health = GradientHealth::check(&vars, &grads, 1e5).unwrap();
        assert_eq!(health, GradientHealth::NonFinite { var: 1 });
        assert!(!health.is_healthy());
    }

    #[test]
    fn small_finite_gradients_are_healthy() {
        let (vars, grads) = grads_for(&[&[0.1, -0.2], &[3.0]]);
        assert!(GradientHealth::check(&vars, &grads, 1e5).unwrap().is_healthy());
    }

    #[test]
    fn oversized_gradient_is_unhealthy() {
        let (vars, grads) = grads_for(&[&[2e5]]);
        assert!(matches!(
            GradientHealth::check(&vars, &grads, 1e5).unwrap(),
            GradientHealth::TooLarge { var: 0, .. }
        ));
    }

    #[test]
    fn clipping_rescales_to_ceiling() {
        let (vars, mut grads) = grads_for(&[&[3.0], &[4.0]]);
        let before = clip_global_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-5);
        assert!((global_norm(&vars, &grads).unwrap() - 1.0).abs() < 1e-5);

        let (vars, mut grads) = grads_for(&[&[3.0], &[4.0]]);
        clip_global_norm(&vars, &mut grads, 0.0).unwrap();
        assert!((global_norm(&vars, &grads).unwrap() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn accumulate_sums_per_var() {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, 1.0], &dev).unwrap();
        let a = (w.as_tensor() * 2.0).unwrap().sum_all().unwrap();
        let b = (w.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let mut ga = a.backward().unwrap();
        let gb = b.backward().unwrap();
        accumulate(&mut ga, &gb, std::slice::from_ref(&w)).unwrap();
        let g: Vec<f32> = ga.get(w.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![5.0, 5.0]);
    }

    #[test]
    fn tracker_fails_on_second_consecutive_failure() {
        let mut tracker = HealthTracker::new(Phase::Discriminator, 2);
        let bad = GradientHealth::NonFinite { var: 0 };
        tracker.record_failure(bad).unwrap();
        tracker.record_success();
        tracker.record_failure(bad).unwrap();
        assert_eq!(tracker.total(), 2);
        let err = tracker.record_failure(bad).unwrap_err();
        assert!(matches!(
            err,
            Error::GradientDivergence {
                phase: Phase::Discriminator,
                consecutive: 2,
                total: 3
            }
        ));
    }
}
