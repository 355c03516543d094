//! Exponential moving average of generator rewards.

use serde::{Deserialize, Serialize};

/// Running reward mean used as the REINFORCE baseline.
///
/// The first update sets the mean exactly. Afterwards the old value keeps
/// weight `fast_decay` while `iteration < warmup`, then `slow_decay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBaseline {
    value: Option<f32>,
    warmup: usize,
    fast_decay: f32,
    slow_decay: f32,
}

impl RewardBaseline {
    pub fn new(warmup: usize, fast_decay: f32, slow_decay: f32) -> Self {
        Self {
            value: None,
            warmup,
            fast_decay,
            slow_decay,
        }
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    /// Fold in the mean reward of one batch observed at `iteration`.
    pub fn update(&mut self, batch_mean: f32, iteration: usize) -> f32 {
        let decay = if iteration < self.warmup {
            self.fast_decay
        } else {
            self.slow_decay
        };
        let next = match self.value {
            None => batch_mean,
            Some(old) => old * decay + batch_mean * (1.0 - decay),
        };
        self.value = Some(next);
        next
    }
}
