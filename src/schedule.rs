//! Learning-rate schedule: linear warmup, cosine decay, constant floor
//!
//! ```text
//! lr
//!  │      ╭──╮
//!  │     ╱    ╲___
//!  │    ╱         ╲___
//!  │   ╱              ╲______________  min_lr
//!  └──┴──────────────┴──────────────── step
//!     warmup        max_steps
//! ```

use crate::error::{GptError, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LrSchedule {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub max_steps: usize,
}

impl LrSchedule {
    /// Fails unless `warmup_steps < max_steps`, which keeps the decay ratio in `[0, 1]`
    pub fn new(max_lr: f32, min_lr: f32, warmup_steps: usize, max_steps: usize) -> Result<Self> {
        if warmup_steps >= max_steps {
            return Err(GptError::Config(format!(
                "warmup_steps ({}) must be smaller than max_steps ({})",
                warmup_steps, max_steps
            )));
        }
        Ok(Self {
            max_lr,
            min_lr,
            warmup_steps,
            max_steps,
        })
    }

    pub fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.max_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }
        if step > self.max_steps {
            return self.min_lr;
        }
        let ratio =
            (step - self.warmup_steps) as f64 / (self.max_steps - self.warmup_steps) as f64;
        debug_assert!((0.0..=1.0).contains(&ratio));
        let coeff = 0.5 * (1.0 + (std::f64::consts::PI * ratio).cos());
        let (max_lr, min_lr) = (self.max_lr as f64, self.min_lr as f64);
        (min_lr + coeff * (max_lr - min_lr)) as f32
    }
}
