//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, the standard optimizer for GPT-2.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (decayed group only)
//! m = β₁ * m + (1 - β₁) * g        # First moment
//! v = β₂ * v + (1 - β₂) * g²       # Second moment
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! with β₁ = 0.9, β₂ = 0.95, ε = 1e-8.
//!
//! ## Parameter Groups
//!
//! [`configure_optimizers`] splits parameters by tensor rank: matrices and
//! embeddings (rank ≥ 2) are decayed, biases and layer-norm scales
//! (rank < 2) are not. The two groups partition the parameter list.
//!
//! ## Fused Update
//!
//! When the device has more than one worker thread every tensor is updated
//! in a single parallel pass. Otherwise the update runs sequentially, which
//! avoids scheduling overhead on small tensors and single-core machines.

use crate::distributed::Device;
use crate::model::Gpt;
use crate::param::Param;
use rayon::prelude::*;
use tracing::info;

pub const BETA1: f32 = 0.9;
pub const BETA2: f32 = 0.95;
pub const EPSILON: f32 = 1e-8;

/// A set of parameter indices sharing a weight decay and learning rate
#[derive(Clone, Debug)]
pub struct ParamGroup {
    pub weight_decay: f32,
    pub lr: f32,
    /// Positions in [`Gpt::params`] order
    pub indices: Vec<usize>,
}

pub struct AdamW {
    pub groups: Vec<ParamGroup>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub fused: bool,
    /// Steps taken so far (bias correction exponent)
    pub step: usize,
    /// Group of each parameter, by parameter position
    group_of: Vec<usize>,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

/// Build AdamW with a decayed (rank ≥ 2) and a non-decayed (rank < 2) group
pub fn configure_optimizers(
    model: &Gpt,
    weight_decay: f32,
    learning_rate: f32,
    device: &Device,
) -> AdamW {
    let params = model.params();

    let mut decay = Vec::new();
    let mut no_decay = Vec::new();
    let mut group_of = Vec::with_capacity(params.len());
    for (i, (_, p)) in params.iter().enumerate() {
        if p.rank() >= 2 {
            decay.push(i);
            group_of.push(0);
        } else {
            no_decay.push(i);
            group_of.push(1);
        }
    }

    let count = |indices: &[usize]| -> usize { indices.iter().map(|&i| params[i].1.numel()).sum() };
    info!(
        tensors = decay.len(),
        parameters = count(&decay),
        "decayed parameter tensors"
    );
    info!(
        tensors = no_decay.len(),
        parameters = count(&no_decay),
        "non-decayed parameter tensors"
    );

    let fused = device.supports_fused_optimizer();
    info!(fused, "using fused AdamW: {}", fused);

    AdamW {
        groups: vec![
            ParamGroup {
                weight_decay,
                lr: learning_rate,
                indices: decay,
            },
            ParamGroup {
                weight_decay: 0.0,
                lr: learning_rate,
                indices: no_decay,
            },
        ],
        beta1: BETA1,
        beta2: BETA2,
        epsilon: EPSILON,
        fused,
        step: 0,
        group_of,
        m: params.iter().map(|(_, p)| vec![0.0; p.numel()]).collect(),
        v: params.iter().map(|(_, p)| vec![0.0; p.numel()]).collect(),
    }
}

impl AdamW {
    /// Set the learning rate of every group
    pub fn set_lr(&mut self, lr: f32) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }

    pub fn zero_grad(&self, model: &mut Gpt) {
        model.zero_grad();
    }

    /// Apply one update from the accumulated gradients
    ///
    /// # Panics
    ///
    /// Panics if the model's parameter layout differs from the one the
    /// optimizer was built for
    pub fn step(&mut self, model: &mut Gpt) {
        self.step += 1;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let params = model.params_mut();
        assert_eq!(
            params.len(),
            self.m.len(),
            "optimizer state does not match model parameters"
        );

        for (i, (_, param)) in params.into_iter().enumerate() {
            let group = &self.groups[self.group_of[i]];
            let hyper = Hyper {
                lr: group.lr,
                weight_decay: group.weight_decay,
                beta1: self.beta1,
                beta2: self.beta2,
                epsilon: self.epsilon,
                bias_correction1,
                bias_correction2,
            };
            adamw_update_param(param, &mut self.m[i], &mut self.v[i], &hyper, self.fused);
        }
    }
}

struct Hyper {
    lr: f32,
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

impl Hyper {
    #[inline(always)]
    fn update(&self, value: &mut f32, grad: f32, m: &mut f32, v: &mut f32) {
        *value *= 1.0 - self.lr * self.weight_decay;
        *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
        *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
        let m_hat = *m / self.bias_correction1;
        let v_hat = *v / self.bias_correction2;
        *value -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
    }
}

fn adamw_update_param(param: &mut Param, m: &mut [f32], v: &mut [f32], hyper: &Hyper, fused: bool) {
    let Param { value, grad } = param;
    if fused {
        value
            .data
            .par_iter_mut()
            .zip(grad.data.par_iter())
            .zip(m.par_iter_mut().zip(v.par_iter_mut()))
            .for_each(|((p, &g), (m, v))| hyper.update(p, g, m, v));
    } else {
        for (((p, &g), m), v) in value
            .data
            .iter_mut()
            .zip(&grad.data)
            .zip(m.iter_mut())
            .zip(v.iter_mut())
        {
            hyper.update(p, g, m, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use approx::assert_abs_diff_eq;

    fn model() -> Gpt {
        Gpt::new(ModelConfig {
            block_size: 4,
            vocab_size: 7,
            n_layer: 1,
            n_head: 1,
            n_embd: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_groups_partition_by_rank() {
        let model = model();
        let opt = configure_optimizers(&model, 0.1, 6e-4, &Device::Cpu { threads: 1 });
        let params = model.params();

        let mut seen = vec![0; params.len()];
        for (g, group) in opt.groups.iter().enumerate() {
            for &i in &group.indices {
                seen[i] += 1;
                let rank = params[i].1.rank();
                if g == 0 {
                    assert!(rank >= 2, "{} in decayed group", params[i].0);
                } else {
                    assert!(rank < 2, "{} in non-decayed group", params[i].0);
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
        assert_eq!(opt.groups[0].weight_decay, 0.1);
        assert_eq!(opt.groups[1].weight_decay, 0.0);
        assert!(!opt.fused);
    }

    #[test]
    fn test_decay_only_touches_matrices() {
        let mut model = model();
        let mut opt = configure_optimizers(&model, 0.5, 0.1, &Device::Cpu { threads: 4 });
        model.h[0].ln_1.bias.value.data[0] = 2.0;
        let w_before = model.wpe.weight.value.data[0];

        // zero gradients: only the decoupled decay moves anything
        opt.step(&mut model);

        assert_abs_diff_eq!(model.wpe.weight.value.data[0], w_before * 0.95, epsilon = 1e-7);
        assert_eq!(model.h[0].ln_1.bias.value.data[0], 2.0);
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let mut model = model();
        let mut opt = configure_optimizers(&model, 0.0, 0.01, &Device::Cpu { threads: 1 });
        let before = model.ln_f.bias.value.data.clone();
        model.ln_f.bias.grad.data = vec![3.0, -0.5, 0.0, 1e-3];

        opt.set_lr(0.01);
        opt.step(&mut model);

        let after = &model.ln_f.bias.value.data;
        assert_abs_diff_eq!(after[0], before[0] - 0.01, epsilon = 1e-6);
        assert_abs_diff_eq!(after[1], before[1] + 0.01, epsilon = 1e-6);
        assert_eq!(after[2], before[2]);
        assert_abs_diff_eq!(after[3], before[3] - 0.01, epsilon = 1e-4);
        assert_eq!(opt.step, 1);
    }

    #[test]
    fn test_fused_and_sequential_agree() {
        let mut a = model();
        let mut b = model();
        for m in [&mut a, &mut b] {
            for (i, (_, p)) in m.params_mut().into_iter().enumerate() {
                for (j, g) in p.grad.data.iter_mut().enumerate() {
                    *g = ((i * 31 + j * 7) % 13) as f32 * 0.01 - 0.06;
                }
            }
        }
        let mut fused = configure_optimizers(&a, 0.1, 1e-3, &Device::Cpu { threads: 8 });
        let mut plain = configure_optimizers(&b, 0.1, 1e-3, &Device::Cpu { threads: 1 });
        for _ in 0..3 {
            fused.step(&mut a);
            plain.step(&mut b);
        }
        for ((_, pa), (_, pb)) in a.params().iter().zip(b.params().iter()) {
            assert_eq!(pa.value.data, pb.value.data);
        }
    }
}
