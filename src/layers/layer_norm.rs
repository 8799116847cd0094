//! Layer Normalization
//!
//! Normalizes each row over the channel dimension, then applies a learned
//! scale and shift:
//!
//! ```text
//! mean  = mean(x)
//! rstd  = 1 / sqrt(var(x) + eps)
//! x_hat = (x - mean) * rstd
//! y     = gamma * x_hat + beta
//! ```
//!
//! ## Backward Pass
//!
//! With `d = grad_y * gamma`, per row of `n` features:
//! ```text
//! grad_x     = rstd * (d - mean(d) - x_hat * mean(d * x_hat))
//! grad_gamma = sum(grad_y * x_hat)
//! grad_beta  = sum(grad_y)
//! ```

use crate::param::{join, Param};
use crate::tensor::Tensor;
use rayon::prelude::*;

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Layer normalization over the last dimension
pub struct LayerNorm {
    pub weight: Param,
    pub bias: Param,
    pub eps: f32,
}

impl LayerNorm {
    /// Create with gamma = 1 and beta = 0
    pub fn new(n_embd: usize) -> Self {
        Self {
            weight: Param::ones(vec![n_embd]),
            bias: Param::zeros(vec![n_embd]),
            eps: LAYER_NORM_EPS,
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n = x.last_dim();
        let gamma = &self.weight.value.data;
        let beta = &self.bias.value.data;

        let mut x_hat = vec![0.0; x.data.len()];
        let mut y = vec![0.0; x.data.len()];
        let mut rstd = vec![0.0; x.rows()];

        x_hat
            .par_chunks_mut(n)
            .zip(y.par_chunks_mut(n))
            .zip(rstd.par_iter_mut())
            .zip(x.data.par_chunks(n))
            .for_each(|(((xh, yr), rs), xr)| {
                let mean = xr.iter().sum::<f32>() / n as f32;
                let var = xr.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                *rs = 1.0 / (var + self.eps).sqrt();
                for i in 0..n {
                    xh[i] = (xr[i] - mean) * *rs;
                    yr[i] = gamma[i] * xh[i] + beta[i];
                }
            });

        let cache = LayerNormCache {
            x_hat: Tensor::new(x_hat, x.shape.clone()),
            rstd,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &LayerNormCache) -> Tensor {
        let n = grad_out.last_dim();
        let gamma = &self.weight.value.data;

        let mut grad_gamma = vec![0.0; n];
        let mut grad_beta = vec![0.0; n];
        for (g, xh) in grad_out.data.chunks(n).zip(cache.x_hat.data.chunks(n)) {
            for i in 0..n {
                grad_gamma[i] += g[i] * xh[i];
                grad_beta[i] += g[i];
            }
        }

        let mut grad_x = vec![0.0; grad_out.data.len()];
        grad_x
            .par_chunks_mut(n)
            .zip(grad_out.data.par_chunks(n))
            .zip(cache.x_hat.data.par_chunks(n))
            .zip(cache.rstd.par_iter())
            .for_each(|(((gx, g), xh), &rs)| {
                let mut mean_d = 0.0;
                let mut mean_dx = 0.0;
                for i in 0..n {
                    let d = g[i] * gamma[i];
                    mean_d += d;
                    mean_dx += d * xh[i];
                }
                mean_d /= n as f32;
                mean_dx /= n as f32;
                for i in 0..n {
                    let d = g[i] * gamma[i];
                    gx[i] = rs * (d - mean_d - xh[i] * mean_dx);
                }
            });

        self.weight.accumulate(&Tensor::new(grad_gamma, vec![n]));
        self.bias.accumulate(&Tensor::new(grad_beta, vec![n]));
        Tensor::new(grad_x, grad_out.shape.clone())
    }

    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) {
        out.push((join(prefix, "weight"), &self.weight));
        out.push((join(prefix, "bias"), &self.bias));
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Param)>) {
        out.push((join(prefix, "weight"), &mut self.weight));
        out.push((join(prefix, "bias"), &mut self.bias));
    }
}

/// Cache for layer norm backward pass
pub struct LayerNormCache {
    pub x_hat: Tensor,
    /// One reciprocal standard deviation per row
    pub rstd: Vec<f32>,
}
