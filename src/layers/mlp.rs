//! Position-wise feedforward network
//!
//! ```text
//! x [*, n_embd] → c_fc → [*, 4·n_embd] → GELU → c_proj → [*, n_embd]
//! ```
//!
//! The output projection writes into the residual stream and uses the
//! depth-scaled initialization.

use super::activation::{gelu_backward, gelu_forward};
use super::linear::{Linear, LinearCache, ProjectionRole};
use crate::param::{join, Param};
use crate::tensor::Tensor;

pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
}

impl Mlp {
    pub fn new(n_embd: usize) -> Self {
        let hidden = 4 * n_embd;
        Self {
            c_fc: Linear::new(n_embd, hidden, ProjectionRole::Generic),
            c_proj: Linear::new(hidden, n_embd, ProjectionRole::ResidualOutput),
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, MlpCache) {
        let (h, fc_cache) = self.c_fc.forward(x);
        let activated = gelu_forward(&h);
        let (out, proj_cache) = self.c_proj.forward(&activated);
        (
            out,
            MlpCache {
                fc_cache,
                pre_gelu: h,
                proj_cache,
            },
        )
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &MlpCache) -> Tensor {
        let grad_activated = self.c_proj.backward(grad_out, &cache.proj_cache);
        let grad_h = gelu_backward(&grad_activated, &cache.pre_gelu);
        self.c_fc.backward(&grad_h, &cache.fc_cache)
    }

    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) {
        self.c_fc.params(&join(prefix, "c_fc"), out);
        self.c_proj.params(&join(prefix, "c_proj"), out);
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Param)>) {
        self.c_fc.params_mut(&join(prefix, "c_fc"), out);
        self.c_proj.params_mut(&join(prefix, "c_proj"), out);
    }
}

/// Cache for MLP backward pass
pub struct MlpCache {
    pub fc_cache: LinearCache,
    pub pre_gelu: Tensor,
    pub proj_cache: LinearCache,
}
