//! Causal Multi-Head Self-Attention
//!
//! Each position attends to itself and every earlier position. Queries,
//! keys and values come out of a single fused projection, are split across
//! heads, combined with scaled dot-product attention and merged back before
//! the output projection.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! q, k, v = split(x @ W_attn^T + b_attn)       each [B, H, T, hd]
//! scores  = (q @ k^T) / √hd
//! att     = softmax(causal_mask(scores))
//! y       = merge(att @ v) @ W_proj^T + b_proj
//! ```
//!
//! ## Backward Pass
//!
//! 1. Output projection
//! 2. `grad_v = att^T @ grad_y`, `grad_att = grad_y @ v^T`
//! 3. Softmax, per row: `grad_scores = att * (grad_att - sum(grad_att * att))`
//! 4. `grad_q = grad_scores @ k / √hd`, `grad_k = grad_scores^T @ q / √hd`
//! 5. Fused q/k/v projection
//!
//! Masked positions have `att == 0`, so step 3 gives them zero gradient and
//! no explicit mask is needed on the way back.

use super::linear::{Linear, LinearCache, ProjectionRole};
use crate::param::{join, Param};
use crate::tensor::Tensor;

pub struct CausalSelfAttention {
    pub c_attn: Linear,
    pub c_proj: Linear,
    pub n_head: usize,
    pub n_embd: usize,
}

impl CausalSelfAttention {
    /// # Panics
    ///
    /// Panics if `n_embd` is not divisible by `n_head`; model configs are
    /// validated before any layer is built.
    pub fn new(n_embd: usize, n_head: usize) -> Self {
        assert!(
            n_head > 0 && n_embd % n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            n_embd,
            n_head
        );
        Self {
            c_attn: Linear::new(n_embd, 3 * n_embd, ProjectionRole::Generic),
            c_proj: Linear::new(n_embd, n_embd, ProjectionRole::ResidualOutput),
            n_head,
            n_embd,
        }
    }

    fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Forward pass over `x` of shape `[batch, seq, n_embd]`
    pub fn forward(&self, x: &Tensor) -> (Tensor, AttentionCache) {
        let (batch, seq) = (x.shape[0], x.shape[1]);
        let hd = self.head_dim();
        let scale = 1.0 / (hd as f32).sqrt();

        let (qkv, attn_cache) = self.c_attn.forward(x);
        let q = self.split_heads(&qkv, 0, batch, seq);
        let k = self.split_heads(&qkv, self.n_embd, batch, seq);
        let v = self.split_heads(&qkv, 2 * self.n_embd, batch, seq);

        let scores = q.matmul(&k.transpose(-2, -1)).mul_scalar(scale);
        let att = scores.causal_fill(f32::NEG_INFINITY).softmax_last();
        let y = att.matmul(&v);

        let merged = self.merge_heads(&y, batch, seq);
        let (out, proj_cache) = self.c_proj.forward(&merged);

        let cache = AttentionCache {
            attn_cache,
            proj_cache,
            q,
            k,
            v,
            att,
        };
        (out, cache)
    }

    /// Backward pass; returns the gradient with respect to the input
    pub fn backward(&mut self, grad_out: &Tensor, cache: &AttentionCache) -> Tensor {
        let (batch, seq) = (grad_out.shape[0], grad_out.shape[1]);
        let scale = 1.0 / (self.head_dim() as f32).sqrt();

        let grad_merged = self.c_proj.backward(grad_out, &cache.proj_cache);
        let grad_y = self.split_heads(&grad_merged, 0, batch, seq);

        let grad_v = cache.att.transpose(-2, -1).matmul(&grad_y);
        let grad_att = grad_y.matmul(&cache.v.transpose(-2, -1));

        let mut grad_scores = grad_att;
        for (g_row, a_row) in grad_scores
            .data
            .chunks_mut(seq)
            .zip(cache.att.data.chunks(seq))
        {
            let dot: f32 = g_row.iter().zip(a_row).map(|(g, a)| g * a).sum();
            for (g, &a) in g_row.iter_mut().zip(a_row) {
                *g = a * (*g - dot);
            }
        }

        let grad_q = grad_scores.matmul(&cache.k).mul_scalar(scale);
        let grad_k = grad_scores
            .transpose(-2, -1)
            .matmul(&cache.q)
            .mul_scalar(scale);

        let mut grad_qkv = Tensor::zeros(vec![batch, seq, 3 * self.n_embd]);
        self.scatter_heads(&grad_q, &mut grad_qkv, 0);
        self.scatter_heads(&grad_k, &mut grad_qkv, self.n_embd);
        self.scatter_heads(&grad_v, &mut grad_qkv, 2 * self.n_embd);

        self.c_attn.backward(&grad_qkv, &cache.attn_cache)
    }

    /// `[batch, seq, width]` columns `offset..offset + n_embd` ->
    /// `[batch, n_head, seq, head_dim]`
    fn split_heads(&self, x: &Tensor, offset: usize, batch: usize, seq: usize) -> Tensor {
        let hd = self.head_dim();
        let width = x.last_dim();
        let mut result = vec![0.0; batch * self.n_head * seq * hd];

        for b in 0..batch {
            for s in 0..seq {
                let src_row = (b * seq + s) * width + offset;
                for h in 0..self.n_head {
                    let dst = ((b * self.n_head + h) * seq + s) * hd;
                    let src = src_row + h * hd;
                    result[dst..dst + hd].copy_from_slice(&x.data[src..src + hd]);
                }
            }
        }

        Tensor::new(result, vec![batch, self.n_head, seq, hd])
    }

    /// `[batch, n_head, seq, head_dim]` -> `[batch, seq, n_embd]`
    fn merge_heads(&self, x: &Tensor, batch: usize, seq: usize) -> Tensor {
        let mut out = Tensor::zeros(vec![batch, seq, self.n_embd]);
        self.scatter_heads(x, &mut out, 0);
        out
    }

    /// Write per-head rows back into columns `offset..offset + n_embd` of
    /// a `[batch, seq, width]` tensor
    fn scatter_heads(&self, x: &Tensor, dst: &mut Tensor, offset: usize) {
        let hd = self.head_dim();
        let (batch, seq) = (dst.shape[0], dst.shape[1]);
        let width = dst.last_dim();

        for b in 0..batch {
            for s in 0..seq {
                let dst_row = (b * seq + s) * width + offset;
                for h in 0..self.n_head {
                    let src = ((b * self.n_head + h) * seq + s) * hd;
                    let d = dst_row + h * hd;
                    dst.data[d..d + hd].copy_from_slice(&x.data[src..src + hd]);
                }
            }
        }
    }

    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) {
        self.c_attn.params(&join(prefix, "c_attn"), out);
        self.c_proj.params(&join(prefix, "c_proj"), out);
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Param)>) {
        self.c_attn.params_mut(&join(prefix, "c_attn"), out);
        self.c_proj.params_mut(&join(prefix, "c_proj"), out);
    }
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub attn_cache: LinearCache,
    pub proj_cache: LinearCache,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Post-softmax attention weights `[batch, n_head, seq, seq]`
    pub att: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn seeded(n_embd: usize, n_head: usize) -> CausalSelfAttention {
        let mut attn = CausalSelfAttention::new(n_embd, n_head);
        for (i, v) in attn.c_attn.weight.value.data.iter_mut().enumerate() {
            *v = ((i * 37 % 17) as f32 - 8.0) * 0.05;
        }
        for (i, v) in attn.c_proj.weight.value.data.iter_mut().enumerate() {
            *v = ((i * 11 % 13) as f32 - 6.0) * 0.05;
        }
        attn
    }

    fn input(batch: usize, seq: usize, n_embd: usize) -> Tensor {
        let n = batch * seq * n_embd;
        Tensor::new(
            (0..n).map(|i| ((i as f32) * 0.37).sin()).collect(),
            vec![batch, seq, n_embd],
        )
    }

    #[test]
    fn test_output_shape_matches_input() {
        let attn = seeded(8, 2);
        let x = input(2, 5, 8);
        let (y, cache) = attn.forward(&x);
        assert_eq!(y.shape, vec![2, 5, 8]);
        assert_eq!(cache.att.shape, vec![2, 2, 5, 5]);
    }

    #[test]
    fn test_causal_independence_from_future_tokens() {
        let attn = seeded(8, 2);
        let x = input(1, 6, 8);
        let (y, _) = attn.forward(&x);

        let mut x2 = x.clone();
        for v in &mut x2.data[4 * 8..] {
            *v += 3.0;
        }
        let (y2, _) = attn.forward(&x2);

        for i in 0..4 * 8 {
            assert_abs_diff_eq!(y.data[i], y2.data[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut attn = seeded(4, 2);
        let x = input(1, 3, 4);
        let w = input(1, 3, 4).mul_scalar(0.5);
        let loss = |a: &CausalSelfAttention, x: &Tensor| {
            let (y, _) = a.forward(x);
            y.data.iter().zip(&w.data).map(|(a, b)| a * b).sum::<f32>()
        };

        let (_, cache) = attn.forward(&x);
        let grad_x = attn.backward(&w, &cache);

        let eps = 1e-2;
        for i in 0..x.data.len() {
            let mut xp = x.clone();
            xp.data[i] += eps;
            let mut xm = x.clone();
            xm.data[i] -= eps;
            let numeric = (loss(&attn, &xp) - loss(&attn, &xm)) / (2.0 * eps);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 1e-2);
        }
    }
}
