//! Transformer Block
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → MLP → (+) → output
//! │                            ↑  │                     ↑
//! └────────────────────────────┘  └─────────────────────┘
//! ```
//!
//! Pre-norm layout as in GPT-2. On the way back, each residual junction
//! splits the incoming gradient into the skip path and the sublayer path,
//! and the two are summed.

use super::attention::{AttentionCache, CausalSelfAttention};
use super::layer_norm::{LayerNorm, LayerNormCache};
use super::mlp::{Mlp, MlpCache};
use crate::param::{join, Param};
use crate::tensor::Tensor;

pub struct Block {
    pub ln_1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
}

impl Block {
    pub fn new(n_embd: usize, n_head: usize) -> Self {
        Self {
            ln_1: LayerNorm::new(n_embd),
            attn: CausalSelfAttention::new(n_embd, n_head),
            ln_2: LayerNorm::new(n_embd),
            mlp: Mlp::new(n_embd),
        }
    }

    /// `[batch, seq, n_embd]` in, same shape out
    pub fn forward(&self, x: &Tensor) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln_1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out);
        let x = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln_2.forward(&x);
        let (mlp_out, mlp_cache) = self.mlp.forward(&ln2_out);
        let out = x.add(&mlp_out);

        (
            out,
            BlockCache {
                ln1_cache,
                attn_cache,
                ln2_cache,
                mlp_cache,
            },
        )
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &BlockCache) -> Tensor {
        let grad_ln2_out = self.mlp.backward(grad_out, &cache.mlp_cache);
        let mut grad_mid = self.ln_2.backward(&grad_ln2_out, &cache.ln2_cache);
        grad_mid.add_assign(grad_out);

        let grad_ln1_out = self.attn.backward(&grad_mid, &cache.attn_cache);
        let mut grad_x = self.ln_1.backward(&grad_ln1_out, &cache.ln1_cache);
        grad_x.add_assign(&grad_mid);
        grad_x
    }

    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) {
        self.ln_1.params(&join(prefix, "ln_1"), out);
        self.attn.params(&join(prefix, "attn"), out);
        self.ln_2.params(&join(prefix, "ln_2"), out);
        self.mlp.params(&join(prefix, "mlp"), out);
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Param)>) {
        self.ln_1.params_mut(&join(prefix, "ln_1"), out);
        self.attn.params_mut(&join(prefix, "attn"), out);
        self.ln_2.params_mut(&join(prefix, "ln_2"), out);
        self.mlp.params_mut(&join(prefix, "mlp"), out);
    }
}

/// Cache for block backward pass
pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln2_cache: LayerNormCache,
    pub mlp_cache: MlpCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_preserves_shape() {
        let block = Block::new(8, 2);
        let x = Tensor::new((0..48).map(|i| (i as f32 * 0.1).cos()).collect(), vec![2, 3, 8]);
        let (y, _) = block.forward(&x);
        assert_eq!(y.shape, x.shape);
    }

    #[test]
    fn test_param_names_follow_gpt2_layout() {
        let block = Block::new(4, 1);
        let mut params = Vec::new();
        block.params("transformer.h.0", &mut params);
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "transformer.h.0.ln_1.weight",
                "transformer.h.0.ln_1.bias",
                "transformer.h.0.attn.c_attn.weight",
                "transformer.h.0.attn.c_attn.bias",
                "transformer.h.0.attn.c_proj.weight",
                "transformer.h.0.attn.c_proj.bias",
                "transformer.h.0.ln_2.weight",
                "transformer.h.0.ln_2.bias",
                "transformer.h.0.mlp.c_fc.weight",
                "transformer.h.0.mlp.c_fc.bias",
                "transformer.h.0.mlp.c_proj.weight",
                "transformer.h.0.mlp.c_proj.bias",
            ]
        );
    }
}
