//! GPT-2 Language Model
//!
//! A decoder-only transformer with learned token and position embeddings,
//! a stack of pre-norm blocks, a final layer norm, and an output head tied
//! to the token embedding table.
//!
//! ## Architecture
//!
//! ```text
//! idx [B, T]
//!   │
//!   ├─► wte[idx] + wpe[0..T]            [B, T, C]
//!   ├─► Block × n_layer                 [B, T, C]
//!   ├─► ln_f                            [B, T, C]
//!   └─► x @ wte^T                       [B, T, V]   (tied head)
//! ```
//!
//! ## Weight Tying
//!
//! There is no separate output-projection tensor. The head reads
//! `transformer.wte.weight` directly, and its backward pass accumulates into
//! the same gradient buffer as the embedding lookup. Every write (optimizer
//! step, checkpoint import) therefore lands in one place.
//!
//! ## Loss
//!
//! Mean token-level cross-entropy over every target that is not
//! [`IGNORE_INDEX`]. Without targets only the final position is projected,
//! which is all autoregressive sampling needs.

use crate::config::ModelConfig;
use crate::data::{Batch, TokenIds};
use crate::error::{GptError, Result};
use crate::init::{Component, Initializer, DEFAULT_INIT_SEED};
use crate::layers::{Block, BlockCache, Embedding, LayerNorm, LayerNormCache};
use crate::param::{count_elements, join, Param};
use crate::tensor::Tensor;
use rayon::prelude::*;
use tracing::info;

/// Target id excluded from the loss
pub const IGNORE_INDEX: usize = usize::MAX;

/// Result of [`Gpt::forward`]
#[derive(Debug)]
pub struct ForwardOutput {
    /// `[B, T, V]` with targets, `[B, 1, V]` without
    pub logits: Option<Tensor>,
    pub loss: Option<f32>,
}

pub struct Gpt {
    pub config: ModelConfig,
    pub wte: Embedding,
    pub wpe: Embedding,
    pub h: Vec<Block>,
    pub ln_f: LayerNorm,
}

impl Gpt {
    /// Build and initialize with the default seed
    pub fn new(config: ModelConfig) -> Result<Self> {
        Self::with_seed(config, DEFAULT_INIT_SEED)
    }

    pub fn with_seed(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut model = Self {
            wte: Embedding::new(config.vocab_size, config.n_embd),
            wpe: Embedding::new(config.block_size, config.n_embd),
            h: (0..config.n_layer)
                .map(|_| Block::new(config.n_embd, config.n_head))
                .collect(),
            ln_f: LayerNorm::new(config.n_embd),
            config,
        };

        let mut initializer = Initializer::new(seed, model.config.n_layer);
        initializer.run(model.components_mut())?;

        info!(
            parameters = model.num_params(),
            n_layer = model.config.n_layer,
            n_embd = model.config.n_embd,
            "model initialized"
        );
        Ok(model)
    }

    /// The output projection; the same storage as the token embedding table
    pub fn lm_head(&self) -> &Param {
        &self.wte.weight
    }

    /// Every initializable component in traversal order
    pub fn components_mut(&mut self) -> Vec<Component<'_>> {
        let mut out = vec![
            Component::Embedding(&mut self.wte),
            Component::Embedding(&mut self.wpe),
        ];
        for block in self.h.iter_mut() {
            let Block {
                ln_1,
                attn,
                ln_2,
                mlp,
            } = block;
            out.push(Component::LayerNorm(ln_1));
            out.push(Component::Linear(&mut attn.c_attn));
            out.push(Component::Linear(&mut attn.c_proj));
            out.push(Component::LayerNorm(ln_2));
            out.push(Component::Linear(&mut mlp.c_fc));
            out.push(Component::Linear(&mut mlp.c_proj));
        }
        out.push(Component::LayerNorm(&mut self.ln_f));
        out
    }

    /// Named parameters in canonical order
    pub fn params(&self) -> Vec<(String, &Param)> {
        let mut out = Vec::new();
        self.wte.params("transformer.wte", &mut out);
        self.wpe.params("transformer.wpe", &mut out);
        for (i, block) in self.h.iter().enumerate() {
            block.params(&join("transformer.h", &i.to_string()), &mut out);
        }
        self.ln_f.params("transformer.ln_f", &mut out);
        out
    }

    pub fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut out = Vec::new();
        self.wte.params_mut("transformer.wte", &mut out);
        self.wpe.params_mut("transformer.wpe", &mut out);
        for (i, block) in self.h.iter_mut().enumerate() {
            block.params_mut(&join("transformer.h", &i.to_string()), &mut out);
        }
        self.ln_f.params_mut("transformer.ln_f", &mut out);
        out
    }

    /// Trainable element count; the tied head is counted once
    pub fn num_params(&self) -> usize {
        count_elements(&self.params())
    }

    pub fn zero_grad(&mut self) {
        for (_, p) in self.params_mut() {
            p.zero_grad();
        }
    }

    fn check_ids(&self, idx: &TokenIds, targets: Option<&TokenIds>) -> Result<()> {
        if idx.seq_len > self.config.block_size {
            return Err(GptError::SequenceTooLong {
                len: idx.seq_len,
                block_size: self.config.block_size,
            });
        }
        let vocab_size = self.config.vocab_size;
        if let Some(&token) = idx.data.iter().find(|&&t| t >= vocab_size) {
            return Err(GptError::TokenOutOfRange { token, vocab_size });
        }
        if let Some(targets) = targets {
            assert_eq!(
                targets.shape(),
                idx.shape(),
                "targets must have the same shape as inputs"
            );
            if let Some(&token) = targets
                .data
                .iter()
                .find(|&&t| t >= vocab_size && t != IGNORE_INDEX)
            {
                return Err(GptError::TokenOutOfRange { token, vocab_size });
            }
        }
        Ok(())
    }

    /// Embeddings, blocks and final norm: `[B, T] -> [B, T, C]`
    fn trunk(&self, idx: &TokenIds) -> (Tensor, Vec<BlockCache>, LayerNormCache) {
        let (b, t) = (idx.batch_size, idx.seq_len);
        let positions: Vec<usize> = (0..t).collect();

        let tok_emb = self.wte.forward(&idx.data, &[b, t]);
        let pos_emb = self.wpe.forward(&positions, &[t]);
        let mut x = tok_emb.add(&pos_emb);

        let mut block_caches = Vec::with_capacity(self.h.len());
        for block in &self.h {
            let (out, cache) = block.forward(&x);
            block_caches.push(cache);
            x = out;
        }

        let (x, ln_f_cache) = self.ln_f.forward(&x);
        (x, block_caches, ln_f_cache)
    }

    /// Inference and evaluation entry point
    ///
    /// With targets, returns the mean loss and, when `return_logits` is set,
    /// the full `[B, T, V]` logits. Without targets, returns logits for the
    /// last position only and no loss.
    pub fn forward(
        &self,
        idx: &TokenIds,
        targets: Option<&TokenIds>,
        return_logits: bool,
    ) -> Result<ForwardOutput> {
        self.check_ids(idx, targets)?;
        let (b, t) = (idx.batch_size, idx.seq_len);
        let c = self.config.n_embd;
        let v = self.config.vocab_size;
        let (x, _, _) = self.trunk(idx);

        let Some(targets) = targets else {
            let mut last = Vec::with_capacity(b * c);
            for row in 0..b {
                let start = (row * t + t - 1) * c;
                last.extend_from_slice(&x.data[start..start + c]);
            }
            let logits = Tensor::new(last, vec![b, c])
                .matmul_bt(&self.lm_head().value)
                .into_shape(&[b, 1, v]);
            return Ok(ForwardOutput {
                logits: Some(logits),
                loss: None,
            });
        };

        let logits = x.reshape(&[b * t, c]).matmul_bt(&self.lm_head().value);
        let (loss, _) = cross_entropy(&logits, &targets.data);
        Ok(ForwardOutput {
            logits: return_logits.then(|| logits.into_shape(&[b, t, v])),
            loss: Some(loss),
        })
    }

    /// Training forward pass: loss plus everything backward needs
    pub fn forward_train(&self, batch: &Batch) -> Result<(f32, ForwardCache)> {
        self.check_ids(&batch.inputs, Some(&batch.targets))?;
        let (b, t) = (batch.inputs.batch_size, batch.inputs.seq_len);
        let c = self.config.n_embd;

        let (x, block_caches, ln_f_cache) = self.trunk(&batch.inputs);
        let x_final = x.into_shape(&[b * t, c]);
        let logits = x_final.matmul_bt(&self.lm_head().value);
        let (loss, probs) = cross_entropy(&logits, &batch.targets.data);

        let cache = ForwardCache {
            idx: batch.inputs.clone(),
            targets: batch.targets.data.clone(),
            block_caches,
            ln_f_cache,
            x_final,
            probs,
        };
        Ok((loss, cache))
    }

    /// Accumulate gradients of `loss_scale × loss` into every parameter
    pub fn backward(&mut self, cache: &ForwardCache, loss_scale: f32) {
        let (b, t) = (cache.idx.batch_size, cache.idx.seq_len);
        let c = self.config.n_embd;
        let v = self.config.vocab_size;

        let n_valid = cache.targets.iter().filter(|&&y| y != IGNORE_INDEX).count();
        if n_valid == 0 {
            return;
        }
        let scale = loss_scale / n_valid as f32;

        // d(loss)/d(logits) = (softmax - onehot) / n_valid
        let mut grad_logits = cache.probs.clone();
        grad_logits
            .data
            .par_chunks_mut(v)
            .zip(cache.targets.par_iter())
            .for_each(|(row, &y)| {
                if y == IGNORE_INDEX {
                    row.iter_mut().for_each(|g| *g = 0.0);
                } else {
                    row[y] -= 1.0;
                    row.iter_mut().for_each(|g| *g *= scale);
                }
            });

        // tied head: both the head and the lookup write into wte.grad
        let grad_x = grad_logits.matmul(&self.wte.weight.value);
        let grad_head = grad_logits.transpose(0, 1).matmul(&cache.x_final);
        self.wte.weight.accumulate(&grad_head);

        let grad_x = grad_x.into_shape(&[b, t, c]);
        let mut grad = self.ln_f.backward(&grad_x, &cache.ln_f_cache);
        for (block, block_cache) in self.h.iter_mut().zip(&cache.block_caches).rev() {
            grad = block.backward(&grad, block_cache);
        }

        self.wte.backward(&grad, &cache.idx.data);
        let positions: Vec<usize> = (0..b).flat_map(|_| 0..t).collect();
        self.wpe.backward(&grad, &positions);
    }
}

/// Everything [`Gpt::backward`] needs from one training forward pass
pub struct ForwardCache {
    idx: TokenIds,
    targets: Vec<usize>,
    block_caches: Vec<BlockCache>,
    ln_f_cache: LayerNormCache,
    /// Final normalized activations `[B*T, C]`
    x_final: Tensor,
    /// Softmax of the logits `[B*T, V]`
    probs: Tensor,
}

/// Mean cross-entropy over non-ignored rows; also returns the softmax
///
/// A batch whose targets are all ignored has loss 0.
fn cross_entropy(logits: &Tensor, targets: &[usize]) -> (f32, Tensor) {
    let v = logits.last_dim();
    let mut probs = logits.data.clone();
    let losses: Vec<f32> = probs
        .par_chunks_mut(v)
        .zip(targets.par_iter())
        .map(|(row, &y)| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let target_shifted = if y == IGNORE_INDEX { 0.0 } else { row[y] - max };
            let mut sum = 0.0;
            for p in row.iter_mut() {
                *p = (*p - max).exp();
                sum += *p;
            }
            let log_sum = sum.ln();
            for p in row.iter_mut() {
                *p /= sum;
            }
            if y == IGNORE_INDEX {
                0.0
            } else {
                log_sum - target_shifted
            }
        })
        .collect();

    let n_valid = targets.iter().filter(|&&y| y != IGNORE_INDEX).count();
    let loss = if n_valid == 0 {
        0.0
    } else {
        losses.iter().sum::<f32>() / n_valid as f32
    };
    (loss, Tensor::new(probs, logits.shape.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tiny() -> ModelConfig {
        ModelConfig {
            block_size: 8,
            vocab_size: 11,
            n_layer: 2,
            n_head: 2,
            n_embd: 8,
        }
    }

    fn ids(b: usize, t: usize, offset: usize) -> TokenIds {
        TokenIds::new((0..b * t).map(|i| (i * 3 + offset) % 11).collect(), b, t)
    }

    #[test]
    fn test_forward_with_targets_shapes() {
        let model = Gpt::new(tiny()).unwrap();
        let out = model
            .forward(&ids(2, 8, 0), Some(&ids(2, 8, 1)), true)
            .unwrap();
        let loss = out.loss.unwrap();
        assert!(loss >= 0.0);
        // near-uniform predictions at init
        assert!((loss - (11f32).ln()).abs() < 0.5, "loss {}", loss);
        assert_eq!(out.logits.unwrap().shape, vec![2, 8, 11]);

        let out = model.forward(&ids(2, 8, 0), Some(&ids(2, 8, 1)), false).unwrap();
        assert!(out.logits.is_none());
    }

    #[test]
    fn test_forward_without_targets_returns_last_position() {
        let model = Gpt::new(tiny()).unwrap();
        let input = ids(2, 8, 0);
        let out = model.forward(&input, None, true).unwrap();
        assert!(out.loss.is_none());
        let last = out.logits.unwrap();
        assert_eq!(last.shape, vec![2, 1, 11]);

        let full = model
            .forward(&input, Some(&ids(2, 8, 1)), true)
            .unwrap()
            .logits
            .unwrap();
        for b in 0..2 {
            for k in 0..11 {
                let expected = full.data[(b * 8 + 7) * 11 + k];
                assert_abs_diff_eq!(last.data[b * 11 + k], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_sequence_longer_than_block_rejected() {
        let model = Gpt::new(tiny()).unwrap();
        let err = model.forward(&ids(1, 9, 0), None, false).unwrap_err();
        assert!(matches!(
            err,
            GptError::SequenceTooLong {
                len: 9,
                block_size: 8
            }
        ));
    }

    #[test]
    fn test_out_of_range_token_rejected() {
        let model = Gpt::new(tiny()).unwrap();
        let bad = TokenIds::new(vec![0, 11], 1, 2);
        assert!(matches!(
            model.forward(&bad, None, false),
            Err(GptError::TokenOutOfRange { token: 11, .. })
        ));
    }

    #[test]
    fn test_ignored_targets_excluded_from_loss() {
        let model = Gpt::new(tiny()).unwrap();
        let input = ids(1, 4, 0);
        let full = TokenIds::new(vec![1, 2, 3, 4], 1, 4);
        let partial = TokenIds::new(vec![1, IGNORE_INDEX, 3, IGNORE_INDEX], 1, 4);
        let none = TokenIds::new(vec![IGNORE_INDEX; 4], 1, 4);

        let logits = model.forward(&input, Some(&full), true).unwrap().logits.unwrap();
        let manual: f32 = [(0usize, 1usize), (2, 3)]
            .iter()
            .map(|&(pos, y)| {
                let row = &logits.data[pos * 11..(pos + 1) * 11];
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let lse = max + row.iter().map(|l| (l - max).exp()).sum::<f32>().ln();
                lse - row[y]
            })
            .sum::<f32>()
            / 2.0;

        let partial_loss = model.forward(&input, Some(&partial), false).unwrap().loss.unwrap();
        assert_abs_diff_eq!(partial_loss, manual, epsilon = 1e-5);
        assert_eq!(model.forward(&input, Some(&none), false).unwrap().loss, Some(0.0));
    }

    #[test]
    fn test_param_order_and_tying() {
        let model = Gpt::new(tiny()).unwrap();
        let params = model.params();
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names[0], "transformer.wte.weight");
        assert_eq!(names[1], "transformer.wpe.weight");
        assert_eq!(names[2], "transformer.h.0.ln_1.weight");
        assert_eq!(names[names.len() - 1], "transformer.ln_f.bias");
        assert_eq!(names.len(), 2 + 12 * 2 + 2);
        assert!(!names.iter().any(|n| n.starts_with("lm_head")));
        assert!(std::ptr::eq(model.lm_head(), &model.wte.weight));
    }

    #[test]
    fn test_backward_matches_finite_difference_on_embeddings() {
        let mut model = Gpt::with_seed(tiny(), 3).unwrap();
        let batch = Batch {
            inputs: ids(1, 4, 0),
            targets: ids(1, 4, 5),
        };
        let (_, cache) = model.forward_train(&batch).unwrap();
        model.backward(&cache, 1.0);

        // token 0 is used as input and its wte row also feeds the tied head
        let probes = [(0usize, 0usize), (0, 3), (3, 5), (6, 1)];
        let eps = 1e-2;
        for &(row, col) in &probes {
            let idx = row * 8 + col;
            let analytic = model.wte.weight.grad.data[idx];

            let original = model.wte.weight.value.data[idx];
            model.wte.weight.value.data[idx] = original + eps;
            let plus = model.forward_train(&batch).unwrap().0;
            model.wte.weight.value.data[idx] = original - eps;
            let minus = model.forward_train(&batch).unwrap().0;
            model.wte.weight.value.data[idx] = original;

            let numeric = (plus - minus) / (2.0 * eps);
            assert_abs_diff_eq!(analytic, numeric, epsilon = 2e-3);
        }
    }

    #[test]
    fn test_backward_accumulates_across_calls() {
        let mut model = Gpt::new(tiny()).unwrap();
        let batch = Batch {
            inputs: ids(2, 4, 0),
            targets: ids(2, 4, 2),
        };
        let (_, cache) = model.forward_train(&batch).unwrap();
        model.backward(&cache, 0.5);
        let once: Vec<f32> = model.ln_f.weight.grad.data.clone();
        model.backward(&cache, 0.5);
        for (twice, single) in model.ln_f.weight.grad.data.iter().zip(&once) {
            assert_abs_diff_eq!(*twice, 2.0 * single, epsilon = 1e-6);
        }
        model.zero_grad();
        assert!(model.params().iter().all(|(_, p)| p.grad.data.iter().all(|&g| g == 0.0)));
    }
}
