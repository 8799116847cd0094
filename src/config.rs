//! Model and training configuration
//!
//! Both records are plain data with eager validation: a run either starts
//! with a consistent configuration or fails before any tensor is allocated.
//!
//! # Parameter Count Formula
//!
//! With the output head tied to the token embedding:
//! ```text
//! embeddings ≈ (vocab_size + block_size) × n_embd
//! per_layer  ≈ 12 × n_embd²
//! total      ≈ embeddings + n_layer × per_layer
//! ```

use crate::error::{GptError, Result};
use crate::init::DEFAULT_INIT_SEED;
use crate::model::Gpt;
use serde::{Deserialize, Serialize};

/// Architecture hyperparameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Maximum sequence length (position capacity)
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::gpt2()
    }
}

impl ModelConfig {
    /// GPT-2 Small geometry, vocabulary padded from 50257 to 50304
    pub fn gpt2() -> Self {
        Self {
            block_size: 1024,
            vocab_size: 50304,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
        }
    }

    /// A small configuration for CPU experiments and tests
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            block_size: 64,
            vocab_size,
            n_layer: 2,
            n_head: 2,
            n_embd: 32,
        }
    }

    /// Width of one attention head
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("block_size", self.block_size),
            ("vocab_size", self.vocab_size),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_embd", self.n_embd),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(GptError::Config(format!("{} must be positive", name)));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(GptError::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }
}

/// Training-loop constants for one run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Tokens each process accumulates per optimizer step
    pub total_batch_size: usize,
    /// Sequences per micro-batch (B)
    pub micro_batch_size: usize,
    /// Tokens per sequence (T)
    pub seq_len: usize,
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub weight_decay: f32,
    pub grad_clip: f32,
    /// Seed for freshly initialized weights
    pub init_seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let max_lr = 6e-4;
        Self {
            total_batch_size: 524_288,
            micro_batch_size: 4,
            seq_len: 16,
            max_lr,
            min_lr: max_lr * 0.1,
            warmup_steps: 10,
            max_steps: 50,
            weight_decay: 0.1,
            grad_clip: 1.0,
            init_seed: DEFAULT_INIT_SEED,
        }
    }
}

impl TrainConfig {
    /// Tokens one process consumes per micro-step
    pub fn tokens_per_micro_batch(&self) -> usize {
        self.micro_batch_size * self.seq_len
    }

    /// Micro-steps per optimizer step, independent of the process count
    pub fn grad_accum_steps(&self) -> Result<usize> {
        let per_micro = self.tokens_per_micro_batch();
        if per_micro == 0 || self.total_batch_size % per_micro != 0 {
            return Err(GptError::Config(format!(
                "total_batch_size ({}) must be divisible by micro_batch_size * seq_len ({})",
                self.total_batch_size, per_micro
            )));
        }
        Ok(self.total_batch_size / per_micro)
    }

    /// Build a freshly initialized model seeded with `init_seed`
    pub fn init_model(&self, model: ModelConfig) -> Result<Gpt> {
        Gpt::with_seed(model, self.init_seed)
    }

    /// Validate everything that does not depend on the model or topology
    pub fn validate(&self, model: &ModelConfig) -> Result<()> {
        if self.micro_batch_size == 0 || self.seq_len == 0 {
            return Err(GptError::Config(
                "micro_batch_size and seq_len must be positive".to_string(),
            ));
        }
        if self.seq_len > model.block_size {
            return Err(GptError::Config(format!(
                "seq_len ({}) exceeds block_size ({})",
                self.seq_len, model.block_size
            )));
        }
        if self.warmup_steps >= self.max_steps {
            return Err(GptError::Config(format!(
                "warmup_steps ({}) must be smaller than max_steps ({})",
                self.warmup_steps, self.max_steps
            )));
        }
        if self.grad_clip <= 0.0 {
            return Err(GptError::Config("grad_clip must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut cfg = ModelConfig::tiny(100);
        cfg.n_head = 3;
        assert!(matches!(cfg.validate(), Err(GptError::Config(_))));
        assert!(ModelConfig::gpt2().validate().is_ok());
    }

    #[test]
    fn test_grad_accum_steps() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.grad_accum_steps().unwrap(), 524_288 / 64);

        // divisible by B*T alone is enough
        let cfg = TrainConfig {
            total_batch_size: 192,
            ..TrainConfig::default()
        };
        assert_eq!(cfg.grad_accum_steps().unwrap(), 3);

        let cfg = TrainConfig {
            total_batch_size: 100,
            ..TrainConfig::default()
        };
        assert!(matches!(cfg.grad_accum_steps(), Err(GptError::Config(_))));
    }

    #[test]
    fn test_init_model_uses_seed() {
        let seeded = |init_seed| {
            TrainConfig {
                init_seed,
                ..TrainConfig::default()
            }
            .init_model(ModelConfig::tiny(16))
            .unwrap()
        };
        let a = seeded(7);
        let b = Gpt::with_seed(ModelConfig::tiny(16), 7).unwrap();
        let c = seeded(8);
        assert_eq!(a.wte.weight.value.data, b.wte.weight.value.data);
        assert_ne!(a.wte.weight.value.data, c.wte.weight.value.data);
    }

    #[test]
    fn test_warmup_must_precede_max_steps() {
        let model = ModelConfig::tiny(100);
        let mut cfg = TrainConfig::default();
        assert!(cfg.validate(&model).is_ok());
        cfg.warmup_steps = cfg.max_steps;
        assert!(cfg.validate(&model).is_err());
    }

    #[test]
    fn test_model_config_json_roundtrip_field_names() {
        let json = serde_json::to_string(&ModelConfig::tiny(65)).unwrap();
        assert!(json.contains("\"n_layer\":2"));
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ModelConfig::tiny(65));
    }
}
