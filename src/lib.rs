//! GPT-2 Trainer
//!
//! A GPT-2 style decoder-only transformer trained from raw text on the CPU.
//! Gradients are computed by hand-written backward passes, accumulated over
//! micro-batches, optionally averaged across processes, clipped, and applied
//! with AdamW under a warmup + cosine learning-rate schedule.
//!
//! # Modules
//!
//! - [`tensor`] - Dense `f32` tensor and the kernels the model needs
//! - [`layers`] - Linear, LayerNorm, embedding, attention, MLP, block
//! - [`model`] - The language model, loss and tied output head
//! - [`init`] - Seeded parameter initialization
//! - [`optimizer`] - AdamW with decayed and non-decayed groups
//! - [`schedule`] - Learning-rate schedule
//! - [`data`] - Token corpus and the sharded batch cursor
//! - [`distributed`] - Run context and cross-process averaging
//! - [`train`] - The training loop
//! - [`tokenizer`] - Byte Pair Encoding (BPE) tokenization
//! - [`pretrained`] - Published GPT-2 weights from safetensors
//!
//! # Example
//!
//! ```rust,no_run
//! use gpt2_trainer::{
//!     BPETokenizer, Corpus, Gpt, ModelConfig, RunContext, TrainConfig, Trainer,
//! };
//!
//! let text = std::fs::read_to_string("input.txt").unwrap();
//! let mut tokenizer = BPETokenizer::new();
//! tokenizer.train(&text, 512);
//! let corpus = Corpus::from_tokens(tokenizer.encode(&text));
//!
//! let model = Gpt::new(ModelConfig::tiny(tokenizer.vocab_size())).unwrap();
//! let config = TrainConfig {
//!     total_batch_size: 256,
//!     ..TrainConfig::default()
//! };
//! let ctx = RunContext::single();
//! let collective = ctx.collective().unwrap();
//! let mut trainer = Trainer::new(model, &corpus, config, ctx, collective).unwrap();
//! for report in trainer.run().unwrap() {
//!     println!("{}", report);
//! }
//! ```

pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod gradients;
pub mod init;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod param;
pub mod pretrained;
pub mod schedule;
pub mod tensor;
pub mod tokenizer;
pub mod train;

// Re-export main types for convenience
pub use config::{ModelConfig, TrainConfig};
pub use data::{Batch, Corpus, DataLoaderLite, TokenIds};
pub use distributed::{Collective, Device, RunContext, SingleProcess, TcpCollective};
pub use error::{GptError, Result};
pub use metrics::MetricsLog;
pub use model::{ForwardOutput, Gpt, IGNORE_INDEX};
pub use optimizer::{configure_optimizers, AdamW};
pub use param::Param;
pub use pretrained::PretrainedModel;
pub use schedule::LrSchedule;
pub use tensor::Tensor;
pub use tokenizer::{BPETokenizer, TokenizerStats};
pub use train::{StepReport, Trainer};
