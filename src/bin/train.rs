//! Train a GPT-2 style model on a plain-text corpus
//!
//! ## Usage
//!
//! ```bash
//! # Small model, fresh 512-token BPE vocabulary
//! cargo run --release --bin train -- --data input.txt --preset tiny \
//!     --bpe-vocab 512 --total-batch-size 4096 --metrics run.csv
//!
//! # GPT-2 124M (vocab padded to 50304)
//! cargo run --release --bin train -- --data input.txt --tokenizer tokenizer.json
//!
//! # Start from the published GPT-2 weights
//! cargo run --release --bin train -- --data input.txt --tokenizer gpt2.json \
//!     --init-from gpt2 --weights model.safetensors
//!
//! # Two processes on one machine
//! RANK=0 LOCAL_RANK=0 WORLD_SIZE=2 cargo run --release --bin train -- ... &
//! RANK=1 LOCAL_RANK=1 WORLD_SIZE=2 cargo run --release --bin train -- ...
//! ```
//!
//! `RUST_LOG` controls verbosity (default `info`); `RUST_LOG=debug` also
//! logs every micro-step.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use gpt2_trainer::{
    BPETokenizer, Corpus, Gpt, MetricsLog, ModelConfig, PretrainedModel, RunContext, TrainConfig,
    Trainer,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Preset {
    /// 2 layers, 2 heads, 32 wide, 64 positions; vocab follows the tokenizer
    Tiny,
    /// GPT-2 124M with the vocabulary padded to 50304
    Gpt2,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a GPT-2 style language model")]
struct Args {
    /// Training text (UTF-8)
    #[arg(long, default_value = "input.txt")]
    data: PathBuf,

    /// Load a saved tokenizer instead of training one
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Vocabulary size when training a tokenizer
    #[arg(long, default_value_t = 512)]
    bpe_vocab: usize,

    /// Where to save a freshly trained tokenizer
    #[arg(long)]
    save_tokenizer: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "gpt2")]
    preset: Preset,

    /// Start from published GPT-2 weights (gpt2, gpt2-medium, gpt2-large, gpt2-xl)
    #[arg(
        long,
        requires = "weights",
        conflicts_with_all = ["preset", "block_size", "n_layer", "n_head", "n_embd"]
    )]
    init_from: Option<PretrainedModel>,

    /// Safetensors file holding the weights named by --init-from
    #[arg(long)]
    weights: Option<PathBuf>,

    // Model overrides
    #[arg(long)]
    block_size: Option<usize>,
    #[arg(long)]
    n_layer: Option<usize>,
    #[arg(long)]
    n_head: Option<usize>,
    #[arg(long)]
    n_embd: Option<usize>,

    // Training
    /// Tokens each process accumulates per optimizer step
    #[arg(long, default_value_t = 524_288)]
    total_batch_size: usize,
    /// Sequences per micro-batch
    #[arg(short = 'B', long, default_value_t = 4)]
    micro_batch_size: usize,
    /// Tokens per sequence
    #[arg(short = 'T', long, default_value_t = 16)]
    seq_len: usize,
    #[arg(long, default_value_t = 6e-4)]
    max_lr: f32,
    /// Defaults to 10% of --max-lr
    #[arg(long)]
    min_lr: Option<f32>,
    #[arg(long, default_value_t = 10)]
    warmup_steps: usize,
    #[arg(long, default_value_t = 50)]
    max_steps: usize,
    #[arg(long, default_value_t = 0.1)]
    weight_decay: f32,
    #[arg(long, default_value_t = 1.0)]
    grad_clip: f32,
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Write one CSV row per step to this file (rank 0 only)
    #[arg(long)]
    metrics: Option<PathBuf>,
}

impl Args {
    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            total_batch_size: self.total_batch_size,
            micro_batch_size: self.micro_batch_size,
            seq_len: self.seq_len,
            max_lr: self.max_lr,
            min_lr: self.min_lr.unwrap_or(self.max_lr * 0.1),
            warmup_steps: self.warmup_steps,
            max_steps: self.max_steps,
            weight_decay: self.weight_decay,
            grad_clip: self.grad_clip,
            init_seed: self.seed,
        }
    }

    fn model_config(&self, tokenizer_vocab: usize) -> ModelConfig {
        let base = match self.preset {
            Preset::Tiny => ModelConfig::tiny(tokenizer_vocab),
            Preset::Gpt2 => ModelConfig::gpt2(),
        };
        ModelConfig {
            block_size: self.block_size.unwrap_or(base.block_size),
            vocab_size: base.vocab_size,
            n_layer: self.n_layer.unwrap_or(base.n_layer),
            n_head: self.n_head.unwrap_or(base.n_head),
            n_embd: self.n_embd.unwrap_or(base.n_embd),
        }
    }
}

fn load_tokenizer(args: &Args, text: &str) -> Result<BPETokenizer> {
    if let Some(path) = &args.tokenizer {
        let tokenizer = BPETokenizer::load(path)
            .with_context(|| format!("failed to load tokenizer from {}", path.display()))?;
        info!(vocab_size = tokenizer.vocab_size(), "loaded tokenizer");
        return Ok(tokenizer);
    }

    let mut tokenizer = BPETokenizer::new();
    tokenizer.train(text, args.bpe_vocab);
    info!(stats = ?tokenizer.stats(), "trained tokenizer");
    if let Some(path) = &args.save_tokenizer {
        tokenizer
            .save(path)
            .with_context(|| format!("failed to save tokenizer to {}", path.display()))?;
        info!(path = %path.display(), "saved tokenizer");
    }
    Ok(tokenizer)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let ctx = RunContext::from_env().context("failed to read the launch environment")?;
    info!(
        rank = ctx.rank,
        local_rank = ctx.local_rank,
        world_size = ctx.world_size,
        "using device: {}",
        ctx.device
    );

    let text = std::fs::read_to_string(&args.data)
        .with_context(|| format!("failed to read {}", args.data.display()))?;
    let tokenizer = load_tokenizer(&args, &text)?;
    let corpus = Corpus::from_tokens(tokenizer.encode(&text));
    info!("loaded {} tokens", corpus.len());

    let train_config = args.train_config();
    let model = match (args.init_from, &args.weights) {
        (Some(kind), Some(path)) => Gpt::from_pretrained(kind, path)
            .with_context(|| format!("failed to import {} from {}", kind, path.display()))?,
        (Some(_), None) => bail!("--init-from needs --weights"),
        (None, _) => {
            let config = args.model_config(tokenizer.vocab_size());
            train_config
                .init_model(config)
                .context("invalid model configuration")?
        }
    };

    let is_master = ctx.is_master();
    let collective = ctx
        .collective()
        .context("failed to join the process group")?;
    let mut trainer = Trainer::new(model, &corpus, train_config, ctx, collective)
        .context("invalid training configuration")?;
    if let Some(path) = args.metrics.as_ref().filter(|_| is_master) {
        let log = MetricsLog::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        trainer = trainer.with_metrics(log);
    }

    let reports = trainer.run().context("training failed")?;
    if let Some(last) = reports.last() {
        info!(final_loss = last.loss, steps = reports.len(), "training complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_rejects_architecture_flags() {
        let base = ["train", "--init-from", "gpt2", "--weights", "model.safetensors"];
        assert!(Args::try_parse_from(base).is_ok());
        for extra in [
            ["--preset", "tiny"],
            ["--n-layer", "4"],
            ["--n-head", "4"],
            ["--n-embd", "64"],
            ["--block-size", "128"],
        ] {
            let argv = base.iter().chain(extra.iter());
            assert!(Args::try_parse_from(argv).is_err(), "{:?} accepted", extra);
        }
    }

    #[test]
    fn test_seed_flag_reaches_train_config() {
        let args = Args::try_parse_from(["train", "--seed", "7"]).unwrap();
        assert_eq!(args.train_config().init_seed, 7);
    }
}
