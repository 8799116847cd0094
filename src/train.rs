//! Training Loop
//!
//! One outer step runs these phases in order:
//!
//! ```text
//! accumulate   micro-steps: next_batch → forward → backward(1/accum)
//!              gradients averaged across processes after the last one
//! synchronize  reporting loss averaged across processes
//! clip         global L2 norm limited to grad_clip
//! schedule     lr = schedule(step), set on every group
//! step         AdamW update
//! report       rank 0 logs timing and throughput
//! ```
//!
//! Gradients are cleared at the start of every step, so they accumulate only
//! over that step's micro-batches.

use crate::config::TrainConfig;
use crate::data::{Corpus, DataLoaderLite};
use crate::distributed::{Collective, RunContext};
use crate::error::{GptError, Result};
use crate::gradients::clip_grad_norm;
use crate::metrics::MetricsLog;
use crate::model::Gpt;
use crate::optimizer::{configure_optimizers, AdamW};
use crate::schedule::LrSchedule;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics for one completed optimizer step
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub step: usize,
    /// Mean loss over every micro-batch on every process
    pub loss: f32,
    pub lr: f32,
    /// Gradient norm before clipping
    pub grad_norm: f32,
    pub step_ms: f32,
    pub tokens_per_sec: f32,
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {}, loss : {} | lr {:.4e} | norm: {:.4} | time: {:.2}ms | tokens/sec: {:.2}",
            self.step, self.loss, self.lr, self.grad_norm, self.step_ms, self.tokens_per_sec
        )
    }
}

pub struct Trainer {
    model: Gpt,
    optimizer: AdamW,
    schedule: LrSchedule,
    loader: DataLoaderLite,
    collective: Box<dyn Collective>,
    ctx: RunContext,
    config: TrainConfig,
    grad_accum_steps: usize,
    metrics: Option<MetricsLog>,
}

impl Trainer {
    /// Validate the run and set up data, schedule and optimizer
    pub fn new(
        model: Gpt,
        corpus: &Corpus,
        config: TrainConfig,
        ctx: RunContext,
        collective: Box<dyn Collective>,
    ) -> Result<Self> {
        config.validate(&model.config)?;
        let grad_accum_steps = config.grad_accum_steps()?;

        if corpus.id_bound() > model.config.vocab_size {
            return Err(GptError::Config(format!(
                "corpus contains token id {} but vocab_size is {}",
                corpus.id_bound() - 1,
                model.config.vocab_size
            )));
        }

        let schedule = LrSchedule::new(
            config.max_lr,
            config.min_lr,
            config.warmup_steps,
            config.max_steps,
        )?;
        let loader = DataLoaderLite::new(corpus, config.micro_batch_size, config.seq_len, &ctx)?;
        let optimizer = configure_optimizers(&model, config.weight_decay, config.max_lr, &ctx.device);

        if ctx.is_master() {
            info!("total desired batch size: {}", config.total_batch_size);
            info!("=> calculated gradient accumulation steps: {}", grad_accum_steps);
        }

        Ok(Self {
            model,
            optimizer,
            schedule,
            loader,
            collective,
            ctx,
            config,
            grad_accum_steps,
            metrics: None,
        })
    }

    /// Also write every step report to a CSV file (rank 0 only)
    pub fn with_metrics(mut self, metrics: MetricsLog) -> Self {
        if self.ctx.is_master() {
            self.metrics = Some(metrics);
        }
        self
    }

    pub fn grad_accum_steps(&self) -> usize {
        self.grad_accum_steps
    }

    pub fn model(&self) -> &Gpt {
        &self.model
    }

    pub fn into_model(self) -> Gpt {
        self.model
    }

    pub fn loader(&self) -> &DataLoaderLite {
        &self.loader
    }

    /// Tokens consumed by one optimizer step across all processes
    pub fn tokens_per_step(&self) -> usize {
        self.config.tokens_per_micro_batch() * self.grad_accum_steps * self.ctx.world_size
    }

    /// Run every configured step, then tear down the process group
    pub fn run(&mut self) -> Result<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(self.config.max_steps);
        for step in 0..self.config.max_steps {
            reports.push(self.train_step(step)?);
        }
        self.collective.shutdown()?;
        Ok(reports)
    }

    pub fn train_step(&mut self, step: usize) -> Result<StepReport> {
        let t0 = Instant::now();

        // accumulate
        self.optimizer.zero_grad(&mut self.model);
        let scale = 1.0 / self.grad_accum_steps as f32;
        let mut loss_accum = 0.0f32;
        for micro_step in 0..self.grad_accum_steps {
            let batch = self.loader.next_batch();
            let (loss, cache) = self.model.forward_train(&batch)?;
            loss_accum += loss * scale;
            self.model.backward(&cache, scale);
            debug!(step, micro_step, loss, "micro-step");
        }
        if self.ctx.is_distributed() {
            self.sync_gradients()?;
        }

        // synchronize
        let mut loss_buf = [loss_accum];
        self.collective.all_reduce_mean(&mut loss_buf)?;
        let loss = loss_buf[0];

        // clip
        let grad_norm = clip_grad_norm(&mut self.model, self.config.grad_clip);

        // schedule
        let lr = self.schedule.get_lr(step);
        self.optimizer.set_lr(lr);

        // step
        self.optimizer.step(&mut self.model);

        // report
        let elapsed = t0.elapsed().as_secs_f32();
        let report = StepReport {
            step,
            loss,
            lr,
            grad_norm,
            step_ms: elapsed * 1000.0,
            tokens_per_sec: self.tokens_per_step() as f32 / elapsed.max(f32::EPSILON),
        };
        if self.ctx.is_master() {
            info!("{}", report);
            if let Some(metrics) = self.metrics.as_mut() {
                metrics.log(&report)?;
            }
        }
        Ok(report)
    }

    /// Average every gradient across processes in one flat buffer
    fn sync_gradients(&mut self) -> Result<()> {
        let mut flat = flatten_grads(&self.model);
        self.collective.all_reduce_mean(&mut flat)?;
        write_back_grads(&mut self.model, &flat);
        Ok(())
    }
}

/// Concatenate all gradients in parameter order
pub fn flatten_grads(model: &Gpt) -> Vec<f32> {
    let params = model.params();
    let mut flat = Vec::with_capacity(params.iter().map(|(_, p)| p.numel()).sum());
    for (_, p) in params {
        flat.extend_from_slice(&p.grad.data);
    }
    flat
}

/// Inverse of [`flatten_grads`]
pub fn write_back_grads(model: &mut Gpt, flat: &[f32]) {
    let mut offset = 0;
    for (_, p) in model.params_mut() {
        let n = p.numel();
        p.grad.data.copy_from_slice(&flat[offset..offset + n]);
        offset += n;
    }
    assert_eq!(offset, flat.len(), "flat gradient length mismatch");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::distributed::SingleProcess;

    fn setup(total_batch_size: usize) -> Trainer {
        let model = Gpt::new(ModelConfig {
            block_size: 8,
            vocab_size: 16,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
        })
        .unwrap();
        let corpus = Corpus::from_tokens((0..400).map(|i| i % 16).collect());
        let config = TrainConfig {
            total_batch_size,
            micro_batch_size: 2,
            seq_len: 8,
            warmup_steps: 2,
            max_steps: 5,
            ..TrainConfig::default()
        };
        Trainer::new(model, &corpus, config, RunContext::single(), Box::new(SingleProcess)).unwrap()
    }

    #[test]
    fn test_report_line_format() {
        let report = StepReport {
            step: 7,
            loss: 3.25,
            lr: 6e-4,
            grad_norm: 1.23456,
            step_ms: 150.0,
            tokens_per_sec: 3495.2533,
        };
        assert_eq!(
            report.to_string(),
            "step 7, loss : 3.25 | lr 6.0000e-4 | norm: 1.2346 | time: 150.00ms | tokens/sec: 3495.25"
        );
    }

    #[test]
    fn test_accumulation_consumes_micro_batches() {
        let mut trainer = setup(64);
        assert_eq!(trainer.grad_accum_steps(), 4);
        assert_eq!(trainer.tokens_per_step(), 64);
        let report = trainer.train_step(0).unwrap();
        assert_eq!(trainer.loader().position(), 64);
        assert!(report.loss > 0.0);
        assert_eq!(report.lr, 6e-4 / 2.0);
    }

    #[test]
    fn test_accumulation_ignores_world_size() {
        let model = Gpt::new(ModelConfig::tiny(16)).unwrap();
        let corpus = Corpus::from_tokens((0..400).map(|i| i % 16).collect());
        let config = TrainConfig {
            total_batch_size: 192,
            micro_batch_size: 2,
            seq_len: 8,
            ..TrainConfig::default()
        };
        let trainer = Trainer::new(
            model,
            &corpus,
            config,
            RunContext::for_rank(1, 2),
            Box::new(SingleProcess),
        )
        .unwrap();
        assert_eq!(trainer.grad_accum_steps(), 12);
        assert_eq!(trainer.tokens_per_step(), 384);
    }

    #[test]
    fn test_indivisible_batch_rejected() {
        let model = Gpt::new(ModelConfig::tiny(16)).unwrap();
        let corpus = Corpus::from_tokens(vec![1; 500]);
        let config = TrainConfig {
            total_batch_size: 100,
            micro_batch_size: 2,
            seq_len: 8,
            ..TrainConfig::default()
        };
        let result = Trainer::new(model, &corpus, config, RunContext::single(), Box::new(SingleProcess));
        assert!(matches!(result, Err(GptError::Config(_))));
    }

    #[test]
    fn test_flatten_and_write_back() {
        let mut model = setup(16).into_model();
        for (i, (_, p)) in model.params_mut().into_iter().enumerate() {
            p.grad.data.iter_mut().for_each(|g| *g = i as f32);
        }
        let mut flat = flatten_grads(&model);
        assert_eq!(flat.len(), model.num_params());
        flat.iter_mut().for_each(|g| *g *= 2.0);
        write_back_grads(&mut model, &flat);
        assert!(model.ln_f.bias.grad.data.iter().all(|&g| g == 2.0 * 15.0));
    }
}
