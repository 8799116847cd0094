//! Pretrained GPT-2 Import
//!
//! Loads the published GPT-2 weights from a local safetensors file into a
//! [`Gpt`] of the matching size.
//!
//! The published checkpoints store the four block projections
//! (`attn.c_attn`, `attn.c_proj`, `mlp.c_fc`, `mlp.c_proj`) as `[in, out]`
//! matrices; [`Linear`](crate::layers::Linear) keeps `[out, in]`, so those
//! weights are transposed while copying. Everything else is copied as is.
//!
//! Accepted naming variants:
//!
//! - names with or without the `transformer.` prefix
//! - causal-mask buffers (`*.attn.bias`, `*.attn.masked_bias`), ignored
//! - `lm_head.weight`, shape-checked against the tied embedding, not copied

use crate::config::ModelConfig;
use crate::error::{GptError, Result};
use crate::model::Gpt;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const PREFIX: &str = "transformer.";
const LM_HEAD: &str = "lm_head.weight";
const IGNORED_SUFFIXES: [&str; 2] = [".attn.bias", ".attn.masked_bias"];
const TRANSPOSED_SUFFIXES: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

/// Published GPT-2 sizes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PretrainedModel {
    Gpt2,
    Gpt2Medium,
    Gpt2Large,
    Gpt2Xl,
}

impl PretrainedModel {
    pub fn config(self) -> ModelConfig {
        let (n_layer, n_head, n_embd) = match self {
            PretrainedModel::Gpt2 => (12, 12, 768),        // 124M
            PretrainedModel::Gpt2Medium => (24, 16, 1024), // 350M
            PretrainedModel::Gpt2Large => (36, 20, 1280),  // 774M
            PretrainedModel::Gpt2Xl => (48, 25, 1600),     // 1558M
        };
        ModelConfig {
            block_size: 1024,
            vocab_size: 50257,
            n_layer,
            n_head,
            n_embd,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PretrainedModel::Gpt2 => "gpt2",
            PretrainedModel::Gpt2Medium => "gpt2-medium",
            PretrainedModel::Gpt2Large => "gpt2-large",
            PretrainedModel::Gpt2Xl => "gpt2-xl",
        }
    }
}

impl fmt::Display for PretrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PretrainedModel {
    type Err = GptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gpt2" => Ok(PretrainedModel::Gpt2),
            "gpt2-medium" => Ok(PretrainedModel::Gpt2Medium),
            "gpt2-large" => Ok(PretrainedModel::Gpt2Large),
            "gpt2-xl" => Ok(PretrainedModel::Gpt2Xl),
            other => Err(GptError::Config(format!(
                "unknown pretrained model '{}', expected gpt2, gpt2-medium, gpt2-large or gpt2-xl",
                other
            ))),
        }
    }
}

impl Gpt {
    /// Build a model of the given size and load its published weights
    pub fn from_pretrained<P: AsRef<Path>>(kind: PretrainedModel, weights: P) -> Result<Self> {
        info!("loading weights from pretrained gpt: {}", kind);
        let mut model = Gpt::new(kind.config())?;
        load_safetensors(&mut model, weights)?;
        Ok(model)
    }
}

/// Copy every parameter of `model` from a safetensors file
pub fn load_safetensors<P: AsRef<Path>>(model: &mut Gpt, path: P) -> Result<()> {
    let bytes = std::fs::read(path)?;
    load_safetensors_bytes(model, &bytes)
}

/// Copy every parameter of `model` from serialized safetensors data
///
/// Nothing is written unless the name sets, dtypes and shapes all match.
pub fn load_safetensors_bytes(model: &mut Gpt, bytes: &[u8]) -> Result<()> {
    let file = SafeTensors::deserialize(bytes)?;

    let mut source: HashMap<String, TensorView<'_>> = HashMap::new();
    let mut lm_head = None;
    for (name, view) in file.tensors() {
        if IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        if name == LM_HEAD {
            lm_head = Some(view);
            continue;
        }
        let canonical = if name.starts_with(PREFIX) {
            name
        } else {
            format!("{}{}", PREFIX, name)
        };
        if source.contains_key(&canonical) {
            return Err(mismatch(format!("tensor {} appears twice", canonical)));
        }
        source.insert(canonical, view);
    }

    let params = model.params_mut();
    let count = params.len();

    let expected: BTreeSet<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
    let found: BTreeSet<&str> = source.keys().map(String::as_str).collect();
    if expected != found {
        let missing: Vec<_> = expected.difference(&found).take(5).collect();
        let unexpected: Vec<_> = found.difference(&expected).take(5).collect();
        return Err(mismatch(format!(
            "name sets differ (missing {:?}, unexpected {:?})",
            missing, unexpected
        )));
    }

    // Validate everything before the first write
    let mut plan = Vec::with_capacity(params.len());
    for (name, param) in params.iter() {
        let view = &source[name];
        let transposed = TRANSPOSED_SUFFIXES.iter().any(|s| name.ends_with(s));
        let want: Vec<usize> = if transposed {
            param.shape().iter().rev().copied().collect()
        } else {
            param.shape().to_vec()
        };
        check_view(name, view, &want)?;
        plan.push(transposed);
    }
    if let Some(view) = &lm_head {
        let wte = params[0].1.shape().to_vec();
        check_view(LM_HEAD, view, &wte)?;
    }

    for ((name, param), transposed) in params.into_iter().zip(plan) {
        let values = decode_f32(source[&name].data());
        if transposed {
            // [in, out] → [out, in]
            let (out_f, in_f) = (param.shape()[0], param.shape()[1]);
            let dst = &mut param.value.data;
            for i in 0..in_f {
                for o in 0..out_f {
                    dst[o * in_f + i] = values[i * out_f + o];
                }
            }
        } else {
            param.value.data.copy_from_slice(&values);
        }
    }

    info!(tensors = count, "pretrained weights loaded");
    Ok(())
}

fn check_view(name: &str, view: &TensorView<'_>, shape: &[usize]) -> Result<()> {
    if view.dtype() != Dtype::F32 {
        return Err(mismatch(format!(
            "{} has dtype {:?}, only F32 is supported",
            name,
            view.dtype()
        )));
    }
    if view.shape() != shape {
        return Err(mismatch(format!(
            "{} has shape {:?}, expected {:?}",
            name,
            view.shape(),
            shape
        )));
    }
    Ok(())
}

fn decode_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn mismatch(msg: String) -> GptError {
    GptError::CheckpointMismatch(msg)
}
