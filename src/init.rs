//! Parameter initialization
//!
//! A single seeded traversal over the model's components. Every component
//! kind carries its own rule:
//!
//! | Component | Rule |
//! |---|---|
//! | `Linear` (generic) | weight ~ N(0, 0.02), bias = 0 |
//! | `Linear` (residual output) | weight ~ N(0, 0.02 · (2·n_layer)^-½), bias = 0 |
//! | `Embedding` | weight ~ N(0, 0.02) |
//! | `LayerNorm` | gamma = 1, beta = 0 |
//!
//! Residual-output projections add into the residual stream once per
//! sublayer, so their variance is scaled down with depth.
//!
//! The tied output head is not a component: it reads the token embedding
//! table, which is initialized exactly once here.

use crate::error::{GptError, Result};
use crate::layers::{Embedding, LayerNorm, Linear, ProjectionRole};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Base standard deviation for weights and embeddings
pub const INIT_STD: f32 = 0.02;

/// Default generator seed
pub const DEFAULT_INIT_SEED: u64 = 42;

/// One initializable piece of the model
pub enum Component<'a> {
    Linear(&'a mut Linear),
    Embedding(&'a mut Embedding),
    LayerNorm(&'a mut LayerNorm),
}

pub struct Initializer {
    rng: StdRng,
    n_layer: usize,
}

impl Initializer {
    pub fn new(seed: u64, n_layer: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            n_layer,
        }
    }

    /// Standard deviation applied to a projection with the given role
    pub fn weight_std(&self, role: ProjectionRole) -> f32 {
        match role {
            ProjectionRole::Generic => INIT_STD,
            ProjectionRole::ResidualOutput => {
                INIT_STD * (2.0 * self.n_layer as f32).powf(-0.5)
            }
        }
    }

    /// Apply each component's rule in traversal order
    pub fn run<'a>(&mut self, components: impl IntoIterator<Item = Component<'a>>) -> Result<()> {
        for component in components {
            self.apply(component)?;
        }
        Ok(())
    }

    pub fn apply(&mut self, component: Component<'_>) -> Result<()> {
        match component {
            Component::Linear(linear) => {
                let std = self.weight_std(linear.role);
                self.fill_normal(&mut linear.weight.value, std)?;
                fill(&mut linear.bias.value, 0.0);
            }
            Component::Embedding(embedding) => {
                self.fill_normal(&mut embedding.weight.value, INIT_STD)?;
            }
            Component::LayerNorm(norm) => {
                fill(&mut norm.weight.value, 1.0);
                fill(&mut norm.bias.value, 0.0);
            }
        }
        Ok(())
    }

    fn fill_normal(&mut self, tensor: &mut Tensor, std: f32) -> Result<()> {
        let normal = Normal::new(0.0f32, std)
            .map_err(|e| GptError::Config(format!("invalid init std {}: {}", std, e)))?;
        for v in tensor.data.iter_mut() {
            *v = normal.sample(&mut self.rng);
        }
        Ok(())
    }
}

fn fill(tensor: &mut Tensor, value: f32) {
    tensor.data.iter_mut().for_each(|v| *v = value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_std(data: &[f32]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().sum::<f32>() / n;
        (data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n).sqrt()
    }

    #[test]
    fn test_residual_std_for_twelve_layers() {
        let init = Initializer::new(0, 12);
        let expected = 0.02 * 24f32.powf(-0.5);
        assert!((init.weight_std(ProjectionRole::ResidualOutput) - expected).abs() < 1e-9);
        assert_eq!(init.weight_std(ProjectionRole::Generic), 0.02);
    }

    #[test]
    fn test_rules_per_component() {
        let mut init = Initializer::new(DEFAULT_INIT_SEED, 2);
        let mut generic = Linear::new(64, 128, ProjectionRole::Generic);
        let mut residual = Linear::new(64, 128, ProjectionRole::ResidualOutput);
        residual.bias.value.data.iter_mut().for_each(|b| *b = 5.0);
        let mut norm = LayerNorm::new(8);
        norm.weight.value.data.iter_mut().for_each(|g| *g = 3.0);

        init.run([
            Component::Linear(&mut generic),
            Component::Linear(&mut residual),
            Component::LayerNorm(&mut norm),
        ])
        .unwrap();

        let g = sample_std(&generic.weight.value.data);
        let r = sample_std(&residual.weight.value.data);
        assert!((g - 0.02).abs() < 0.002, "generic std {}", g);
        assert!((r - 0.01).abs() < 0.001, "residual std {}", r);
        assert!(residual.bias.value.data.iter().all(|&b| b == 0.0));
        assert!(norm.weight.value.data.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_same_seed_same_values() {
        let mut a = Embedding::new(10, 4);
        let mut b = Embedding::new(10, 4);
        Initializer::new(7, 1).apply(Component::Embedding(&mut a)).unwrap();
        Initializer::new(7, 1).apply(Component::Embedding(&mut b)).unwrap();
        assert_eq!(a.weight.value.data, b.weight.value.data);
    }
}
