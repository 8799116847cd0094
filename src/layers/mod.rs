//! Neural Network Layers
//!
//! Every trainable layer follows the same pattern:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, Cache) { }
//!     pub fn backward(&mut self, grad: &Tensor, cache: &Cache) -> Tensor { }
//!     pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) { }
//! }
//! ```
//!
//! `forward` is pure and returns whatever the backward pass will need.
//! `backward` accumulates parameter gradients into each [`Param`] and
//! returns the gradient with respect to the layer input.
//!
//! [`Param`]: crate::param::Param

pub mod activation;
pub mod attention;
pub mod block;
pub mod embedding;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{AttentionCache, CausalSelfAttention};
pub use block::{Block, BlockCache};
pub use embedding::Embedding;
pub use layer_norm::{LayerNorm, LayerNormCache, LAYER_NORM_EPS};
pub use linear::{Linear, LinearCache, ProjectionRole};
pub use mlp::{Mlp, MlpCache};
