//! Gradient Utilities
//!
//! Global L2 norm over every parameter gradient, and norm clipping.
//!
//! ## Algorithm
//!
//! ```text
//! norm = √(Σ g²)                  over all parameters
//! if norm > max_norm:
//!     g *= max_norm / (norm + 1e-6)
//! ```
//!
//! Every gradient is scaled by the same factor, so relative magnitudes are
//! preserved. A zero norm is never divided by.

use crate::model::Gpt;
use crate::param::Param;

const CLIP_EPS: f32 = 1e-6;

/// L2 norm of all gradients in the listing
pub fn grad_norm(params: &[(String, &Param)]) -> f32 {
    params
        .iter()
        .map(|(_, p)| p.grad.sum_squares() as f64)
        .sum::<f64>()
        .sqrt() as f32
}

/// Clip the model's gradients in place; returns the norm before clipping
pub fn clip_grad_norm(model: &mut Gpt, max_norm: f32) -> f32 {
    let norm = grad_norm(&model.params());
    if norm > max_norm {
        let scale = max_norm / (norm + CLIP_EPS);
        for (_, p) in model.params_mut() {
            p.grad.scale_in_place(scale);
        }
    }
    norm
}
