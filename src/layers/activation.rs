//! GELU activation
//!
//! Uses the tanh approximation that GPT-2 was trained with:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! Imported GPT-2 weights assume exactly this form, so the exact erf
//! variant is not offered.

use crate::tensor::Tensor;
use rayon::prelude::*;

const GELU_COEFF: f32 = 0.044715;

#[inline]
fn sqrt_2_over_pi() -> f32 {
    (2.0 / std::f32::consts::PI).sqrt()
}

/// GELU activation (forward pass), applied element-wise in parallel
pub fn gelu_forward(x: &Tensor) -> Tensor {
    let k = sqrt_2_over_pi();
    let result = x
        .data
        .par_iter()
        .map(|&v| 0.5 * v * (1.0 + (k * (v + GELU_COEFF * v * v * v)).tanh()))
        .collect();
    Tensor::new(result, x.shape.clone())
}

/// Gradient of GELU with respect to its input
///
/// `x` is the pre-activation saved by the forward pass.
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let k = sqrt_2_over_pi();
    let grad: Vec<f32> = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&v, &g)| {
            let t = (k * (v + GELU_COEFF * v * v * v)).tanh();
            let sech_sq = 1.0 - t * t;
            let local = 0.5 * (1.0 + t) + 0.5 * v * sech_sq * k * (1.0 + 3.0 * GELU_COEFF * v * v);
            g * local
        })
        .collect();
    Tensor::new(grad, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_gelu_reference_points() {
        let x = Tensor::new(vec![0.0, 1.0, -1.0, 3.0], vec![4]);
        let y = gelu_forward(&x);
        assert_abs_diff_eq!(y.data[0], 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(y.data[1], 0.841192, epsilon = 1e-4);
        assert_abs_diff_eq!(y.data[2], -0.158808, epsilon = 1e-4);
        assert_abs_diff_eq!(y.data[3], 2.996363, epsilon = 1e-4);
    }

    #[test]
    fn test_gelu_backward_matches_finite_difference() {
        let eps = 1e-3;
        for &v in &[-2.0f32, -0.5, 0.0, 0.7, 1.9] {
            let x = Tensor::new(vec![v], vec![1]);
            let analytic = gelu_backward(&Tensor::new(vec![1.0], vec![1]), &x).data[0];
            let plus = gelu_forward(&Tensor::new(vec![v + eps], vec![1])).data[0];
            let minus = gelu_forward(&Tensor::new(vec![v - eps], vec![1])).data[0];
            assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * eps), epsilon = 1e-3);
        }
    }
}
