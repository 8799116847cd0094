//! Linear Layer (Fully Connected)
//!
//! Performs the affine transformation `y = x @ W^T + b`.
//!
//! ## Layout
//!
//! ```text
//! Input:  x [*, in_features]
//! Weight: W [out_features, in_features]
//! Bias:   b [out_features]
//! Output: y [*, out_features]
//! ```
//!
//! Weights are stored output-major, so `W` has the same layout as an
//! embedding table. That is what allows the output head to reuse the token
//! embedding matrix directly.
//!
//! ## Backward Pass
//!
//! With every leading dimension flattened into rows:
//! ```text
//! grad_W = grad_y^T @ x
//! grad_b = sum(grad_y, rows)
//! grad_x = grad_y @ W
//! ```

use crate::param::{join, Param};
use crate::tensor::Tensor;

/// What a projection feeds into
///
/// Projections that write back into the residual stream get a depth-scaled
/// initialization; everything else uses the base standard deviation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionRole {
    Generic,
    ResidualOutput,
}

/// Linear layer with weight `[out, in]` and bias `[out]`
pub struct Linear {
    pub weight: Param,
    pub bias: Param,
    pub role: ProjectionRole,
}

impl Linear {
    /// Create a zero-filled layer; values are assigned by the initializer
    pub fn new(in_features: usize, out_features: usize, role: ProjectionRole) -> Self {
        Self {
            weight: Param::zeros(vec![out_features, in_features]),
            bias: Param::zeros(vec![out_features]),
            role,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Forward pass over any leading shape
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let rows = x.rows();
        let x2 = x.reshape(&[rows, self.in_features()]);
        let y = x2.matmul_bt(&self.weight.value).add(&self.bias.value);

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        (y.into_shape(&out_shape), LinearCache { x: x2, in_shape: x.shape.clone() })
    }

    /// Accumulate weight/bias gradients and return the input gradient
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LinearCache) -> Tensor {
        let g2 = grad_out.reshape(&[grad_out.rows(), self.out_features()]);

        let grad_weight = g2.transpose(0, 1).matmul(&cache.x);
        self.weight.accumulate(&grad_weight);
        self.bias.accumulate(&g2.sum_leading());

        g2.matmul(&self.weight.value).into_shape(&cache.in_shape)
    }

    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) {
        out.push((join(prefix, "weight"), &self.weight));
        out.push((join(prefix, "bias"), &self.bias));
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Param)>) {
        out.push((join(prefix, "weight"), &mut self.weight));
        out.push((join(prefix, "bias"), &mut self.bias));
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    /// Input flattened to `[rows, in_features]`
    pub x: Tensor,
    pub in_shape: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn layer() -> Linear {
        let mut l = Linear::new(3, 2, ProjectionRole::Generic);
        l.weight.value = Tensor::new(vec![1.0, 0.0, -1.0, 0.5, 2.0, 0.0], vec![2, 3]);
        l.bias.value = Tensor::new(vec![0.1, -0.2], vec![2]);
        l
    }

    #[test]
    fn test_forward_keeps_leading_dims() {
        let l = layer();
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 0.0, 1.0, 0.0], vec![1, 2, 3]);
        let (y, _) = l.forward(&x);
        assert_eq!(y.shape, vec![1, 2, 2]);
        assert_abs_diff_eq!(y.data[0], 1.0 - 3.0 + 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data[1], 0.5 + 4.0 - 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data[3], 2.0 - 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut l = layer();
        let x = Tensor::new(vec![0.3, -0.7, 1.1, 0.2, 0.4, -0.9], vec![2, 3]);
        // loss = sum(y), so grad_y is all ones
        let (y, cache) = l.forward(&x);
        let grad_x = l.backward(&Tensor::full(y.shape.clone(), 1.0), &cache);

        let loss = |l: &Linear, x: &Tensor| l.forward(x).0.data.iter().sum::<f32>();
        let eps = 1e-3;
        for i in 0..x.data.len() {
            let mut xp = x.clone();
            xp.data[i] += eps;
            let mut xm = x.clone();
            xm.data[i] -= eps;
            let numeric = (loss(&l, &xp) - loss(&l, &xm)) / (2.0 * eps);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 1e-2);
        }
        // weight grad of sum(y) is the column sum of x per output row
        assert_abs_diff_eq!(l.weight.grad.data[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(l.weight.grad.data[4], -0.3, epsilon = 1e-6);
        assert_eq!(l.bias.grad.data, vec![2.0, 2.0]);
    }
}
