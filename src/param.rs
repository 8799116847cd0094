//! Trainable parameters
//!
//! Every learnable tensor in the model is a [`Param`]: a value and a gradient
//! buffer of the same shape. Backward passes *accumulate* into `grad`, so
//! several micro-batches can contribute before a single optimizer step, and
//! a tensor shared by two consumers (the tied embedding / output head)
//! naturally receives the sum of both contributions.
//!
//! Parameters are addressed by dotted names in a fixed traversal order.
//! That order is the contract between the model, the optimizer state, the
//! gradient sync buffer and checkpoint import.

use crate::tensor::Tensor;

/// A learnable tensor together with its accumulated gradient
#[derive(Clone, Debug)]
pub struct Param {
    pub value: Tensor,
    pub grad: Tensor,
}

impl Param {
    pub fn new(value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self { value, grad }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::new(Tensor::zeros(shape))
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::new(Tensor::full(shape, 1.0))
    }

    pub fn shape(&self) -> &[usize] {
        &self.value.shape
    }

    /// Tensor rank; the optimizer groups parameters on this
    pub fn rank(&self) -> usize {
        self.value.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.value.data.len()
    }

    pub fn zero_grad(&mut self) {
        self.grad.data.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Add `grad` into the accumulated gradient
    ///
    /// # Panics
    ///
    /// Panics if the element count differs from the parameter's
    pub fn accumulate(&mut self, grad: &Tensor) {
        assert_eq!(
            self.grad.data.len(),
            grad.data.len(),
            "gradient for parameter of shape {:?} has shape {:?}",
            self.grad.shape,
            grad.shape
        );
        for (acc, g) in self.grad.data.iter_mut().zip(&grad.data) {
            *acc += g;
        }
    }
}

/// Join a prefix and a local name with a dot, tolerating an empty prefix
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Total element count of a parameter listing
pub fn count_elements(params: &[(String, &Param)]) -> usize {
    params.iter().map(|(_, p)| p.numel()).sum()
}
