//! Embedding lookup table
//!
//! Maps integer ids to rows of a `[num_embeddings, dim]` matrix. The backward
//! pass scatters row gradients back into the table; ids that repeat in a
//! batch accumulate.

use crate::param::{join, Param};
use crate::tensor::Tensor;

pub struct Embedding {
    pub weight: Param,
}

impl Embedding {
    pub fn new(num_embeddings: usize, dim: usize) -> Self {
        Self {
            weight: Param::zeros(vec![num_embeddings, dim]),
        }
    }

    pub fn dim(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Gather rows for `ids`; output shape is `leading ++ [dim]`
    ///
    /// Ids must already be range-checked by the caller.
    pub fn forward(&self, ids: &[usize], leading: &[usize]) -> Tensor {
        let dim = self.dim();
        let table = &self.weight.value.data;
        let mut out = Vec::with_capacity(ids.len() * dim);
        for &id in ids {
            out.extend_from_slice(&table[id * dim..(id + 1) * dim]);
        }
        let mut shape = leading.to_vec();
        shape.push(dim);
        Tensor::new(out, shape)
    }

    /// Scatter-add `grad_out` rows into the rows named by `ids`
    pub fn backward(&mut self, grad_out: &Tensor, ids: &[usize]) {
        let dim = self.dim();
        let grad = &mut self.weight.grad.data;
        for (row, &id) in grad_out.data.chunks(dim).zip(ids) {
            for (acc, g) in grad[id * dim..(id + 1) * dim].iter_mut().zip(row) {
                *acc += g;
            }
        }
    }

    pub fn params<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Param)>) {
        out.push((join(prefix, "weight"), &self.weight));
    }

    pub fn params_mut<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Param)>) {
        out.push((join(prefix, "weight"), &mut self.weight));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_scatter() {
        let mut emb = Embedding::new(3, 2);
        emb.weight.value = Tensor::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], vec![3, 2]);
        let out = emb.forward(&[2, 0, 2], &[1, 3]);
        assert_eq!(out.shape, vec![1, 3, 2]);
        assert_eq!(out.data, vec![4.0, 5.0, 0.0, 1.0, 4.0, 5.0]);

        emb.backward(&Tensor::full(vec![1, 3, 2], 1.0), &[2, 0, 2]);
        assert_eq!(emb.weight.grad.data, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }
}
