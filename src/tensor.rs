//! Tensor Operations for Neural Networks
//!
//! A minimal dense tensor tailored to the transformer in this crate.
//! Tensors store multi-dimensional arrays with shape and stride information.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! Most layers treat a `[batch, seq, channels]` activation as a stack of
//! `batch * seq` independent rows, so the row helpers (`rows`, `last_dim`,
//! `sum_leading`) carry most of the weight. Attention is the only consumer
//! of the 4-D batched matmul.
//!
//! ## Example
//!
//! ```rust
//! use gpt2_trainer::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let w = Tensor::new(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![2, 3]);
//! // a @ w^T, the layout used by linear layers
//! let y = a.matmul_bt(&w);
//! assert_eq!(y.shape, vec![2, 2]);
//! assert_eq!(y.data, vec![1.0, 2.0, 4.0, 5.0]);
//! ```
//!
//! ## Parallelism
//!
//! Matrix products, softmax and the element-wise kernels run on Rayon's
//! global pool. Tiny products stay sequential to skip scheduling overhead.

use rayon::prelude::*;

/// A multi-dimensional array for neural network computations
///
/// For shape `[2, 3]` data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the innermost dimension
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of rows when every leading dimension is flattened together
    pub fn rows(&self) -> usize {
        match self.last_dim() {
            0 => 0,
            d => self.data.len() / d,
        }
    }

    /// Structured for auto-vectorization: `result[j] += a_val * b[j]`
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: batched `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`,
    ///   each (batch, head) pair processed independently in parallel
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let n = other.shape[1];
            let k = self.shape[1];

            if m * n * k >= 1_000 {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for l in 0..k {
                        sum += self.data[i * k + l] * other.data[l * n + j];
                    }
                    result[i * n + j] = sum;
                }
            }

            return Tensor::new(result, vec![m, n]);
        }

        if self.shape.len() == 4 && other.shape.len() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let seq1 = self.shape[2];
            let inner_dim = self.shape[3];
            let seq2 = other.shape[3];

            assert_eq!(
                &self.shape[..2],
                &other.shape[..2],
                "Batch dimensions must match for batched matmul"
            );
            assert_eq!(
                other.shape[2], inner_dim,
                "Inner dimensions must match for batched matmul"
            );

            let mut result = vec![0.0; batch * n_heads * seq1 * seq2];
            if result.is_empty() {
                return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
            }

            result
                .par_chunks_mut(seq1 * seq2)
                .enumerate()
                .for_each(|(bh, chunk)| {
                    let lhs = &self.data[bh * seq1 * inner_dim..(bh + 1) * seq1 * inner_dim];
                    let rhs = &other.data[bh * inner_dim * seq2..(bh + 1) * inner_dim * seq2];
                    for i in 0..seq1 {
                        let out_row = &mut chunk[i * seq2..(i + 1) * seq2];
                        for l in 0..inner_dim {
                            Self::matmul_inner_simd(
                                lhs[i * inner_dim + l],
                                &rhs[l * seq2..(l + 1) * seq2],
                                out_row,
                            );
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Processes 8×8 blocks so the working set stays in L1 and distributes
    /// row blocks across cores.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::matmul_inner_simd(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Multiply by the transpose of a row-major matrix: `[m, k] @ [n, k]^T -> [m, n]`
    ///
    /// Both operands are walked row by row, so no transposed copy of `other`
    /// is materialized. Linear layers store weights as `[out, in]` and use
    /// this for their forward pass.
    pub fn matmul_bt(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape.len(), 2, "matmul_bt expects a 2D left operand");
        assert_eq!(other.shape.len(), 2, "matmul_bt expects a 2D right operand");
        assert_eq!(
            self.shape[1], other.shape[1],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]^T",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let n = other.shape[0];
        let k = self.shape[1];

        let mut result = vec![0.0; m * n];
        if result.is_empty() {
            return Tensor::new(result, vec![m, n]);
        }

        result.par_chunks_mut(n).enumerate().for_each(|(i, out_row)| {
            let a_row = &self.data[i * k..(i + 1) * k];
            for (j, out) in out_row.iter_mut().enumerate() {
                let b_row = &other.data[j * k..(j + 1) * k];
                *out = a_row.iter().zip(b_row).map(|(a, b)| a * b).sum();
            }
        });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax over the last axis
    ///
    /// Uses the numerically stable form `exp(x - max) / sum(exp(x - max))`.
    /// Rows that are entirely `-inf` would produce NaN; the causal mask never
    /// creates one because the diagonal is always visible.
    pub fn softmax_last(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();
        if cols == 0 {
            return Tensor::new(result, self.shape.clone());
        }

        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for val in row.iter_mut() {
                *val = (*val - max).exp();
                sum += *val;
            }
            for val in row.iter_mut() {
                *val /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting support
    ///
    /// 1. **Exact match**: Same shape
    /// 2. **Broadcast batch**: `[batch, seq, dim] + [seq, dim]`
    /// 3. **Broadcast last dim**: `[*, n] + [n]` (bias addition)
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() == 3 && other.shape.len() == 2 {
            let seq_len = self.shape[1];
            let dim = self.shape[2];

            assert_eq!(
                other.shape[0], seq_len,
                "Sequence length must match for broadcasting"
            );
            assert_eq!(
                other.shape[1], dim,
                "Dimension must match for broadcasting"
            );

            let plane = seq_len * dim;
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % plane])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() && other.data.len() == self.last_dim() {
            let last_dim = self.last_dim();
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place element-wise accumulation of a same-shaped tensor
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for accumulation"
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Scale all elements in place
    pub fn scale_in_place(&mut self, scalar: f32) {
        self.data.par_iter_mut().for_each(|x| *x *= scalar);
    }

    /// Sum of squared elements
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&x| x * x).sum()
    }

    /// Sum over every leading dimension, leaving a `[last_dim]` vector
    ///
    /// This is the bias gradient of a row-wise affine map.
    pub fn sum_leading(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols.max(1)) {
            for (acc, &v) in result.iter_mut().zip(row) {
                *acc += v;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Reshape tensor to new shape (copies the data)
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        self.clone().into_shape(new_shape)
    }

    /// Reshape without copying the data
    pub fn into_shape(self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data, new_shape.to_vec())
    }

    /// Transpose two dimensions (supports negative indexing)
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let ndim = self.shape.len() as isize;

        let d1 = if dim1 < 0 { ndim + dim1 } else { dim1 } as usize;
        let d2 = if dim2 < 0 { ndim + dim2 } else { dim2 } as usize;

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];

            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }

            return Tensor::new(result, new_shape);
        }

        // General case: walk the output in order and map back through the
        // permuted strides of the source
        let out_strides = Self::compute_strides(&new_shape);
        let mut src_strides = self.strides.clone();
        src_strides.swap(d1, d2);

        let result: Vec<f32> = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (&out_stride, &src_stride) in out_strides.iter().zip(&src_strides) {
                    let coord = remaining / out_stride;
                    remaining %= out_stride;
                    src += coord * src_stride;
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Fill the strictly upper-triangular part of every trailing `[seq, seq]`
    /// matrix with `value`
    ///
    /// Row `i` keeps columns `0..=i`. Used with `-inf` before the attention
    /// softmax so position `i` never sees positions after it.
    pub fn causal_fill(&self, value: f32) -> Tensor {
        assert!(self.shape.len() >= 2, "causal_fill needs at least 2 dims");
        let seq = self.last_dim();
        assert_eq!(
            self.shape[self.shape.len() - 2],
            seq,
            "causal_fill expects square trailing matrices"
        );

        let mut result = self.data.clone();
        if seq == 0 {
            return Tensor::new(result, self.shape.clone());
        }
        result.par_chunks_mut(seq * seq).for_each(|matrix| {
            for i in 0..seq {
                for v in &mut matrix[i * seq + i + 1..(i + 1) * seq] {
                    *v = value;
                }
            }
        });
        Tensor::new(result, self.shape.clone())
    }
}
