//! Index-based kernel evaluators
//!
//! The cache and the solvers never see feature vectors; they ask a
//! [`KernelEvaluator`] for `K(i, j)` by index. This module provides the
//! evaluators used in practice: one over a set of samples, one over an
//! explicit Gram matrix, and a counting wrapper for instrumentation.

use crate::core::{KernelEvaluator, Result, SVMError, Sample, SparseVector};
use crate::kernel::Kernel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Evaluator over the feature vectors of a training set
pub struct SampleKernel<K: Kernel> {
    kernel: Arc<K>,
    vectors: Vec<SparseVector>,
    norms_sq: Vec<f64>,
}

impl<K: Kernel> SampleKernel<K> {
    pub fn new(kernel: Arc<K>, vectors: Vec<SparseVector>) -> Self {
        let norms_sq = vectors.iter().map(SparseVector::norm_squared).collect();
        Self {
            kernel,
            vectors,
            norms_sq,
        }
    }

    /// Build from samples, ignoring their labels
    pub fn from_samples(kernel: Arc<K>, samples: &[Sample]) -> Self {
        Self::new(
            kernel,
            samples.iter().map(|s| s.features.clone()).collect(),
        )
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn vector(&self, i: usize) -> &SparseVector {
        &self.vectors[i]
    }
}

impl<K: Kernel> KernelEvaluator for SampleKernel<K> {
    fn value(&self, i: usize, j: usize) -> f64 {
        self.kernel.compute_with_norms(
            &self.vectors[i],
            &self.vectors[j],
            self.norms_sq[i],
            self.norms_sq[j],
        )
    }

    fn num_vectors(&self) -> usize {
        self.vectors.len()
    }
}

/// Evaluator backed by an explicit, row-major Gram matrix
#[derive(Debug, Clone)]
pub struct PrecomputedKernel {
    n: usize,
    matrix: Vec<f64>,
}

impl PrecomputedKernel {
    pub fn new(n: usize, matrix: Vec<f64>) -> Result<Self> {
        if matrix.len() != n * n {
            return Err(SVMError::DimensionMismatch {
                expected: n * n,
                actual: matrix.len(),
            });
        }
        Ok(Self { n, matrix })
    }

    /// Gram matrix of a kernel over dense points
    pub fn from_fn<F: Fn(usize, usize) -> f64>(n: usize, f: F) -> Self {
        let mut matrix = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                matrix.push(f(i, j));
            }
        }
        Self { n, matrix }
    }
}

impl KernelEvaluator for PrecomputedKernel {
    fn value(&self, i: usize, j: usize) -> f64 {
        self.matrix[i * self.n + j]
    }

    fn num_vectors(&self) -> usize {
        self.n
    }
}

/// Wrapper counting every kernel evaluation that reaches the inner evaluator
pub struct CountingKernel<E: KernelEvaluator> {
    inner: E,
    calls: AtomicU64,
}

impl<E: KernelEvaluator> CountingKernel<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of evaluations so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: KernelEvaluator> KernelEvaluator for CountingKernel<E> {
    fn value(&self, i: usize, j: usize) -> f64 {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.value(i, j)
    }

    fn num_vectors(&self) -> usize {
        self.inner.num_vectors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{LinearKernel, RBFKernel};

    fn points() -> Vec<SparseVector> {
        vec![
            SparseVector::from_dense(&[1.0, 0.0]),
            SparseVector::from_dense(&[0.0, 2.0]),
            SparseVector::from_dense(&[3.0, 1.0]),
        ]
    }

    #[test]
    fn test_sample_kernel_matches_kernel() {
        let kernel = Arc::new(RBFKernel::new(0.5));
        let evaluator = SampleKernel::new(Arc::clone(&kernel), points());

        assert_eq!(evaluator.num_vectors(), 3);
        for i in 0..3 {
            for j in 0..3 {
                let direct = kernel.compute(evaluator.vector(i), evaluator.vector(j));
                assert!((evaluator.value(i, j) - direct).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_sample_kernel_from_samples() {
        let samples = vec![
            Sample::new(SparseVector::from_dense(&[2.0]), 1.0),
            Sample::new(SparseVector::from_dense(&[-1.0]), -1.0),
        ];
        let evaluator = SampleKernel::from_samples(Arc::new(LinearKernel::new()), &samples);
        assert_eq!(evaluator.value(0, 1), -2.0);
        assert_eq!(evaluator.kernel().name(), "linear");
    }

    #[test]
    fn test_precomputed_kernel() {
        let evaluator = PrecomputedKernel::new(2, vec![1.0, 0.5, 0.5, 2.0]).expect("valid");
        assert_eq!(evaluator.value(0, 1), 0.5);
        assert_eq!(evaluator.value(1, 1), 2.0);

        let err = PrecomputedKernel::new(2, vec![1.0]).unwrap_err();
        assert!(matches!(
            err,
            SVMError::DimensionMismatch {
                expected: 4,
                actual: 1
            }
        ));

        let from_fn = PrecomputedKernel::from_fn(3, |i, j| (i * j) as f64);
        assert_eq!(from_fn.value(2, 2), 4.0);
    }

    #[test]
    fn test_counting_kernel() {
        let evaluator = CountingKernel::new(PrecomputedKernel::from_fn(4, |i, j| (i + j) as f64));
        assert_eq!(evaluator.calls(), 0);

        assert_eq!(evaluator.value(1, 2), 3.0);
        assert_eq!(evaluator.value(3, 3), 6.0);
        assert_eq!(evaluator.calls(), 2);

        evaluator.reset();
        assert_eq!(evaluator.calls(), 0);
        assert_eq!(evaluator.inner().num_vectors(), 4);
    }
}
