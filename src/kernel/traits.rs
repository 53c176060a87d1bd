//! Kernel trait definition

use crate::core::SparseVector;

/// Kernel function over feature vectors
///
/// A kernel function K(x, y) must satisfy Mercer's condition for the dual
/// problem to be convex. [`crate::kernel::SampleKernel`] lifts any `Kernel`
/// into the index-based [`crate::core::KernelEvaluator`] the cache consumes.
pub trait Kernel: Send + Sync {
    /// Compute kernel value K(x, y)
    fn compute(&self, x: &SparseVector, y: &SparseVector) -> f64;

    /// Compute K(x, y) given precomputed squared norms of both vectors
    ///
    /// Kernels that depend on distances override this; the default ignores
    /// the norms.
    fn compute_with_norms(
        &self,
        x: &SparseVector,
        y: &SparseVector,
        x_norm_sq: f64,
        y_norm_sq: f64,
    ) -> f64 {
        let _ = (x_norm_sq, y_norm_sq);
        self.compute(x, y)
    }

    /// Short name used in log messages
    fn name(&self) -> &'static str;
}
