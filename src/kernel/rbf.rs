//! RBF (Radial Basis Function) kernel implementation
//!
//! K(x, y) = exp(-γ * ||x - y||²)

use crate::core::SparseVector;
use crate::kernel::linear::dot_product_sparse;
use crate::kernel::Kernel;

/// RBF kernel with width parameter gamma
#[derive(Debug, Clone, Copy)]
pub struct RBFKernel {
    gamma: f64,
}

impl RBFKernel {
    /// Create a new RBF kernel
    ///
    /// # Panics
    /// Panics if gamma is not positive
    pub fn new(gamma: f64) -> Self {
        assert!(gamma > 0.0, "Gamma must be positive, got: {}", gamma);
        Self { gamma }
    }

    /// Create RBF kernel with gamma = 1.0 / n_features
    pub fn with_auto_gamma(n_features: usize) -> Self {
        assert!(n_features > 0, "Number of features must be positive");
        Self::new(1.0 / n_features as f64)
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

impl Default for RBFKernel {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Kernel for RBFKernel {
    fn compute(&self, x: &SparseVector, y: &SparseVector) -> f64 {
        (-self.gamma * squared_euclidean_distance(x, y)).exp()
    }

    fn compute_with_norms(
        &self,
        x: &SparseVector,
        y: &SparseVector,
        x_norm_sq: f64,
        y_norm_sq: f64,
    ) -> f64 {
        // ||x - y||² = ||x||² + ||y||² - 2*x^T*y, clamped against rounding
        let squared_distance = (x_norm_sq + y_norm_sq - 2.0 * dot_product_sparse(x, y)).max(0.0);
        (-self.gamma * squared_distance).exp()
    }

    fn name(&self) -> &'static str {
        "rbf"
    }
}

/// Squared Euclidean distance between two sparse vectors
fn squared_euclidean_distance(x: &SparseVector, y: &SparseVector) -> f64 {
    let mut distance_sq = 0.0;
    let mut i = 0;
    let mut j = 0;

    while i < x.indices.len() && j < y.indices.len() {
        match x.indices[i].cmp(&y.indices[j]) {
            std::cmp::Ordering::Equal => {
                let diff = x.values[i] - y.values[j];
                distance_sq += diff * diff;
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                distance_sq += x.values[i] * x.values[i];
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                distance_sq += y.values[j] * y.values[j];
                j += 1;
            }
        }
    }

    distance_sq += x.values[i..].iter().map(|v| v * v).sum::<f64>();
    distance_sq += y.values[j..].iter().map(|v| v * v).sum::<f64>();

    distance_sq
}
