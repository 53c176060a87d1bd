//! Core traits for the SVM solver

use crate::core::{Prediction, Sample};

/// Index-based access to an implicit kernel matrix
///
/// Implementations must be deterministic and safe to call concurrently
/// for distinct `(i, j)` pairs: the cache fills rows from several worker
/// threads at once.
pub trait KernelEvaluator: Send + Sync {
    /// Kernel value `K(i, j)`
    fn value(&self, i: usize, j: usize) -> f64;

    /// Number of vectors the kernel is defined over
    fn num_vectors(&self) -> usize;
}

impl<E: KernelEvaluator + ?Sized> KernelEvaluator for std::sync::Arc<E> {
    fn value(&self, i: usize, j: usize) -> f64 {
        (**self).value(i, j)
    }

    fn num_vectors(&self) -> usize {
        (**self).num_vectors()
    }
}

/// Per-example labels used by the pair update rule
pub trait LabelProvider {
    fn label(&self, i: usize) -> f64;

    fn num_labels(&self) -> usize;
}

impl LabelProvider for [f64] {
    fn label(&self, i: usize) -> f64 {
        self[i]
    }

    fn num_labels(&self) -> usize {
        self.len()
    }
}

impl LabelProvider for Vec<f64> {
    fn label(&self, i: usize) -> f64 {
        self[i]
    }

    fn num_labels(&self) -> usize {
        self.len()
    }
}

/// Observer for convergence checks
///
/// Called with `(iteration, QP, QD)` after every duality gap evaluation.
pub trait ProgressSink {
    fn report(&mut self, iteration: usize, primal: f64, dual: f64);
}

impl<F: FnMut(usize, f64, f64)> ProgressSink for F {
    fn report(&mut self, iteration: usize, primal: f64, dual: f64) {
        self(iteration, primal, dual)
    }
}

/// Progress sink that discards every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _iteration: usize, _primal: f64, _dual: f64) {}
}

/// Progress sink that writes each report to the debug log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&mut self, iteration: usize, primal: f64, dual: f64) {
        log::debug!(
            "iteration {}: QP={:.8} QD={:.8} gap={:.3e}",
            iteration,
            primal,
            dual,
            primal - dual
        );
    }
}

/// Trained SVM model
pub trait SVMModel: Send + Sync {
    /// Predict a single sample
    fn predict(&self, sample: &Sample) -> Prediction;

    /// Predict multiple samples
    fn predict_batch(&self, samples: &[Sample]) -> Vec<Prediction> {
        samples.iter().map(|s| self.predict(s)).collect()
    }

    /// Get the number of support vectors
    fn n_support_vectors(&self) -> usize;

    /// Get the bias term
    fn bias(&self) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_progress_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |it: usize, qp: f64, qd: f64| seen.push((it, qp, qd));
            sink.report(1, -0.5, -0.75);
            sink.report(2, -0.6, -0.6);
        }
        assert_eq!(seen, vec![(1, -0.5, -0.75), (2, -0.6, -0.6)]);
    }

    #[test]
    fn test_slice_labels() {
        let labels = vec![1.0, -1.0, 1.0];
        assert_eq!(labels.num_labels(), 3);
        assert_eq!(labels.label(1), -1.0);
        assert_eq!(labels[..].label(2), 1.0);
    }
}
