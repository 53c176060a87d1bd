//! Core type definitions for the SVM solver

use serde::{Deserialize, Serialize};

/// Prediction result containing label and decision value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Predicted class label (+1 or -1)
    pub label: f64,
    /// Raw decision function value
    pub decision_value: f64,
}

impl Prediction {
    pub fn new(label: f64, decision_value: f64) -> Self {
        Self {
            label,
            decision_value,
        }
    }

    /// Get confidence as absolute value of decision value
    pub fn confidence(&self) -> f64 {
        self.decision_value.abs()
    }
}

/// Sparse vector representation with sorted indices
#[derive(Clone, Debug, PartialEq)]
pub struct SparseVector {
    /// Sorted indices of non-zero elements
    pub indices: Vec<usize>,
    /// Values corresponding to indices
    pub values: Vec<f64>,
}

impl SparseVector {
    /// Create a new sparse vector, ensuring indices are sorted
    pub fn new(indices: Vec<usize>, values: Vec<f64>) -> Self {
        assert_eq!(
            indices.len(),
            values.len(),
            "Indices and values must have same length"
        );

        let mut pairs: Vec<_> = indices.into_iter().zip(values).collect();
        pairs.sort_by_key(|&(idx, _)| idx);

        let (indices, values): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self { indices, values }
    }

    /// Build a sparse vector from a dense slice, dropping exact zeros
    pub fn from_dense(values: &[f64]) -> Self {
        let (indices, values) = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, &v)| (i, v))
            .unzip();
        Self { indices, values }
    }

    pub fn empty() -> Self {
        Self {
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Get the value at a specific index (0 if not present)
    pub fn get(&self, index: usize) -> f64 {
        match self.indices.binary_search(&index) {
            Ok(pos) => self.values[pos],
            Err(_) => 0.0,
        }
    }

    /// Compute squared L2 norm
    pub fn norm_squared(&self) -> f64 {
        self.values.iter().map(|&v| v * v).sum()
    }

    /// Number of non-zero elements
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Training sample with features and target
///
/// For classification the target is the class label (+1 or -1), for
/// regression it is the real-valued response.
#[derive(Clone, Debug)]
pub struct Sample {
    pub features: SparseVector,
    pub label: f64,
}

impl Sample {
    pub fn new(features: SparseVector, label: f64) -> Self {
        Self { features, label }
    }
}

/// Why the solver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitFlag {
    /// Iteration budget exhausted before any stopping rule fired
    MaxIterations,
    /// `QP - QD <= |QP| * tol_rel`
    RelativeTolerance,
    /// `QP - QD <= tol_abs`
    AbsoluteTolerance,
    /// `QP <= objective_threshold`
    ObjectiveThreshold,
    /// No violating pair left on the full problem
    Converged,
    /// The duality gap stopped decreasing across unshrink passes
    Stalled,
}

impl ExitFlag {
    /// Whether the run ended on a stopping rule rather than a budget or a stall
    pub fn is_converged(&self) -> bool {
        !matches!(self, ExitFlag::MaxIterations | ExitFlag::Stalled)
    }
}

/// Primal and dual objective values at a convergence check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QpState {
    /// Primal objective `QP`
    pub primal: f64,
    /// Dual lower bound `QD`
    pub dual: f64,
}

impl QpState {
    pub fn new(primal: f64, dual: f64) -> Self {
        Self { primal, dual }
    }

    /// Duality gap `QP - QD`
    pub fn gap(&self) -> f64 {
        self.primal - self.dual
    }
}

/// Result of a working-set optimisation run
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    /// Solution vector, one entry per optimisation variable
    pub alpha: Vec<f64>,
    /// Gradient `Q alpha + p`, valid for every variable
    pub gradient: Vec<f64>,
    /// Bias term of the decision function
    pub bias: f64,
    /// Number of pair updates performed
    pub iterations: usize,
    pub exit_flag: ExitFlag,
    /// Objective values of the returned solution
    pub state: QpState,
    /// Number of times shrunk variables were reactivated
    pub unshrinks: usize,
    /// Variables still in the working set when the solver stopped
    pub active_size: usize,
}

impl SolverOutcome {
    /// Indices with `alpha > threshold`
    pub fn support_vectors(&self, threshold: f64) -> Vec<usize> {
        self.alpha
            .iter()
            .enumerate()
            .filter_map(|(i, &a)| if a > threshold { Some(i) } else { None })
            .collect()
    }
}
