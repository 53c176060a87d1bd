//! Box and equality constrained QP in SVM dual form
//!
//! minimise `0.5 a'Qa + p'a` subject to `y'a = b` and `0 <= a_i <= U_i`,
//! where `Q_ij = y_i y_j K(i, j)` and `y_i` is +1 or -1.

use crate::core::{LabelProvider, Result, SVMError};

#[derive(Debug, Clone)]
pub struct QpProblem {
    /// Signs `y_i`
    pub signs: Vec<f64>,
    /// Linear term `p`
    pub linear: Vec<f64>,
    /// Upper bounds `U_i`
    pub upper: Vec<f64>,
    /// Right-hand side `b` of the equality constraint
    pub rhs: f64,
    /// Variables `i >= n` stand for mirrored copies of vector `2n - 1 - i`
    doubled: bool,
}

impl QpProblem {
    /// C-SVC dual: `p = -1`, `U = C`, `b = 0`
    pub fn classification<L: LabelProvider + ?Sized>(labels: &L, c: f64) -> Result<Self> {
        Self::check_c(c)?;
        let n = labels.num_labels();
        if n == 0 {
            return Err(SVMError::EmptyDataset);
        }

        let mut signs = Vec::with_capacity(n);
        for i in 0..n {
            let label = labels.label(i);
            if label != 1.0 && label != -1.0 {
                return Err(SVMError::InvalidLabel(label));
            }
            signs.push(label);
        }

        Ok(Self {
            signs,
            linear: vec![-1.0; n],
            upper: vec![c; n],
            rhs: 0.0,
            doubled: false,
        })
    }

    /// epsilon-SVR dual over `2n` variables
    ///
    /// Variable `i < n` is `alpha_i` with sign +1 and `p_i = epsilon - z_i`;
    /// variable `2n - 1 - i` is `alpha*_i` with sign -1 and
    /// `p = epsilon + z_i`.
    pub fn regression(targets: &[f64], c: f64, epsilon: f64) -> Result<Self> {
        Self::check_c(c)?;
        if !(epsilon >= 0.0) {
            return Err(SVMError::InvalidParameter(format!(
                "epsilon-tube width must be non-negative, got {}",
                epsilon
            )));
        }
        let n = targets.len();
        if n == 0 {
            return Err(SVMError::EmptyDataset);
        }

        let mut signs = vec![1.0; 2 * n];
        let mut linear = vec![0.0; 2 * n];
        for (i, &z) in targets.iter().enumerate() {
            linear[i] = epsilon - z;
            let mirror = 2 * n - 1 - i;
            signs[mirror] = -1.0;
            linear[mirror] = epsilon + z;
        }

        Ok(Self {
            signs,
            linear,
            upper: vec![c; 2 * n],
            rhs: 0.0,
            doubled: true,
        })
    }

    fn check_c(c: f64) -> Result<()> {
        if c > 0.0 && c.is_finite() {
            Ok(())
        } else {
            Err(SVMError::InvalidParameter(format!(
                "C must be positive and finite, got {}",
                c
            )))
        }
    }

    /// Number of optimisation variables
    pub fn len(&self) -> usize {
        self.signs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signs.is_empty()
    }

    /// Whether variables come in mirrored pairs over one kernel vector
    pub fn is_doubled(&self) -> bool {
        self.doubled
    }

    /// Number of kernel vectors behind the variables
    pub fn num_vectors(&self) -> usize {
        if self.doubled {
            self.len() / 2
        } else {
            self.len()
        }
    }

    /// Objective value from a consistent gradient, `0.5 * a'(g + p)`
    pub fn objective(&self, alpha: &[f64], gradient: &[f64]) -> f64 {
        0.5 * alpha
            .iter()
            .zip(gradient)
            .zip(&self.linear)
            .map(|((a, g), p)| a * (g + p))
            .sum::<f64>()
    }

    /// `y'a - b`
    pub fn equality_residual(&self, alpha: &[f64]) -> f64 {
        self.signs
            .iter()
            .zip(alpha)
            .map(|(y, a)| y * a)
            .sum::<f64>()
            - self.rhs
    }

    /// Check that `alpha` satisfies every constraint within `tolerance`
    pub fn check_feasible(&self, alpha: &[f64], tolerance: f64) -> Result<()> {
        if alpha.len() != self.len() {
            return Err(SVMError::DimensionMismatch {
                expected: self.len(),
                actual: alpha.len(),
            });
        }
        for (i, (&a, &u)) in alpha.iter().zip(&self.upper).enumerate() {
            if a < -tolerance || a > u + tolerance {
                return Err(SVMError::InfeasibleStart(format!(
                    "alpha[{}] = {} outside [0, {}]",
                    i, a, u
                )));
            }
        }
        let residual = self.equality_residual(alpha);
        if residual.abs() > tolerance {
            return Err(SVMError::InfeasibleStart(format!(
                "equality constraint violated by {}",
                residual
            )));
        }
        Ok(())
    }

    /// Whether variable `t` can increase along `y_t` (the "up" set)
    #[inline]
    pub fn in_up_set(&self, t: usize, alpha: f64) -> bool {
        if self.signs[t] > 0.0 {
            alpha < self.upper[t]
        } else {
            alpha > 0.0
        }
    }

    /// Whether variable `t` can decrease along `y_t` (the "low" set)
    #[inline]
    pub fn in_low_set(&self, t: usize, alpha: f64) -> bool {
        if self.signs[t] > 0.0 {
            alpha > 0.0
        } else {
            alpha < self.upper[t]
        }
    }
}
