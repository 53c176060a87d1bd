//! Shrinking heuristic
//!
//! A variable sitting at a bound can only take part in a violating pair
//! from one side. If its value `v_t = -y_t g_t` is beyond the extreme of
//! the opposite set by more than a margin, no pair containing it violates
//! the optimality conditions, and it is unlikely to move again. Variables
//! that keep showing this for a number of consecutive rounds are removed
//! from the working set until the next unshrink.

use crate::solver::problem::QpProblem;

/// Position of a variable relative to its box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaStatus {
    LowerBound,
    UpperBound,
    Free,
}

impl AlphaStatus {
    pub fn of(alpha: f64, upper: f64) -> Self {
        if alpha <= 0.0 {
            AlphaStatus::LowerBound
        } else if alpha >= upper {
            AlphaStatus::UpperBound
        } else {
            AlphaStatus::Free
        }
    }
}

/// Extremes of `v = -y g` over the two selection sets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViolationBounds {
    /// `m`: maximum over the up set
    pub max_up: f64,
    /// `M`: minimum over the low set
    pub min_low: f64,
}

/// Consecutive-evidence shrinking
#[derive(Debug)]
pub struct ShrinkingStrategy {
    /// Rounds in a row each variable looked shrinkable
    counters: Vec<usize>,
    /// Rounds of evidence required before shrinking
    required: usize,
    margin: f64,
    rounds: usize,
}

impl ShrinkingStrategy {
    /// # Arguments
    /// * `n_variables` - Number of optimisation variables
    /// * `required` - Consecutive rounds a variable must look shrinkable
    /// * `margin` - Extra distance past the opposite extreme
    pub fn new(n_variables: usize, required: usize, margin: f64) -> Self {
        Self {
            counters: vec![0; n_variables],
            required,
            margin,
            rounds: 0,
        }
    }

    /// Whether `t` cannot be part of any violating pair given `bounds`
    pub fn is_shrinkable(
        &self,
        problem: &QpProblem,
        t: usize,
        alpha: f64,
        gradient: f64,
        bounds: ViolationBounds,
    ) -> bool {
        let v = -problem.signs[t] * gradient;
        let up = problem.in_up_set(t, alpha);
        let low = problem.in_low_set(t, alpha);
        match (up, low) {
            (true, false) => v < bounds.min_low - self.margin,
            (false, true) => v > bounds.max_up + self.margin,
            _ => false,
        }
    }

    /// Record one round of evidence for the variables in `active`
    pub fn update(
        &mut self,
        problem: &QpProblem,
        alpha: &[f64],
        gradient: &[f64],
        active: &[usize],
        bounds: ViolationBounds,
    ) {
        for &t in active {
            if self.is_shrinkable(problem, t, alpha[t], gradient[t], bounds) {
                self.counters[t] += 1;
            } else {
                self.counters[t] = 0;
            }
        }
        self.rounds += 1;
    }

    /// Variables of `active` with enough consecutive evidence
    pub fn shrinkable_variables(&self, active: &[usize]) -> Vec<usize> {
        active
            .iter()
            .copied()
            .filter(|&t| self.counters[t] >= self.required)
            .collect()
    }

    pub fn has_sufficient_history(&self) -> bool {
        self.rounds >= self.required
    }

    /// Forget all evidence (used when unshrinking)
    pub fn reset_history(&mut self) {
        self.counters.iter_mut().for_each(|c| *c = 0);
        self.rounds = 0;
    }
}
