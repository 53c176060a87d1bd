//! QP solver for simplex constrained problems
//!
//! minimise `0.5 x'Hx + f'x` subject to
//!
//! ```text
//! sum_{i in I_k} x_i == b_k   for equality blocks
//! sum_{i in I_k} x_i <= b_k   for inequality blocks
//! x_i >= 0
//! ```
//!
//! Each pass visits every block and moves mass between the variable with
//! the smallest gradient and the variable (or, for inequality blocks, the
//! slack) whose transfer improves the objective most. Columns of `H` are
//! requested on demand from a [`ColumnSource`].

use crate::cache::{Columns, KernelCache};
use crate::core::{
    ExitFlag, KernelEvaluator, ProgressSink, QpState, Result, SVMError, SolverConfig,
};
use log::{debug, warn};

/// On-demand access to the columns of a symmetric matrix
pub trait ColumnSource {
    /// Number of rows and columns
    fn dimension(&self) -> usize;

    fn diagonal(&self) -> Vec<f64>;

    /// Write column `i` into `out`
    fn column(&mut self, i: usize, out: &mut [f64]);
}

impl<E: KernelEvaluator> ColumnSource for KernelCache<E> {
    fn dimension(&self) -> usize {
        self.total()
    }

    fn diagonal(&self) -> Vec<f64> {
        KernelCache::diagonal(self)
    }

    /// Nothing is kept resident across calls and a cache holds at least
    /// [`MIN_CACHE_ROWS`](crate::cache::MIN_CACHE_ROWS) rows, so `cache_row`
    /// always finds a victim here.
    fn column(&mut self, i: usize, out: &mut [f64]) {
        if let Err(err) = self.cache_row(i) {
            warn!("{}, computing it on the fly", err);
        }
        self.get_row(i, Columns::All, out);
    }
}

/// Kind of a block constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `sum x_i == b_k`
    Equality,
    /// `sum x_i <= b_k`
    Inequality,
}

/// Linear term and block structure of a simplex constrained QP
#[derive(Debug, Clone)]
pub struct SimplexProblem {
    /// Linear term `f`
    pub linear: Vec<f64>,
    /// Block of each variable
    pub block_of: Vec<usize>,
    /// Right-hand side `b_k` of each block
    pub rhs: Vec<f64>,
    pub kinds: Vec<BlockKind>,
}

impl SimplexProblem {
    /// All variables in one block
    pub fn single_block(linear: Vec<f64>, rhs: f64, kind: BlockKind) -> Self {
        let n = linear.len();
        Self {
            linear,
            block_of: vec![0; n],
            rhs: vec![rhs],
            kinds: vec![kind],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.rhs.len()
    }

    /// Variable indices of every block
    fn members(&self) -> Result<Vec<Vec<usize>>> {
        let n = self.linear.len();
        if self.block_of.len() != n {
            return Err(SVMError::DimensionMismatch {
                expected: n,
                actual: self.block_of.len(),
            });
        }
        if self.kinds.len() != self.rhs.len() {
            return Err(SVMError::DimensionMismatch {
                expected: self.rhs.len(),
                actual: self.kinds.len(),
            });
        }

        let mut members = vec![Vec::new(); self.rhs.len()];
        for (i, &k) in self.block_of.iter().enumerate() {
            match members.get_mut(k) {
                Some(block) => block.push(i),
                None => {
                    return Err(SVMError::InvalidParameter(format!(
                        "variable {} refers to block {} of {}",
                        i,
                        k,
                        self.rhs.len()
                    )))
                }
            }
        }
        for (k, (block, &b)) in members.iter().zip(&self.rhs).enumerate() {
            if block.is_empty() {
                return Err(SVMError::InvalidParameter(format!("block {} is empty", k)));
            }
            if !(b > 0.0) {
                return Err(SVMError::InvalidParameter(format!(
                    "block {} has non-positive right-hand side {}",
                    k, b
                )));
            }
        }
        Ok(members)
    }

    /// Slack `b_k - sum x_i` of each block, or an error if `x` is infeasible
    fn slack(&self, members: &[Vec<usize>], x: &[f64], tolerance: f64) -> Result<Vec<f64>> {
        if let Some(i) = x.iter().position(|&v| v < 0.0) {
            return Err(SVMError::InfeasibleStart(format!(
                "x[{}] = {} is negative",
                i, x[i]
            )));
        }
        let mut slack = Vec::with_capacity(members.len());
        for (k, block) in members.iter().enumerate() {
            let s = self.rhs[k] - block.iter().map(|&i| x[i]).sum::<f64>();
            let violated = match self.kinds[k] {
                BlockKind::Equality => s.abs() > tolerance,
                BlockKind::Inequality => s < -tolerance,
            };
            if violated {
                return Err(SVMError::InfeasibleStart(format!(
                    "block {} misses its right-hand side by {}",
                    k, s
                )));
            }
            slack.push(match self.kinds[k] {
                BlockKind::Equality => 0.0,
                BlockKind::Inequality => s.max(0.0),
            });
        }
        Ok(slack)
    }
}

/// Result of a simplex QP run
#[derive(Debug, Clone, Copy)]
pub struct SimplexOutcome {
    pub state: QpState,
    pub iterations: usize,
    pub exit_flag: ExitFlag,
}

/// Stopping parameters of the simplex solver
#[derive(Debug, Clone)]
pub struct SimplexQpSolver {
    pub max_iterations: usize,
    pub tol_abs: f64,
    pub tol_rel: f64,
    pub objective_threshold: Option<f64>,
}

impl Default for SimplexQpSolver {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            tol_abs: 0.0,
            tol_rel: 1e-9,
            objective_threshold: None,
        }
    }
}

/// Objective decrease and step fraction of moving `x` mass along a direction
/// with slope `-numerator` and curvature `denominator`
fn improvement(numerator: f64, denominator: f64) -> Option<(f64, f64)> {
    if denominator <= 0.0 {
        return None;
    }
    let gain = if numerator < denominator {
        0.5 * numerator * numerator / denominator
    } else {
        numerator - 0.5 * denominator
    };
    Some((gain, (numerator / denominator).min(1.0)))
}

impl SimplexQpSolver {
    /// Take the stopping rules of a solver configuration
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            tol_abs: config.tol_abs,
            tol_rel: config.tol_rel,
            objective_threshold: config.objective_threshold,
        }
    }

    /// Improve the feasible point `x` in place
    pub fn solve<C, P>(
        &self,
        matrix: &mut C,
        problem: &SimplexProblem,
        x: &mut [f64],
        progress: &mut P,
    ) -> Result<SimplexOutcome>
    where
        C: ColumnSource + ?Sized,
        P: ProgressSink + ?Sized,
    {
        let n = problem.linear.len();
        if matrix.dimension() != n || x.len() != n {
            return Err(SVMError::DimensionMismatch {
                expected: n,
                actual: if x.len() != n { x.len() } else { matrix.dimension() },
            });
        }
        let members = problem.members()?;
        let mut slack = problem.slack(&members, x, 1e-9)?;
        let m = members.len() as f64;
        let diag = matrix.diagonal();
        let f = &problem.linear;

        let mut col_u = vec![0.0; n];
        let mut col_v = vec![0.0; n];

        // d = Hx + f
        let mut d = f.clone();
        for i in 0..n {
            if x[i] > 0.0 {
                matrix.column(i, &mut col_u);
                for (dj, hj) in d.iter_mut().zip(&col_u) {
                    *dj += hj * x[i];
                }
            }
        }

        let mut state = self.objectives(problem, &members, x, &d);
        progress.report(0, state.primal, state.dual);
        let mut iterations = 0;

        let exit_flag = loop {
            iterations += 1;
            let mut qp = state.primal;

            for (k, block) in members.iter().enumerate() {
                let b = problem.rhs[k];
                let inequality = problem.kinds[k] == BlockKind::Inequality;

                let mut u = block[0];
                let mut delta = 0.0;
                for &i in block {
                    delta += x[i] * d[i];
                    if d[i] < d[u] {
                        u = i;
                    }
                }
                let u = if inequality && d[u] > 0.0 {
                    None
                } else {
                    delta -= b * d[u];
                    Some(u)
                };

                if !(delta > self.tol_abs / m && delta > self.tol_rel * qp.abs() / m) {
                    continue;
                }

                match u {
                    Some(u) => {
                        matrix.column(u, &mut col_u);

                        // (gain, step, Some(v)) for a variable, None for the slack
                        let mut best: Option<(f64, f64, Option<usize>)> = None;
                        for &i in block {
                            if x[i] > 0.0 && i != u {
                                let num = x[i] * (d[i] - d[u]);
                                let den = x[i] * x[i] * (diag[u] - 2.0 * col_u[i] + diag[i]);
                                if let Some((gain, tau)) = improvement(num, den) {
                                    if best.map_or(true, |(g, _, _)| gain > g) {
                                        best = Some((gain, tau, Some(i)));
                                    }
                                }
                            }
                        }
                        if inequality && slack[k] > 0.0 {
                            let num = -slack[k] * d[u];
                            let den = slack[k] * slack[k] * diag[u];
                            if let Some((gain, tau)) = improvement(num, den) {
                                if best.map_or(true, |(g, _, _)| gain > g) {
                                    best = Some((gain, tau, None));
                                }
                            }
                        }

                        match best {
                            Some((gain, tau, Some(v))) => {
                                let amount = x[v] * tau;
                                x[u] += amount;
                                x[v] -= amount;
                                matrix.column(v, &mut col_v);
                                for i in 0..n {
                                    d[i] += amount * (col_u[i] - col_v[i]);
                                }
                                qp -= gain;
                            }
                            Some((gain, tau, None)) => {
                                let amount = slack[k] * tau;
                                x[u] += amount;
                                slack[k] -= amount;
                                for i in 0..n {
                                    d[i] += amount * col_u[i];
                                }
                                qp -= gain;
                            }
                            None => {}
                        }
                    }
                    None => {
                        let mut best: Option<(f64, f64, usize)> = None;
                        for &i in block {
                            if x[i] > 0.0 {
                                let num = x[i] * d[i];
                                let den = x[i] * x[i] * diag[i];
                                if let Some((gain, tau)) = improvement(num, den) {
                                    if best.map_or(true, |(g, _, _)| gain > g) {
                                        best = Some((gain, tau, i));
                                    }
                                }
                            }
                        }
                        if let Some((gain, tau, v)) = best {
                            let amount = x[v] * tau;
                            slack[k] += amount;
                            x[v] -= amount;
                            matrix.column(v, &mut col_v);
                            for i in 0..n {
                                d[i] -= amount * col_v[i];
                            }
                            qp -= gain;
                        }
                    }
                }
            }

            state = self.objectives(problem, &members, x, &d);
            progress.report(iterations, state.primal, state.dual);

            let gap = state.gap();
            if gap <= state.primal.abs() * self.tol_rel {
                break ExitFlag::RelativeTolerance;
            } else if gap <= self.tol_abs {
                break ExitFlag::AbsoluteTolerance;
            } else if self.objective_threshold.map_or(false, |t| state.primal <= t) {
                break ExitFlag::ObjectiveThreshold;
            } else if iterations >= self.max_iterations {
                break ExitFlag::MaxIterations;
            }
        };

        debug!(
            "simplex QP finished ({:?}) after {} passes: QP={:.8} QD={:.8}",
            exit_flag, iterations, state.primal, state.dual
        );
        Ok(SimplexOutcome {
            state,
            iterations,
            exit_flag,
        })
    }

    /// `QP = 0.5 x'(f + d)` and the block-wise dual value
    fn objectives(
        &self,
        problem: &SimplexProblem,
        members: &[Vec<usize>],
        x: &[f64],
        d: &[f64],
    ) -> QpState {
        let mut primal = 0.0;
        let mut dual = 0.0;
        for ((xi, fi), di) in x.iter().zip(&problem.linear).zip(d) {
            primal += xi * (fi + di);
            dual += xi * (fi - di);
        }
        primal *= 0.5;
        dual *= 0.5;

        for (k, block) in members.iter().enumerate() {
            let smallest = block
                .iter()
                .map(|&i| d[i])
                .fold(f64::INFINITY, f64::min);
            dual += problem.rhs[k]
                * match problem.kinds[k] {
                    BlockKind::Equality => smallest,
                    BlockKind::Inequality => smallest.min(0.0),
                };
        }
        QpState::new(primal, dual)
    }
}
