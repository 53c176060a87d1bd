//! Working-set solver for the SVM dual
//!
//! Sequential minimal optimisation over pairs chosen by maximal violation,
//! or, with `chunk_size > 2`, decomposition into larger working sets whose
//! subproblems are solved by gradient projection. Kernel rows are only ever
//! read through the [`KernelCache`]. The gradient `g = Qa + p` is updated
//! incrementally over the working set and rebuilt from scratch only when
//! shrunk variables are brought back.

use crate::cache::{Columns, KernelCache};
use crate::core::{
    ExitFlag, KernelEvaluator, NoProgress, ProgressSink, QpState, Result, SVMError,
    SolverConfig, SolverOutcome,
};
use crate::solver::duality::dual_bound;
use crate::solver::problem::QpProblem;
use crate::solver::projection::GradientProjection;
use crate::solver::shrinking::{AlphaStatus, ShrinkingStrategy, ViolationBounds};
use log::{debug, info, trace, warn};

/// Floor for the curvature along the pair direction
const MIN_CURVATURE: f64 = 1e-12;

/// Fraction of stored cache columns below which the cache is compacted
const CACHE_SHRINK_RATIO: f64 = 0.75;

/// Subproblem KKT tolerance relative to `epsilon`
const SUBPROBLEM_TOLERANCE: f64 = 0.1;

/// Working-set QP solver
pub struct WorkingSetSolver {
    config: SolverConfig,
}

impl WorkingSetSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solve `problem` starting from `alpha = 0`
    pub fn solve<E: KernelEvaluator>(
        &self,
        problem: &QpProblem,
        cache: &mut KernelCache<E>,
    ) -> Result<SolverOutcome> {
        self.solve_with_progress(problem, cache, &mut NoProgress)
    }

    /// Solve `problem`, reporting `(iteration, QP, QD)` at every gap check
    pub fn solve_with_progress<E, P>(
        &self,
        problem: &QpProblem,
        cache: &mut KernelCache<E>,
        progress: &mut P,
    ) -> Result<SolverOutcome>
    where
        E: KernelEvaluator,
        P: ProgressSink + ?Sized,
    {
        self.config.validate()?;
        if problem.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        if cache.total() != problem.len() || cache.num_vectors() != problem.num_vectors() {
            return Err(SVMError::DimensionMismatch {
                expected: problem.len(),
                actual: cache.total(),
            });
        }
        if problem.rhs != 0.0 {
            return Err(SVMError::InfeasibleStart(format!(
                "alpha = 0 does not satisfy y'a = {}",
                problem.rhs
            )));
        }

        let mut run = Run::new(&self.config, problem, cache, progress);
        let exit_flag = run.optimize()?;
        Ok(run.finish(exit_flag))
    }
}

/// Pair chosen by maximal violation
#[derive(Debug, Clone, Copy)]
struct Selection {
    up: Option<usize>,
    low: Option<usize>,
    bounds: ViolationBounds,
}

impl Selection {
    /// `m - M`, negative infinity when either set is empty
    fn violation(&self) -> f64 {
        self.bounds.max_up - self.bounds.min_low
    }
}

/// State of one optimisation run
struct Run<'a, E: KernelEvaluator, P: ProgressSink + ?Sized> {
    config: &'a SolverConfig,
    problem: &'a QpProblem,
    cache: &'a mut KernelCache<E>,
    progress: &'a mut P,
    alpha: Vec<f64>,
    gradient: Vec<f64>,
    /// Whether `gradient` is exact for shrunk variables too
    gradient_complete: bool,
    is_active: Vec<bool>,
    /// Working set in ascending order
    active: Vec<usize>,
    all: Vec<usize>,
    objective: f64,
    row_up: Vec<f64>,
    row_low: Vec<f64>,
    /// Rows of the current chunk, `problem.len()` values each
    chunk_rows: Vec<f64>,
    shrinking: Option<ShrinkingStrategy>,
    shrink_counter: usize,
    unshrunk_early: bool,
    unshrinks: usize,
    last_unshrink_gap: f64,
    iterations: usize,
}

impl<'a, E: KernelEvaluator, P: ProgressSink + ?Sized> Run<'a, E, P> {
    fn new(
        config: &'a SolverConfig,
        problem: &'a QpProblem,
        cache: &'a mut KernelCache<E>,
        progress: &'a mut P,
    ) -> Self {
        let n = problem.len();
        let shrinking = if config.shrinking {
            Some(ShrinkingStrategy::new(
                n,
                config.shrinking_iterations,
                config.shrink_margin,
            ))
        } else {
            None
        };

        Self {
            config,
            problem,
            cache,
            progress,
            alpha: vec![0.0; n],
            gradient: problem.linear.clone(),
            gradient_complete: true,
            is_active: vec![true; n],
            active: (0..n).collect(),
            all: (0..n).collect(),
            objective: 0.0,
            row_up: vec![0.0; n],
            row_low: vec![0.0; n],
            chunk_rows: Vec::new(),
            shrinking,
            shrink_counter: 0,
            unshrunk_early: false,
            unshrinks: 0,
            last_unshrink_gap: f64::INFINITY,
            iterations: 0,
        }
    }

    fn is_shrunk(&self) -> bool {
        self.active.len() < self.all.len()
    }

    fn optimize(&mut self) -> Result<ExitFlag> {
        loop {
            if self.iterations >= self.config.max_iterations {
                return Ok(ExitFlag::MaxIterations);
            }

            let selection = self.select(&self.active);
            let violation = selection.violation();

            if violation <= self.config.epsilon {
                if self.is_shrunk() {
                    if let Some(flag) = self.unshrink() {
                        return Ok(flag);
                    }
                    continue;
                }
                return Ok(ExitFlag::Converged);
            }

            if self.shrinking.is_some()
                && !self.unshrunk_early
                && violation <= self.config.unshrink_factor * self.config.epsilon
            {
                self.unshrunk_early = true;
                if self.is_shrunk() {
                    debug!(
                        "violation {:.3e} close to tolerance, reactivating {} shrunk variables",
                        violation,
                        self.all.len() - self.active.len()
                    );
                    self.unshrinks += 1;
                    self.reconstruct_gradient();
                    self.reactivate();
                    continue;
                }
            }

            let (i, j) = match (selection.up, selection.low) {
                (Some(i), Some(j)) => (i, j),
                _ => return Ok(ExitFlag::Converged),
            };
            trace!(
                "iteration {}: pair ({}, {}) violation {:.3e}",
                self.iterations,
                i,
                j,
                violation
            );

            if self.config.chunk_size > 2 {
                self.chunk_step(i, j, violation)?;
            } else {
                self.step(i, j, violation)?;
            }
            self.iterations += 1;
            self.shrink(selection.bounds);

            if self.iterations % self.config.check_interval == 0 {
                let state = self.evaluate(false);
                if let Some(flag) = self.stopping_rule(state) {
                    if !self.is_shrunk() {
                        return Ok(flag);
                    }
                    if let Some(flag) = self.unshrink() {
                        return Ok(flag);
                    }
                }
            }
        }
    }

    /// Most violating pair over `indices`; ties go to the lowest index
    fn select(&self, indices: &[usize]) -> Selection {
        let mut selection = Selection {
            up: None,
            low: None,
            bounds: ViolationBounds {
                max_up: f64::NEG_INFINITY,
                min_low: f64::INFINITY,
            },
        };

        for &t in indices {
            let a = self.alpha[t];
            let v = -self.problem.signs[t] * self.gradient[t];
            if self.problem.in_up_set(t, a) && v > selection.bounds.max_up {
                selection.up = Some(t);
                selection.bounds.max_up = v;
            }
            if self.problem.in_low_set(t, a) && v < selection.bounds.min_low {
                selection.low = Some(t);
                selection.bounds.min_low = v;
            }
        }
        selection
    }

    /// Make the rows of the pair resident and read them over the working set
    ///
    /// Row `j` is cached without evicting row `i`. `CacheFull` can only come
    /// back when every slot holds a kept row, which a capacity of at least
    /// two rules out here; the row is then read on the fly.
    fn fetch_rows(&mut self, i: usize, j: usize) -> Result<()> {
        for (row, keep) in [(i, None), (j, Some(i))] {
            let cached = match keep {
                Some(k) => self.cache.cache_row_keeping(row, &[k]),
                None => self.cache.cache_row(row),
            };
            if let Err(err) = cached {
                if !err.is_recoverable() {
                    return Err(err);
                }
                warn!("{}, computing it on the fly", err);
            }
        }
        self.cache
            .get_row(i, Columns::Subset(&self.active), &mut self.row_up);
        self.cache
            .get_row(j, Columns::Subset(&self.active), &mut self.row_low);
        Ok(())
    }

    /// Move `a_i` up and `a_j` down along their signs by the clipped Newton step
    fn step(&mut self, i: usize, j: usize, violation: f64) -> Result<()> {
        self.fetch_rows(i, j)?;

        let problem = self.problem;
        let signs = &problem.signs;
        let upper = &problem.upper;
        let (yi, yj) = (signs[i], signs[j]);
        let (ai, aj) = (self.alpha[i], self.alpha[j]);

        let (k_ii, k_jj, k_ij) = (self.row_up[i], self.row_low[j], self.row_up[j]);
        let eta = (k_ii + k_jj - 2.0 * k_ij).max(MIN_CURVATURE);

        let (limit_i, bound_i) = if yi > 0.0 {
            (upper[i] - ai, upper[i])
        } else {
            (ai, 0.0)
        };
        let (limit_j, bound_j) = if yj > 0.0 {
            (aj, 0.0)
        } else {
            (upper[j] - aj, upper[j])
        };

        let t = (violation / eta).min(limit_i).min(limit_j);
        let new_i = if t >= limit_i { bound_i } else { ai + yi * t };
        let new_j = if t >= limit_j { bound_j } else { aj - yj * t };
        let delta_i = new_i - ai;
        let delta_j = new_j - aj;

        let (gi, gj) = (self.gradient[i], self.gradient[j]);
        let q_ij = yi * yj * k_ij;
        self.objective += gi * delta_i
            + gj * delta_j
            + 0.5 * (k_ii * delta_i * delta_i + k_jj * delta_j * delta_j)
            + q_ij * delta_i * delta_j;

        self.alpha[i] = new_i;
        self.alpha[j] = new_j;

        let coef_i = yi * delta_i;
        let coef_j = yj * delta_j;
        for &t in &self.active {
            self.gradient[t] +=
                signs[t] * (coef_i * self.row_up[t] + coef_j * self.row_low[t]);
        }
        self.gradient_complete = !self.is_shrunk();
        Ok(())
    }

    /// Working set of up to `chunk_size` variables
    ///
    /// The most violating members of the up set are paired, in order, with
    /// the most violating members of the low set while each pair still
    /// violates; ties go to the lowest index. Returned in ascending order.
    fn select_chunk(&self) -> Vec<usize> {
        let problem = self.problem;
        let value = |t: usize| -problem.signs[t] * self.gradient[t];

        let mut up: Vec<usize> = Vec::new();
        let mut low: Vec<usize> = Vec::new();
        for &t in &self.active {
            if problem.in_up_set(t, self.alpha[t]) {
                up.push(t);
            }
            if problem.in_low_set(t, self.alpha[t]) {
                low.push(t);
            }
        }
        up.sort_by(|&a, &b| value(b).total_cmp(&value(a)).then(a.cmp(&b)));
        low.sort_by(|&a, &b| value(a).total_cmp(&value(b)).then(a.cmp(&b)));

        let pairs = self.config.chunk_size / 2;
        let mut chosen = vec![false; problem.len()];
        let mut working = Vec::with_capacity(2 * pairs);
        let (mut u, mut l) = (0, 0);
        while working.len() < 2 * pairs {
            while u < up.len() && chosen[up[u]] {
                u += 1;
            }
            if u == up.len() {
                break;
            }
            let i = up[u];
            while l < low.len() && (chosen[low[l]] || low[l] == i) {
                l += 1;
            }
            if l == low.len() {
                break;
            }
            let j = low[l];
            if value(i) <= value(j) {
                break;
            }
            chosen[i] = true;
            chosen[j] = true;
            working.push(i);
            working.push(j);
        }
        working.sort_unstable();
        working
    }

    /// Optimise a whole working set at once
    ///
    /// Rows of the set are cached as one batch; those that do not fit are
    /// read on the fly. Falls back to the pair step when only the pair
    /// `(i, j)` violates.
    fn chunk_step(&mut self, i: usize, j: usize, violation: f64) -> Result<()> {
        let working = self.select_chunk();
        if working.len() <= 2 {
            return self.step(i, j, violation);
        }

        let problem = self.problem;
        let n = problem.len();
        let q = working.len();
        self.cache.cache_rows(&working);
        self.chunk_rows.resize(q * n, 0.0);
        for (k, &b) in working.iter().enumerate() {
            self.cache.get_row(
                b,
                Columns::Subset(&self.active),
                &mut self.chunk_rows[k * n..(k + 1) * n],
            );
        }

        let signs: Vec<f64> = working.iter().map(|&t| problem.signs[t]).collect();
        let upper: Vec<f64> = working.iter().map(|&t| problem.upper[t]).collect();
        let old: Vec<f64> = working.iter().map(|&t| self.alpha[t]).collect();
        let mut quadratic = vec![0.0; q * q];
        for a in 0..q {
            for (b, &wb) in working.iter().enumerate() {
                quadratic[a * q + b] = signs[a] * signs[b] * self.chunk_rows[a * n + wb];
            }
        }
        // Linear term of the subproblem in absolute coordinates
        let linear: Vec<f64> = (0..q)
            .map(|a| {
                let qa: f64 = (0..q).map(|b| quadratic[a * q + b] * old[b]).sum();
                self.gradient[working[a]] - qa
            })
            .collect();

        let mut x = old.clone();
        let inner = GradientProjection::new(SUBPROBLEM_TOLERANCE * self.config.epsilon)
            .solve(&quadratic, &linear, &signs, &upper, &mut x)?;
        trace!(
            "iteration {}: working set of {} solved in {} projection steps",
            self.iterations,
            q,
            inner
        );

        let delta: Vec<f64> = x.iter().zip(&old).map(|(new, old)| new - old).collect();
        let mut change = 0.0;
        for a in 0..q {
            let qd: f64 = (0..q).map(|b| quadratic[a * q + b] * delta[b]).sum();
            change += delta[a] * (self.gradient[working[a]] + 0.5 * qd);
        }
        self.objective += change;

        for (a, &wa) in working.iter().enumerate() {
            if delta[a] == 0.0 {
                continue;
            }
            self.alpha[wa] = x[a];
            let coef = signs[a] * delta[a];
            let row = &self.chunk_rows[a * n..(a + 1) * n];
            for &t in &self.active {
                self.gradient[t] += problem.signs[t] * coef * row[t];
            }
        }
        self.gradient_complete = !self.is_shrunk();
        Ok(())
    }

    fn shrink(&mut self, bounds: ViolationBounds) {
        if let Some(strategy) = self.shrinking.as_mut() {
            strategy.update(self.problem, &self.alpha, &self.gradient, &self.active, bounds);
            self.shrink_counter += 1;
            if self.shrink_counter < self.config.shrinking_iterations
                || !strategy.has_sufficient_history()
            {
                return;
            }
            self.shrink_counter = 0;

            let victims = strategy.shrinkable_variables(&self.active);
            if victims.is_empty() {
                return;
            }
            for &t in &victims {
                self.is_active[t] = false;
            }
            self.active.retain(|&t| self.is_active[t]);
            debug!(
                "shrinking {} variables, {} remain active",
                victims.len(),
                self.active.len()
            );

            let stored = self.cache.active_count();
            if (self.active.len() as f64) < CACHE_SHRINK_RATIO * stored as f64 {
                self.cache.shrink(stored - self.active.len(), &self.is_active);
            }
        }
    }

    /// Rebuild the full gradient and check the full problem
    ///
    /// Returns the exit flag when the run should stop, otherwise brings every
    /// variable back into the working set.
    fn unshrink(&mut self) -> Option<ExitFlag> {
        self.unshrinks += 1;
        self.reconstruct_gradient();
        let state = self.evaluate(true);
        let violation = self.select(&self.all).violation();
        let gap = state.gap();
        debug!(
            "unshrink {}: {} of {} variables active, full gap {:.3e}, violation {:.3e}",
            self.unshrinks,
            self.active.len(),
            self.all.len(),
            gap,
            violation
        );

        if violation <= self.config.epsilon {
            return Some(ExitFlag::Converged);
        }
        if let Some(flag) = self.stopping_rule(state) {
            return Some(flag);
        }
        if gap >= self.last_unshrink_gap {
            warn!(
                "duality gap {:.3e} did not improve on {:.3e} since the last unshrink",
                gap, self.last_unshrink_gap
            );
            return Some(ExitFlag::Stalled);
        }
        self.last_unshrink_gap = gap;
        self.reactivate();
        None
    }

    fn reactivate(&mut self) {
        self.is_active.iter_mut().for_each(|a| *a = true);
        self.active.clone_from(&self.all);
        if let Some(strategy) = self.shrinking.as_mut() {
            strategy.reset_history();
        }
        self.shrink_counter = 0;
    }

    /// `g = p + Qa` from scratch, batching support vector rows through the cache
    fn reconstruct_gradient(&mut self) {
        let n = self.all.len();
        if self.cache.active_count() < n {
            self.cache.reset();
        }

        let problem = self.problem;
        let signs = &problem.signs;
        let mut gradient = problem.linear.clone();
        let support: Vec<usize> = (0..n).filter(|&s| self.alpha[s] > 0.0).collect();
        let batch = self.cache.capacity().max(1);

        for chunk in support.chunks(batch) {
            self.cache.cache_rows(chunk);
            for &s in chunk {
                self.cache.get_row(s, Columns::All, &mut self.row_up);
                let coef = signs[s] * self.alpha[s];
                for t in 0..n {
                    gradient[t] += signs[t] * coef * self.row_up[t];
                }
            }
        }

        self.gradient = gradient;
        self.gradient_complete = true;
        self.objective = problem.objective(&self.alpha, &self.gradient);
    }

    fn current_state(&self, full: bool) -> QpState {
        let indices = if full { &self.all } else { &self.active };
        let dual = dual_bound(
            self.problem,
            &self.alpha,
            &self.gradient,
            self.objective,
            indices,
        );
        QpState::new(self.objective, dual)
    }

    /// Evaluate the gap and report it
    fn evaluate(&mut self, full: bool) -> QpState {
        let state = self.current_state(full);
        self.progress
            .report(self.iterations, state.primal, state.dual);
        state
    }

    fn stopping_rule(&self, state: QpState) -> Option<ExitFlag> {
        let gap = state.gap();
        if gap <= state.primal.abs() * self.config.tol_rel {
            Some(ExitFlag::RelativeTolerance)
        } else if gap <= self.config.tol_abs {
            Some(ExitFlag::AbsoluteTolerance)
        } else if self
            .config
            .objective_threshold
            .map_or(false, |t| state.primal <= t)
        {
            Some(ExitFlag::ObjectiveThreshold)
        } else {
            None
        }
    }

    fn finish(mut self, exit_flag: ExitFlag) -> SolverOutcome {
        let active_size = self.active.len();
        if !self.gradient_complete {
            self.reconstruct_gradient();
        }
        let state = self.current_state(true);
        let bias = bias(self.problem, &self.alpha, &self.gradient);

        match exit_flag {
            ExitFlag::MaxIterations => warn!(
                "iteration limit {} reached with gap {:.3e}",
                self.config.max_iterations,
                state.gap()
            ),
            ExitFlag::Stalled => warn!("optimisation stalled with gap {:.3e}", state.gap()),
            _ => {}
        }
        info!(
            "optimisation finished ({:?}) after {} iterations: QP={:.8} QD={:.8}",
            exit_flag, self.iterations, state.primal, state.dual
        );

        SolverOutcome {
            alpha: self.alpha,
            gradient: self.gradient,
            bias,
            iterations: self.iterations,
            exit_flag,
            state,
            unshrinks: self.unshrinks,
            active_size,
        }
    }
}

/// Bias from free variables, or the middle of the feasible interval
pub(crate) fn bias(problem: &QpProblem, alpha: &[f64], gradient: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut free = 0usize;
    let mut upper = f64::INFINITY;
    let mut lower = f64::NEG_INFINITY;

    for t in 0..problem.len() {
        let y = problem.signs[t];
        let yg = y * gradient[t];
        match AlphaStatus::of(alpha[t], problem.upper[t]) {
            AlphaStatus::Free => {
                sum += yg;
                free += 1;
            }
            AlphaStatus::UpperBound if y > 0.0 => lower = lower.max(yg),
            AlphaStatus::UpperBound => upper = upper.min(yg),
            AlphaStatus::LowerBound if y > 0.0 => upper = upper.min(yg),
            AlphaStatus::LowerBound => lower = lower.max(yg),
        }
    }

    let rho = if free > 0 {
        sum / free as f64
    } else {
        match (upper.is_finite(), lower.is_finite()) {
            (true, true) => 0.5 * (upper + lower),
            (true, false) => upper,
            (false, true) => lower,
            (false, false) => 0.0,
        }
    };
    -rho
}
