//! Training driver
//!
//! Owns the kernel cache for the duration of a run, sizes it from the
//! configured megabyte budget, runs the working-set solver and turns its
//! outcome into a model plus a [`TrainingReport`].

use crate::cache::{CacheStats, KernelCache};
use crate::core::{
    ExitFlag, KernelEvaluator, LabelProvider, LogProgress, Prediction, ProgressSink, QpState,
    Result, SVMError, SVMModel, Sample, SolverConfig, SolverOutcome, SparseVector,
};
use crate::kernel::{Kernel, SampleKernel};
use crate::solver::{dual_bound, smo, QpProblem, WorkingSetSolver};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::sync::Arc;

/// Summary of one training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub iterations: usize,
    pub exit_flag: ExitFlag,
    /// Objective values of the returned solution
    pub state: QpState,
    pub unshrinks: usize,
    /// Working set size when the solver stopped
    pub active_size: usize,
    pub cache: CacheStats,
}

impl TrainingReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Turn a run that ended on its budget or a stall into an error
    pub fn ensure_converged(&self) -> Result<()> {
        match self.exit_flag {
            ExitFlag::Stalled => Err(SVMError::NumericalStall {
                gap: self.state.gap(),
            }),
            ExitFlag::MaxIterations => Err(SVMError::IterationLimit {
                iterations: self.iterations,
                gap: self.state.gap(),
            }),
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Solver outcome together with its report
#[derive(Debug, Clone)]
pub struct Fit {
    pub outcome: SolverOutcome,
    pub report: TrainingReport,
}

/// Solve `problem` over `kernel` with a cache sized from `config`
///
/// A single-vector problem has the trivial solution `alpha = 0` and is
/// answered without building a cache.
pub fn solve_problem<E, P>(
    config: &SolverConfig,
    kernel: Arc<E>,
    problem: &QpProblem,
    progress: &mut P,
) -> Result<Fit>
where
    E: KernelEvaluator,
    P: ProgressSink + ?Sized,
{
    config.validate()?;
    if kernel.num_vectors() != problem.num_vectors() {
        return Err(SVMError::DimensionMismatch {
            expected: problem.num_vectors(),
            actual: kernel.num_vectors(),
        });
    }
    let started_at = Utc::now();

    let (outcome, cache) = if problem.num_vectors() == 1 {
        (trivial_outcome(problem), CacheStats::default())
    } else {
        let mut cache = KernelCache::new(kernel, config.cache_size_bytes(), problem.is_doubled())?
            .with_threads(config.num_threads)?;
        let outcome = WorkingSetSolver::new(config.clone())
            .solve_with_progress(problem, &mut cache, progress)?;
        (outcome, cache.stats())
    };

    let report = TrainingReport {
        started_at,
        finished_at: Utc::now(),
        iterations: outcome.iterations,
        exit_flag: outcome.exit_flag,
        state: outcome.state,
        unshrinks: outcome.unshrinks,
        active_size: outcome.active_size,
        cache,
    };
    info!(
        "trained on {} vectors in {} ms: {:?}, {} iterations, cache hit rate {:.1}%",
        problem.num_vectors(),
        report.duration().num_milliseconds(),
        report.exit_flag,
        report.iterations,
        100.0 * report.cache.hit_rate()
    );
    Ok(Fit { outcome, report })
}

fn trivial_outcome(problem: &QpProblem) -> SolverOutcome {
    let alpha = vec![0.0; problem.len()];
    let gradient = problem.linear.clone();
    let all: Vec<usize> = (0..problem.len()).collect();
    let dual = dual_bound(problem, &alpha, &gradient, 0.0, &all);
    let bias = smo::bias(problem, &alpha, &gradient);
    SolverOutcome {
        alpha,
        gradient,
        bias,
        iterations: 0,
        exit_flag: ExitFlag::Converged,
        state: QpState::new(0.0, dual),
        unshrinks: 0,
        active_size: problem.len(),
    }
}

/// Train a classifier over any index-based kernel
pub fn fit_classifier<E, L, P>(
    config: &SolverConfig,
    kernel: Arc<E>,
    labels: &L,
    progress: &mut P,
) -> Result<Fit>
where
    E: KernelEvaluator,
    L: LabelProvider + ?Sized,
    P: ProgressSink + ?Sized,
{
    let problem = QpProblem::classification(labels, config.c)?;
    solve_problem(config, kernel, &problem, progress)
}

/// High-level SVM optimizer tying a kernel to a solver configuration
pub struct SVMOptimizer<K: Kernel> {
    kernel: Arc<K>,
    config: SolverConfig,
}

impl<K: Kernel> SVMOptimizer<K> {
    pub fn new(kernel: K, config: SolverConfig) -> Self {
        Self {
            kernel: Arc::new(kernel),
            config,
        }
    }

    /// Optimizer with the default configuration
    pub fn with_kernel(kernel: K) -> Self {
        Self::new(kernel, SolverConfig::default())
    }

    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_c(mut self, c: f64) -> Self {
        self.config.c = c;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.config.epsilon = epsilon;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Kernel cache budget in megabytes
    pub fn with_cache_size_mb(mut self, cache_size_mb: f64) -> Self {
        self.config.cache_size_mb = cache_size_mb;
        self
    }

    pub fn with_shrinking(mut self, shrinking: bool) -> Self {
        self.config.shrinking = shrinking;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.config.num_threads = num_threads;
        self
    }

    /// Variables optimised together per iteration
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    /// Train a classifier, logging progress at debug level
    pub fn train_samples(&self, samples: &[Sample]) -> Result<TrainedSVM<K>> {
        self.train_with_progress(samples, &mut LogProgress)
    }

    /// Train a classifier, reporting `(iteration, QP, QD)` to `progress`
    pub fn train_with_progress<P: ProgressSink + ?Sized>(
        &self,
        samples: &[Sample],
        progress: &mut P,
    ) -> Result<TrainedSVM<K>> {
        if samples.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        let labels: Vec<f64> = samples.iter().map(|s| s.label).collect();
        let evaluator = Arc::new(SampleKernel::from_samples(Arc::clone(&self.kernel), samples));
        let fit = fit_classifier(&self.config, evaluator, &labels, progress)?;

        Ok(TrainedSVM::new(Arc::clone(&self.kernel), samples, fit))
    }

    /// epsilon-SVR on the sample labels as targets
    pub fn train_regression(&self, samples: &[Sample], tube: f64) -> Result<TrainedSVR<K>> {
        if samples.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        let targets: Vec<f64> = samples.iter().map(|s| s.label).collect();
        let problem = QpProblem::regression(&targets, self.config.c, tube)?;
        let evaluator = Arc::new(SampleKernel::from_samples(Arc::clone(&self.kernel), samples));
        let fit = solve_problem(&self.config, evaluator, &problem, &mut LogProgress)?;

        Ok(TrainedSVR::new(Arc::clone(&self.kernel), samples, fit))
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }
}

/// A trained SVM classifier
pub struct TrainedSVM<K: Kernel> {
    kernel: Arc<K>,
    support_vectors: Vec<Sample>,
    alpha: Vec<f64>,
    bias: f64,
    support_indices: Vec<usize>,
    report: TrainingReport,
}

impl<K: Kernel> TrainedSVM<K> {
    pub(crate) fn new(kernel: Arc<K>, training_samples: &[Sample], fit: Fit) -> Self {
        let Fit { outcome, report } = fit;
        let support_indices = outcome.support_vectors(0.0);
        let support_vectors = support_indices
            .iter()
            .map(|&i| training_samples[i].clone())
            .collect();
        let alpha = support_indices.iter().map(|&i| outcome.alpha[i]).collect();

        Self {
            kernel,
            support_vectors,
            alpha,
            bias: outcome.bias,
            support_indices,
            report,
        }
    }

    /// Decision function value for a sample
    pub fn decision_function(&self, sample: &Sample) -> f64 {
        let mut result = 0.0;
        for (sv, &alpha) in self.support_vectors.iter().zip(&self.alpha) {
            result += alpha * sv.label * self.kernel.compute(&sample.features, &sv.features);
        }
        result + self.bias
    }

    pub fn support_vectors(&self) -> &[Sample] {
        &self.support_vectors
    }

    /// Alpha values of the support vectors
    pub fn alpha_values(&self) -> &[f64] {
        &self.alpha
    }

    /// Indices of the support vectors in the training set
    pub fn support_vector_indices(&self) -> &[usize] {
        &self.support_indices
    }

    pub fn report(&self) -> &TrainingReport {
        &self.report
    }
}

impl<K: Kernel> SVMModel for TrainedSVM<K> {
    fn predict(&self, sample: &Sample) -> Prediction {
        let decision_value = self.decision_function(sample);
        let label = if decision_value >= 0.0 { 1.0 } else { -1.0 };
        Prediction::new(label, decision_value)
    }

    fn n_support_vectors(&self) -> usize {
        self.support_vectors.len()
    }

    fn bias(&self) -> f64 {
        self.bias
    }
}

/// A trained epsilon-SVR model
pub struct TrainedSVR<K: Kernel> {
    kernel: Arc<K>,
    support_vectors: Vec<SparseVector>,
    /// `alpha_i - alpha*_i` of each support vector
    coefficients: Vec<f64>,
    bias: f64,
    report: TrainingReport,
}

impl<K: Kernel> TrainedSVR<K> {
    pub(crate) fn new(kernel: Arc<K>, training_samples: &[Sample], fit: Fit) -> Self {
        let Fit { outcome, report } = fit;
        let n = training_samples.len();

        let mut support_vectors = Vec::new();
        let mut coefficients = Vec::new();
        for (i, sample) in training_samples.iter().enumerate() {
            let beta = outcome.alpha[i] - outcome.alpha[2 * n - 1 - i];
            if beta != 0.0 {
                support_vectors.push(sample.features.clone());
                coefficients.push(beta);
            }
        }

        Self {
            kernel,
            support_vectors,
            coefficients,
            bias: outcome.bias,
            report,
        }
    }

    pub fn predict(&self, features: &SparseVector) -> f64 {
        self.support_vectors
            .iter()
            .zip(&self.coefficients)
            .map(|(sv, beta)| beta * self.kernel.compute(features, sv))
            .sum::<f64>()
            + self.bias
    }

    pub fn n_support_vectors(&self) -> usize {
        self.support_vectors.len()
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn report(&self) -> &TrainingReport {
        &self.report
    }
}
