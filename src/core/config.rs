//! Solver configuration
//!
//! Every knob of a training run lives in [`SolverConfig`]. The struct
//! deserialises from JSON with missing fields taking their defaults, so a
//! config file only needs to name what it changes.

use crate::core::{Result, SVMError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for the cache-backed working-set solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Regularization parameter (upper bound for alpha)
    pub c: f64,
    /// Tolerance on the maximal KKT violation `m(alpha) - M(alpha)`
    pub epsilon: f64,
    /// Absolute duality gap tolerance
    pub tol_abs: f64,
    /// Relative duality gap tolerance
    pub tol_rel: f64,
    /// Stop as soon as the primal objective drops to this value
    pub objective_threshold: Option<f64>,
    /// Maximum number of working-set updates
    pub max_iterations: usize,
    /// Variables per working set; 2 takes analytic pair steps, larger
    /// sets are solved by gradient projection
    pub chunk_size: usize,
    /// Pair updates between two duality gap evaluations
    pub check_interval: usize,
    /// Kernel cache size in megabytes
    pub cache_size_mb: f64,
    /// Enable shrinking heuristic
    pub shrinking: bool,
    /// Consecutive iterations a variable must look bound before it is shrunk
    pub shrinking_iterations: usize,
    /// Safety margin a bound variable's gradient must clear to be shrunk
    pub shrink_margin: f64,
    /// Unshrink early once the violation falls below `unshrink_factor * epsilon`
    pub unshrink_factor: f64,
    /// Worker threads for batch row fills (1 = sequential)
    pub num_threads: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            epsilon: 0.001,
            tol_abs: 0.0,
            tol_rel: 1e-9,
            objective_threshold: None,
            max_iterations: 100_000,
            chunk_size: 2,
            check_interval: 10,
            cache_size_mb: 100.0,
            shrinking: true,
            shrinking_iterations: 100,
            shrink_margin: 0.0,
            unshrink_factor: 10.0,
            num_threads: 1,
        }
    }
}

impl SolverConfig {
    /// Check that every field is usable
    pub fn validate(&self) -> Result<()> {
        if !(self.c > 0.0 && self.c.is_finite()) {
            return Err(SVMError::Config(format!(
                "C must be positive and finite, got {}",
                self.c
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(SVMError::Config(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        if !(self.tol_abs >= 0.0 && self.tol_rel >= 0.0) {
            return Err(SVMError::Config(format!(
                "tolerances must be non-negative, got tol_abs={} tol_rel={}",
                self.tol_abs, self.tol_rel
            )));
        }
        if self.objective_threshold.map_or(false, f64::is_nan) {
            return Err(SVMError::Config("objective_threshold must not be NaN".into()));
        }
        if self.chunk_size < 2 {
            return Err(SVMError::Config(format!(
                "chunk_size must be at least 2, got {}",
                self.chunk_size
            )));
        }
        if self.check_interval == 0 {
            return Err(SVMError::Config("check_interval must be at least 1".into()));
        }
        if !(self.cache_size_mb > 0.0) {
            return Err(SVMError::Config(format!(
                "cache size must be positive, got {} MB",
                self.cache_size_mb
            )));
        }
        if self.shrinking && self.shrinking_iterations == 0 {
            return Err(SVMError::Config(
                "shrinking_iterations must be at least 1 when shrinking is enabled".into(),
            ));
        }
        if !(self.shrink_margin >= 0.0 && self.unshrink_factor >= 1.0) {
            return Err(SVMError::Config(format!(
                "shrink_margin must be >= 0 and unshrink_factor >= 1, got {} and {}",
                self.shrink_margin, self.unshrink_factor
            )));
        }
        if self.num_threads == 0 {
            return Err(SVMError::Config("num_threads must be at least 1".into()));
        }
        Ok(())
    }

    /// Cache budget in bytes
    pub fn cache_size_bytes(&self) -> usize {
        (self.cache_size_mb * 1024.0 * 1024.0) as usize
    }

    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SolverConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
