//! Kernel-cache backed SVM solver
//!
//! The kernel matrix of a training set rarely fits in memory. This crate
//! keeps a bounded LRU cache of kernel rows ([`cache::KernelCache`]) and
//! solves the SVM dual with a working-set method that touches only two
//! rows per iteration ([`solver::WorkingSetSolver`]), shrinking the
//! problem as variables settle at their bounds and stopping on the
//! duality gap.

pub mod cache;
pub mod core;
pub mod kernel;
pub mod optimizer;
pub mod solver;

// Re-export main types for convenience
pub use crate::cache::{CacheStats, Columns, KernelCache};
pub use crate::core::config::SolverConfig;
pub use crate::core::error::{Result, SVMError};
pub use crate::core::traits::*;
pub use crate::core::types::*;
pub use crate::kernel::{CountingKernel, Kernel, LinearKernel, PrecomputedKernel, RBFKernel, SampleKernel};
pub use crate::optimizer::{SVMOptimizer, TrainedSVM, TrainedSVR, TrainingReport};
pub use crate::solver::{QpProblem, SimplexQpSolver, WorkingSetSolver};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
