//! QP solvers over cached kernel matrices
//!
//! [`WorkingSetSolver`] optimises the SVM dual by pairwise steps, or by
//! larger working sets handed to [`GradientProjection`], with shrinking;
//! [`SimplexQpSolver`] handles QPs whose constraints are sums
//! over blocks of non-negative variables.

pub mod duality;
pub mod problem;
pub mod projection;
pub mod shrinking;
pub mod smo;
pub mod splx;

pub use self::duality::dual_bound;
pub use self::problem::QpProblem;
pub use self::projection::GradientProjection;
pub use self::shrinking::{AlphaStatus, ShrinkingStrategy, ViolationBounds};
pub use self::smo::WorkingSetSolver;
pub use self::splx::{BlockKind, ColumnSource, SimplexOutcome, SimplexProblem, SimplexQpSolver};
