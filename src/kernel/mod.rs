//! Kernel functions and index-based kernel evaluators

pub mod evaluator;
pub mod linear;
pub mod rbf;
pub mod traits;

pub use self::evaluator::*;
pub use self::linear::*;
pub use self::rbf::*;
pub use self::traits::*;
