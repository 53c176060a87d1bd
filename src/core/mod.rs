//! Core types and traits for the SVM solver

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use self::config::*;
pub use self::error::*;
pub use self::traits::*;
pub use self::types::*;
