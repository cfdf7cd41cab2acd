pub mod config;
pub mod decimal;
pub mod error;
pub mod formula;
pub mod schedule;
pub mod types;

#[cfg(feature = "reconciliation")]
pub mod reconciliation;

pub use error::{EvaluationError, FeeEngineError};
pub use types::*;

/// Standard result type for all fee-engine operations
pub type FeeEngineResult<T> = Result<T, FeeEngineError>;
