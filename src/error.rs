//! Error types for the sleuth promise engine.
//!
//! Only *usage* errors live here: mistakes at a call site that deserve a
//! synchronous `Err` rather than a rejection flowing down a chain. Everything
//! that represents a failed asynchronous outcome travels as a
//! [`Fault`](crate::Fault) payload instead.

use thiserror::Error;

/// Synchronous usage errors raised at the call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Resolving a promise with one of its own pending descendants would make
    /// a node its own ancestor. Raised to the caller so the offending chain
    /// can reject instead of deadlocking.
    #[error("cycle would be created in promise chain")]
    CycleDetected,

    /// `set_random_error_rate` was given a NaN rate.
    #[error("parameter `rate` must be a number between 0 and 100")]
    InvalidErrorRate,
}

/// Result type alias for sleuth.
pub type Result<T> = std::result::Result<T, EngineError>;
