//! Error types for logitree
//!
//! This module defines the error type used throughout logitree.

use thiserror::Error;

/// The main error type for logitree operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The caller passed one of the two reserved sentinel keys
    /// ([`crate::MIN_KEY`] or [`crate::MAX_KEY`]) to an operation that
    /// only accepts ordinary keys.
    #[error("key {0} is reserved for the sentinel nodes")]
    ReservedKey(i32),
}

/// A specialized Result type for logitree operations
pub type Result<T> = std::result::Result<T, Error>;
