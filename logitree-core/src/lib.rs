//! Core types and error handling for logitree
//!
//! This crate contains the pieces shared by every logitree map variant:
//!
//! - The reserved sentinel key constants ([`MIN_KEY`], [`MAX_KEY`])
//! - The common error type ([`Error`] / [`Result`])
//! - [`ValidationReport`], the structural check produced by each variant's
//!   single-threaded validator
//!
//! # Example
//!
//! ```
//! use logitree_core::{is_reserved, MIN_KEY};
//!
//! assert!(is_reserved(MIN_KEY));
//! assert!(!is_reserved(42));
//! ```

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
