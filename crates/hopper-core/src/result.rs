//! Result type aliases for Hopper.

use crate::HopperError;

/// A specialized `Result` type for Hopper operations.
pub type HopperResult<T> = Result<T, HopperError>;
