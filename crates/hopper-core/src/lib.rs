//! # Hopper Core
//!
//! Shared error definitions and tracing setup for the Hopper job
//! orchestration workspace.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_tracing, TelemetryConfig};

// Re-export shaku for dependency injection
pub use shaku::Interface;
