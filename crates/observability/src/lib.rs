//! Process-wide tracing setup shared by the CLI and worker processes.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::{LogFormat, init};
