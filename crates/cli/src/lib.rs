//! `queuectl` command surface: argument parsing, dispatch and rendering.
//!
//! All queue semantics live in `queuectl-infra`; this crate only resolves the
//! database location, calls one `Queue` operation and prints the result.

pub mod args;
pub mod commands;
pub mod render;

pub use commands::run;
