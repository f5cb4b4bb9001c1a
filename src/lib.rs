//! Rendering and delivery for callgauge snapshots.
//!
//! The profiling itself lives in [`callgauge_runtime`]; this crate turns its
//! snapshots into files and reads them back for the `callgauge` CLI.

pub mod deliver;
pub mod error;
pub mod json;
pub mod outline;

pub use callgauge_runtime as runtime;
