//! Runtime for callgauge, an in-process call-graph profiler.
//!
//! Instrumented code opens a [`Session`] at method entry and lets it drop at
//! exit. Each session measures its span, folds it into per-method statistics
//! shared across threads, and extends the caller→callee graph. A [`Snapshot`]
//! turns the live statistics into an immutable graph for a [`Renderer`].
//!
//! ```no_run
//! use callgauge_runtime::{Profiler, ProfilerConfig};
//!
//! let profiler = Profiler::new(ProfilerConfig::default());
//! {
//!     let _session = profiler.enter("Parser", "parse");
//!     // ... method body ...
//! }
//! let snapshot = profiler.snapshot();
//! assert_eq!(snapshot.roots[0].method, "parse");
//! ```

#![allow(unsafe_code)]

pub mod analysis;
pub mod caller;
mod config;
mod cpu_clock;
mod error;
pub mod measure;
pub mod registry;
mod render;
mod session;
pub mod snapshot;
pub mod stack;

use std::sync::OnceLock;

pub use caller::{CallSite, CallerStrategy, Mechanism};
pub use config::{ClassNameStyle, ProfilerConfig};
pub use error::{CallerError, RenderError};
pub use measure::{
    default_source, format_measurement, select_source, Measurement, MeasurementSource,
    ThreadCpuClock, WallClock,
};
pub use registry::{CalleeEdge, ClassStats, MethodId, MethodStats, Registry};
pub use render::{prepare, RenderOptions, Renderer};
pub use session::{Profiler, Session};
pub use snapshot::{CallEdge, CallNode, MethodSummary, Snapshot};
pub use stack::{CallStack, Frame, FrameToken, ThreadContext};

static GLOBAL: OnceLock<Profiler> = OnceLock::new();

/// Process-wide profiler for interceptors that cannot carry one around,
/// configured from the environment on first use.
pub fn global() -> &'static Profiler {
    GLOBAL.get_or_init(Profiler::from_env)
}

/// Open a session on the [`global`] profiler.
pub fn enter(class: &str, method: &str) -> Session<'static> {
    global().enter(class, method)
}
