//! Scoped profiling sessions.
//!
//! Instrumented code calls `Profiler::enter(class, method)` at method entry
//! and keeps the returned [`Session`] alive for the method body. When the
//! session drops (on any exit path, including `?` and panics) it pops its
//! frame, records the elapsed measurement on the method, and adds the same
//! measurement to the enclosing method's edge toward this one. The call graph
//! is built as a side effect of normal execution.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::caller::CallerStrategy;
use crate::config::ProfilerConfig;
use crate::measure::{self, Measurement, MeasurementSource};
use crate::registry::{MethodStats, Registry};
use crate::snapshot::{self, Snapshot};
use crate::stack::{self, CallStack, Frame, FrameToken, ThreadContext};

static NEXT_PROFILER_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    config: ProfilerConfig,
    registry: Arc<Registry>,
    source: Arc<dyn MeasurementSource>,
    callers: OnceLock<CallerStrategy>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        stack::retire_owner(self.id);
    }
}

/// Entry point for instrumented code: owns the registry, the measurement
/// source and the caller strategy. Cheap to clone; clones share everything,
/// including per-thread stacks.
#[derive(Clone)]
pub struct Profiler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("source", &self.inner.source.name())
            .finish_non_exhaustive()
    }
}

impl Profiler {
    /// Profiler with its own registry and a source chosen for `config`.
    pub fn new(config: ProfilerConfig) -> Self {
        let source = measure::select_source(config.cpu_time);
        Self::with_source(config, source)
    }

    /// Profiler configured from `CALLGAUGE_*` variables, measuring with the
    /// process default source.
    pub fn from_env() -> Self {
        Self::with_source(ProfilerConfig::from_env(), measure::default_source())
    }

    /// Profiler with an explicit measurement source.
    pub fn with_source(config: ProfilerConfig, source: Arc<dyn MeasurementSource>) -> Self {
        let registry = Arc::new(Registry::new(source.width()));
        Self::with_parts(config, source, registry)
    }

    /// Profiler writing into an existing registry. The registry's width must
    /// match the source's.
    pub fn with_parts(
        config: ProfilerConfig,
        source: Arc<dyn MeasurementSource>,
        registry: Arc<Registry>,
    ) -> Self {
        debug_assert_eq!(registry.width(), source.width());
        let id = NEXT_PROFILER_ID.fetch_add(1, Ordering::Relaxed);
        stack::register_owner(id);
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                registry,
                source,
                callers: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn source(&self) -> &Arc<dyn MeasurementSource> {
        &self.inner.source
    }

    /// The caller strategy, probed on first use.
    pub fn callers(&self) -> &CallerStrategy {
        self.inner.callers.get_or_init(|| {
            CallerStrategy::probe(self.inner.config.caller_depth, self.inner.config.class_names)
        })
    }

    /// Open a session for `class::method` on the current thread.
    pub fn enter(&self, class: &str, method: &str) -> Session<'_> {
        let class = self.inner.config.class_names.normalize(class);
        let stats = self.inner.registry.method(class, method);
        self.open(StackRef::Thread, stats)
    }

    /// Open a session for whichever method called this one.
    #[inline(never)]
    pub fn enter_caller(&self) -> Session<'_> {
        let site = self.callers().identify();
        let stats = self.inner.registry.method(&site.class, &site.method);
        self.open(StackRef::Thread, stats)
    }

    /// Open a session on an explicitly held stack instead of the thread's.
    pub fn enter_in(&self, context: &ThreadContext, class: &str, method: &str) -> Session<'_> {
        let class = self.inner.config.class_names.normalize(class);
        let stats = self.inner.registry.method(class, method);
        self.open(StackRef::Explicit(context.clone()), stats)
    }

    /// Run `f` inside a session. A panic in `f` is recorded as an error and
    /// keeps unwinding.
    pub fn profile<T>(&self, class: &str, method: &str, f: impl FnOnce() -> T) -> T {
        let _session = self.enter(class, method);
        f()
    }

    /// Run `f` inside a session, recording an error when it returns `Err`.
    /// The result is passed through untouched.
    pub fn profile_result<T, E>(
        &self,
        class: &str,
        method: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let session = self.enter(class, method);
        let result = f();
        if result.is_err() {
            session.mark_error();
        }
        result
    }

    /// Number of sessions open on the current thread.
    pub fn depth(&self) -> usize {
        stack::with_thread_stack(self.inner.id, |s| s.depth()).unwrap_or(0)
    }

    /// Immutable call graph of everything recorded so far.
    pub fn snapshot(&self) -> Snapshot {
        snapshot::build(&self.inner.registry, self.inner.source.name())
    }

    /// Reset all statistics and reopen the measurement window.
    pub fn clear(&self) {
        self.inner.registry.clear();
    }

    fn open(&self, stack: StackRef, stats: Arc<MethodStats>) -> Session<'_> {
        let source = &*self.inner.source;
        let token = match &stack {
            StackRef::Thread => stack::with_thread_stack(self.inner.id, |s| s.push(stats, source)),
            StackRef::Explicit(context) => Some(context.with(|s| s.push(stats, source))),
        };
        Session {
            profiler: self,
            stack,
            token,
            _not_send: PhantomData,
        }
    }
}

enum StackRef {
    Thread,
    Explicit(ThreadContext),
}

/// An open profiling scope. Records its measurement when dropped.
#[must_use = "dropping the session immediately records ~0ns; bind it with `let _session = ...`"]
pub struct Session<'p> {
    profiler: &'p Profiler,
    stack: StackRef,
    /// `None` when the thread's stack was unavailable at entry.
    token: Option<FrameToken>,
    // Frames belong to the thread that opened them.
    _not_send: PhantomData<*const ()>,
}

impl Session<'_> {
    /// Note that the profiled call is ending abnormally. The measurement is
    /// still recorded; the method's error count goes up by one.
    pub fn mark_error(&self) {
        if let Some(token) = self.token {
            self.with_stack(|s| s.mark_error(token));
        }
    }

    /// Release now. Equivalent to dropping the session.
    pub fn close(self) {}

    fn with_stack<R>(&self, f: impl FnOnce(&mut CallStack) -> R) -> Option<R> {
        match &self.stack {
            StackRef::Thread => stack::with_thread_stack(self.profiler.inner.id, f),
            StackRef::Explicit(context) => Some(context.with(f)),
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let panicking = std::thread::panicking();
        let source = &*self.profiler.inner.source;
        let released = self.with_stack(|s| {
            if panicking {
                s.mark_error(token);
            }
            let (frame, elapsed) = s.pop(token, source);
            record(&frame, &elapsed, s.top());
        });
        if released.is_none() {
            log::error!("callgauge: session released after its thread's call stack was torn down");
        }
    }
}

/// Fold a finished frame into its method and its caller's edge.
fn record(frame: &Frame, elapsed: &Measurement, parent: Option<&Frame>) {
    let stats = frame.stats();
    stats.add_call(elapsed, !frame.is_recursive());
    if frame.has_error() {
        stats.record_error();
        log::debug!("{}::{} ended with an error", stats.class(), stats.method());
    }
    if let Some(parent) = parent {
        parent
            .stats()
            .callee(stats)
            .add(elapsed, frame.is_recursive());
    }
}
