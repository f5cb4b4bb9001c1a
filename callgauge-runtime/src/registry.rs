//! Cross-thread aggregation of per-method statistics.
//!
//! Structure: `Registry` → `ClassStats` (by class name) → `MethodStats` (by
//! method name) → `CalleeEdge` (by callee identity). Inserting a new key takes
//! the write lock of the one map being extended; lookups of existing keys take
//! its read lock briefly.
//!
//! Counters are relaxed atomics updated without any lock. Counts and sums use
//! `fetch_add` and are exact. Min/max are a compare followed by a store of every
//! component, so two threads racing on the same method can leave an extreme
//! that is slightly stale or mixes components of two calls. That is the price
//! for never blocking instrumented threads; it can never corrupt the maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::measure::{Measurement, MAX_COMPONENTS};

/// Current time as milliseconds since the Unix epoch.
pub(crate) fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Process-unique identity of a `MethodStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

static NEXT_METHOD_ID: AtomicU64 = AtomicU64::new(1);

impl MethodId {
    fn next() -> Self {
        MethodId(NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A measurement whose components are independent relaxed atomics.
#[derive(Debug)]
pub(crate) struct AtomicMeasurement {
    values: [AtomicU64; MAX_COMPONENTS],
    width: usize,
}

impl AtomicMeasurement {
    fn filled(width: usize, fill: u64) -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(fill)),
            width: width.clamp(1, MAX_COMPONENTS),
        }
    }

    fn load(&self) -> Measurement {
        let mut raw = [0u64; MAX_COMPONENTS];
        for (slot, v) in raw.iter_mut().zip(&self.values) {
            *slot = v.load(Ordering::Relaxed);
        }
        Measurement::from_components(&raw[..self.width]).unwrap_or_else(|| Measurement::zero(1))
    }

    fn primary(&self) -> u64 {
        self.values[0].load(Ordering::Relaxed)
    }

    fn add(&self, delta: &Measurement) {
        for (v, d) in self.values.iter().zip(delta.components()) {
            v.fetch_add(*d, Ordering::Relaxed);
        }
    }

    fn store(&self, value: &Measurement) {
        for (v, d) in self.values.iter().zip(value.components()) {
            v.store(*d, Ordering::Relaxed);
        }
    }

    fn fill(&self, fill: u64) {
        for v in &self.values {
            v.store(fill, Ordering::Relaxed);
        }
    }
}

/// Aggregated calls from one caller method to one callee method.
#[derive(Debug)]
pub struct CalleeEdge {
    target: Weak<MethodStats>,
    target_id: MethodId,
    sum: AtomicMeasurement,
    calls: AtomicU64,
    recursive_calls: AtomicU64,
}

impl CalleeEdge {
    fn new(target: &Arc<MethodStats>, width: usize) -> Self {
        Self {
            target: Arc::downgrade(target),
            target_id: target.id,
            sum: AtomicMeasurement::filled(width, 0),
            calls: AtomicU64::new(0),
            recursive_calls: AtomicU64::new(0),
        }
    }

    /// Record one call through this edge. `callee_recursive` marks calls whose
    /// callee invocation was itself recursive.
    pub fn add(&self, delta: &Measurement, callee_recursive: bool) {
        self.sum.add(delta);
        self.calls.fetch_add(1, Ordering::Relaxed);
        if callee_recursive {
            self.recursive_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The callee. `None` only if its registry has been dropped.
    pub fn target(&self) -> Option<Arc<MethodStats>> {
        self.target.upgrade()
    }

    pub fn target_id(&self) -> MethodId {
        self.target_id
    }

    pub fn sum(&self) -> Measurement {
        self.sum.load()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn recursive_calls(&self) -> u64 {
        self.recursive_calls.load(Ordering::Relaxed)
    }

    /// Calls through this edge that entered the callee non-recursively.
    pub fn outermost_calls(&self) -> u64 {
        self.calls().saturating_sub(self.recursive_calls())
    }
}

/// Statistics for one profiled method.
#[derive(Debug)]
pub struct MethodStats {
    id: MethodId,
    class: Arc<str>,
    method: Arc<str>,
    width: usize,
    calls: AtomicU64,
    recursive_calls: AtomicU64,
    errors: AtomicU64,
    sum: AtomicMeasurement,
    min: AtomicMeasurement,
    max: AtomicMeasurement,
    callees: RwLock<HashMap<MethodId, Arc<CalleeEdge>>>,
}

impl MethodStats {
    fn new(class: Arc<str>, method: &str, width: usize) -> Self {
        Self {
            id: MethodId::next(),
            class,
            method: Arc::from(method),
            width,
            calls: AtomicU64::new(0),
            recursive_calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            sum: AtomicMeasurement::filled(width, 0),
            min: AtomicMeasurement::filled(width, u64::MAX),
            max: AtomicMeasurement::filled(width, 0),
            callees: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Record one finished invocation.
    ///
    /// Only outermost invocations count toward `calls`, `sum`, `min` and
    /// `max`: a recursive invocation's span lies inside its ancestor's span,
    /// so adding it would count the same time twice.
    pub fn add_call(&self, delta: &Measurement, not_recursive: bool) {
        if !not_recursive {
            self.recursive_calls.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.sum.add(delta);
        if delta.primary() < self.min.primary() {
            self.min.store(delta);
        }
        if delta.primary() > self.max.primary() {
            self.max.store(delta);
        }
        // Counted last so a reader that sees `calls > 0` also sees the sum.
        self.calls.fetch_add(1, Ordering::Release);
    }

    /// Note an invocation that ended with an error or a panic.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    pub fn recursive_calls(&self) -> u64 {
        self.recursive_calls.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Total of all outermost invocations; absent until the first one.
    pub fn sum(&self) -> Option<Measurement> {
        (self.calls() > 0).then(|| self.sum.load())
    }

    /// Shortest outermost invocation; absent until the first one.
    pub fn min(&self) -> Option<Measurement> {
        (self.min.primary() != u64::MAX).then(|| self.min.load())
    }

    /// Longest outermost invocation; absent until the first one.
    pub fn max(&self) -> Option<Measurement> {
        (self.calls() > 0).then(|| self.max.load())
    }

    /// Edge toward `target`, created on first use.
    pub fn callee(&self, target: &Arc<MethodStats>) -> Arc<CalleeEdge> {
        if let Some(edge) = self
            .callees
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&target.id)
        {
            return Arc::clone(edge);
        }
        let mut callees = self.callees.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            callees
                .entry(target.id)
                .or_insert_with(|| Arc::new(CalleeEdge::new(target, self.width))),
        )
    }

    /// All outgoing edges, in no particular order.
    pub fn callees(&self) -> Vec<Arc<CalleeEdge>> {
        self.callees
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.recursive_calls.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.sum.fill(0);
        self.min.fill(u64::MAX);
        self.max.fill(0);
        self.callees
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// All methods of one class.
#[derive(Debug)]
pub struct ClassStats {
    name: Arc<str>,
    width: usize,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
}

impl ClassStats {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stats for `method`, created on first use.
    pub fn method(&self, method: &str) -> Arc<MethodStats> {
        if let Some(stats) = self
            .methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
        {
            return Arc::clone(stats);
        }
        let mut methods = self.methods.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(methods.entry(method.to_owned()).or_insert_with(|| {
            Arc::new(MethodStats::new(Arc::clone(&self.name), method, self.width))
        }))
    }

    pub fn methods(&self) -> Vec<Arc<MethodStats>> {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Registry of every class and method seen by a profiler.
#[derive(Debug)]
pub struct Registry {
    width: usize,
    classes: RwLock<HashMap<String, Arc<ClassStats>>>,
    started_at_ms: AtomicU64,
}

impl Registry {
    /// Empty registry for measurements of `width` components.
    pub fn new(width: usize) -> Self {
        Self {
            width: width.clamp(1, MAX_COMPONENTS),
            classes: RwLock::new(HashMap::new()),
            started_at_ms: AtomicU64::new(timestamp_ms()),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Stats for `class`, created on first use.
    pub fn class(&self, class: &str) -> Arc<ClassStats> {
        if let Some(stats) = self
            .classes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(class)
        {
            return Arc::clone(stats);
        }
        let mut classes = self.classes.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(classes.entry(class.to_owned()).or_insert_with(|| {
            Arc::new(ClassStats {
                name: Arc::from(class),
                width: self.width,
                methods: RwLock::new(HashMap::new()),
            })
        }))
    }

    /// Shorthand for `class(class).method(method)`.
    pub fn method(&self, class: &str, method: &str) -> Arc<MethodStats> {
        self.class(class).method(method)
    }

    pub fn classes(&self) -> Vec<Arc<ClassStats>> {
        self.classes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Every method of every class.
    pub fn methods(&self) -> Vec<Arc<MethodStats>> {
        self.classes()
            .iter()
            .flat_map(|class| class.methods())
            .collect()
    }

    /// When the current measurement window opened (ms since the Unix epoch).
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms.load(Ordering::Relaxed)
    }

    /// Reset every method's counters and call graph and reopen the
    /// measurement window. Class and method identities are kept, so stats
    /// handles held elsewhere stay valid.
    pub fn clear(&self) {
        for method in self.methods() {
            method.reset();
        }
        self.started_at_ms.store(timestamp_ms(), Ordering::Relaxed);
    }
}
