//! End-to-end: sessions on real threads feeding snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use callgauge_runtime::analysis;
use callgauge_runtime::{
    Measurement, MeasurementSource, Profiler, ProfilerConfig, Session, ThreadContext,
};

/// Clock that only moves when told to.
#[derive(Default)]
struct StepClock {
    now: AtomicU64,
}

impl StepClock {
    fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl MeasurementSource for StepClock {
    fn name(&self) -> &'static str {
        "step"
    }

    fn width(&self) -> usize {
        1
    }

    fn measure(&self) -> Measurement {
        Measurement::wall(self.now.load(Ordering::SeqCst))
    }
}

fn step_profiler() -> (Profiler, Arc<StepClock>) {
    let clock = Arc::new(StepClock::default());
    let profiler = Profiler::with_source(ProfilerConfig::default(), clock.clone());
    (profiler, clock)
}

#[test]
fn outer_inner_snapshot() {
    let (profiler, clock) = step_profiler();
    {
        let _outer = profiler.enter("App", "outer");
        for _ in 0..2 {
            let _inner = profiler.enter("App", "inner");
            clock.advance(10);
        }
        clock.advance(5);
    }

    let snapshot = profiler.snapshot();
    assert_eq!(snapshot.source, "step");
    assert_eq!(snapshot.roots.len(), 1);

    let outer = &snapshot.roots[0];
    assert_eq!(outer.qualified_name(), "App::outer");
    assert_eq!(outer.stats.calls, 1);
    assert_eq!(outer.stats.total_ns(), 25);
    assert_eq!(outer.edges.len(), 1);

    let edge = &outer.edges[0];
    assert_eq!(edge.calls, 2);
    assert_eq!(edge.value.primary(), 20);
    assert!(!edge.cyclic);
    assert_eq!(edge.target.stats.calls, 2);
    assert_eq!(edge.target.stats.min.map(|m| m.primary()), Some(10));
    assert!(edge.target.edges.is_empty());
}

#[test]
fn threads_aggregate_into_one_method() {
    let (profiler, clock) = step_profiler();
    std::thread::scope(|s| {
        for _ in 0..4 {
            let profiler = profiler.clone();
            let clock = Arc::clone(&clock);
            s.spawn(move || {
                for _ in 0..250 {
                    let _root = profiler.enter("Worker", "run");
                    let _leaf = profiler.enter("Worker", "step");
                    clock.advance(1);
                }
            });
        }
    });

    let run = profiler.registry().method("Worker", "run");
    let step = profiler.registry().method("Worker", "step");
    assert_eq!(run.calls(), 1000);
    assert_eq!(step.calls(), 1000);
    assert_eq!(run.callee(&step).calls(), 1000);
    assert_eq!(profiler.depth(), 0);

    let snapshot = profiler.snapshot();
    let roots: Vec<_> = snapshot.roots.iter().map(|r| r.method.as_str()).collect();
    assert_eq!(roots, ["run"]);
}

#[test]
fn mutual_recursion_snapshot_is_finite() {
    let (profiler, clock) = step_profiler();

    fn ping(profiler: &Profiler, clock: &StepClock, n: u32) {
        let _s = profiler.enter("Game", "ping");
        clock.advance(1);
        if n > 0 {
            pong(profiler, clock, n - 1);
        }
    }

    fn pong(profiler: &Profiler, clock: &StepClock, n: u32) {
        let _s = profiler.enter("Game", "pong");
        clock.advance(1);
        if n > 0 {
            ping(profiler, clock, n - 1);
        }
    }

    ping(&profiler, &clock, 6);

    let snapshot = profiler.snapshot();
    assert_eq!(snapshot.roots.len(), 1);
    let ping_node = &snapshot.roots[0];
    assert_eq!(ping_node.method, "ping");
    assert_eq!(ping_node.stats.calls, 1);
    assert_eq!(ping_node.stats.recursive_calls, 3);
    assert_eq!(ping_node.stats.total_ns(), 7);

    let pong_node = &ping_node.edges[0].target;
    assert_eq!(pong_node.method, "pong");
    let back = &pong_node.edges[0];
    assert!(back.cyclic);
    assert!(back.target.edges.is_empty());
    assert_eq!(snapshot.nodes().len(), 3);
}

#[test]
fn clear_opens_a_new_window() {
    let (profiler, clock) = step_profiler();
    profiler.profile("Job", "old", || clock.advance(3));
    let before = profiler.snapshot();
    assert_eq!(before.roots.len(), 1);

    profiler.clear();
    assert!(profiler.snapshot().is_empty());

    profiler.profile("Job", "new", || clock.advance(4));
    let after = profiler.snapshot();
    assert_eq!(after.roots.len(), 1);
    assert_eq!(after.roots[0].method, "new");
    assert!(after.started_at_ms >= before.started_at_ms);
}

#[test]
fn critical_path_follows_the_heaviest_edges() {
    let (profiler, clock) = step_profiler();
    {
        let _main = profiler.enter("App", "main");
        {
            let _load = profiler.enter("Io", "load");
            clock.advance(50);
        }
        {
            let _parse = profiler.enter("Text", "parse");
            {
                let _lex = profiler.enter("Text", "lex");
                clock.advance(20);
            }
            clock.advance(60);
        }
    }

    let mut snapshot = profiler.snapshot();
    analysis::highlight_critical_path(&mut snapshot);
    let path: Vec<_> = analysis::hottest_path(&snapshot)
        .iter()
        .map(|n| n.method.as_str())
        .collect();
    assert_eq!(path, ["main", "parse", "lex"]);
}

#[test]
fn sessions_on_explicit_contexts_nest() {
    let (profiler, clock) = step_profiler();
    let context = ThreadContext::new();
    {
        let _task = profiler.enter_in(&context, "Task", "poll");
        let _io: Session<'_> = profiler.enter_in(&context, "Task", "read");
        clock.advance(2);
        assert_eq!(context.depth(), 2);
    }
    assert_eq!(context.depth(), 0);
    let poll = profiler.registry().method("Task", "poll");
    let read = profiler.registry().method("Task", "read");
    assert_eq!(poll.callee(&read).calls(), 1);
}

#[test]
fn global_profiler_records() {
    {
        let _s = callgauge_runtime::enter("Global", "tick");
    }
    let tick = callgauge_runtime::global().registry().method("Global", "tick");
    assert!(tick.calls() >= 1);
}
