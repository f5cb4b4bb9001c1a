//! Per-thread stacks of active profiling frames.
//!
//! Each profiled invocation pushes a [`Frame`] on entry and pops it on exit.
//! A stack is owned by one thread of control and never shared. Stacks are
//! found either through a thread-local table keyed by profiler id, or held
//! explicitly in a [`ThreadContext`] by runtimes that multiplex logical
//! threads over OS threads.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::{Arc, OnceLock, RwLock};

use crate::measure::{Measurement, MeasurementSource};
use crate::registry::{MethodId, MethodStats};

/// One active invocation.
#[derive(Debug)]
pub struct Frame {
    stats: Arc<MethodStats>,
    entry: Measurement,
    recursive: bool,
    error: bool,
    depth: usize,
}

impl Frame {
    pub fn stats(&self) -> &Arc<MethodStats> {
        &self.stats
    }

    pub fn entry(&self) -> Measurement {
        self.entry
    }

    /// Whether the same method was already active below this frame.
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Receipt for a push; must be handed back to the matching `pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    depth: usize,
    method: MethodId,
}

/// Stack of active frames for one thread of control.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a frame for `stats`, reading the entry measurement last so the
    /// recursion scan is not billed to the method.
    ///
    /// The frame is recursive if the same method is active anywhere on this
    /// stack, which covers indirect recursion (A → B → A) as well as direct.
    pub fn push(&mut self, stats: Arc<MethodStats>, source: &dyn MeasurementSource) -> FrameToken {
        let id = stats.id();
        let recursive = self.is_active(id);
        let depth = self.frames.len();
        self.frames.push(Frame {
            stats,
            entry: Measurement::zero(source.width()),
            recursive,
            error: false,
            depth,
        });
        // Only the top frame exists at `depth` right now.
        self.frames[depth].entry = source.measure();
        FrameToken { depth, method: id }
    }

    /// Close the top frame, returning it with its elapsed measurement.
    ///
    /// # Panics
    ///
    /// If `token` does not belong to the top frame. Sessions release in
    /// strict LIFO order; anything else means the instrumentation is broken
    /// and the accounting of every enclosing frame would be wrong.
    pub fn pop(&mut self, token: FrameToken, source: &dyn MeasurementSource) -> (Frame, Measurement) {
        let exit = source.measure();
        let frame = match self.frames.pop() {
            Some(top) if top.depth == token.depth && top.stats.id() == token.method => top,
            top => panic!(
                "callgauge: mismatched frame release (releasing depth {} of method {:?}, top frame depth {:?})",
                token.depth,
                token.method,
                top.map(|f| f.depth)
            ),
        };
        let elapsed = exit - frame.entry;
        (frame, elapsed)
    }

    /// Flag the frame for `token` as ended abnormally.
    pub fn mark_error(&mut self, token: FrameToken) {
        if let Some(frame) = self.frames.get_mut(token.depth) {
            if frame.stats.id() == token.method {
                frame.error = true;
            }
        }
    }

    /// The innermost active frame.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether `method` has an active frame on this stack.
    pub fn is_active(&self, method: MethodId) -> bool {
        self.frames.iter().any(|f| f.stats.id() == method)
    }
}

thread_local! {
    static STACKS: RefCell<Vec<(u64, CallStack)>> = const { RefCell::new(Vec::new()) };
}

/// Ids of profilers that are still alive. Stacks of other owners are
/// dropped from a thread's table once they are empty.
static LIVE_OWNERS: OnceLock<RwLock<HashSet<u64>>> = OnceLock::new();

fn live_owners() -> &'static RwLock<HashSet<u64>> {
    LIVE_OWNERS.get_or_init(|| RwLock::new(HashSet::new()))
}

/// Note that profiler `owner` exists and may open stacks.
pub(crate) fn register_owner(owner: u64) {
    live_owners()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(owner);
}

/// Note that profiler `owner` is gone. Its empty stack on this thread is
/// dropped now; other threads drop theirs the next time they add a stack.
pub(crate) fn retire_owner(owner: u64) {
    live_owners()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&owner);
    let _ = STACKS.try_with(|stacks| {
        if let Ok(mut stacks) = stacks.try_borrow_mut() {
            stacks.retain(|(id, stack)| *id != owner || !stack.is_empty());
        }
    });
}

/// Drop empty stacks whose owner has been retired.
fn prune_retired(stacks: &mut Vec<(u64, CallStack)>) {
    let live = live_owners().read().unwrap_or_else(|e| e.into_inner());
    stacks.retain(|(id, stack)| !stack.is_empty() || live.contains(id));
}

/// Run `f` on this thread's stack for profiler `owner`, creating it if needed.
///
/// Returns `None` once the thread's locals have been torn down.
pub(crate) fn with_thread_stack<R>(owner: u64, f: impl FnOnce(&mut CallStack) -> R) -> Option<R> {
    STACKS
        .try_with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let index = match stacks.iter().position(|(id, _)| *id == owner) {
                Some(i) => i,
                None => {
                    prune_retired(&mut stacks);
                    stacks.push((owner, CallStack::new()));
                    stacks.len() - 1
                }
            };
            f(&mut stacks[index].1)
        })
        .ok()
}

/// Number of stacks in this thread's table.
#[cfg(test)]
pub(crate) fn thread_stack_count() -> usize {
    STACKS.with(|stacks| stacks.borrow().len())
}

/// Explicitly held call stack for one logical thread of control.
///
/// Clones share the same stack. Not `Send`: a context must stay on the
/// thread that drives it.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    stack: Rc<RefCell<CallStack>>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().depth()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut CallStack) -> R) -> R {
        f(&mut *self.stack.borrow_mut())
    }
}
