//! Contract between snapshots and the renderers that serialize them.

use std::borrow::Cow;

use crate::analysis;
use crate::error::RenderError;
use crate::snapshot::Snapshot;

/// Rendering switches shared by all renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Prefix method names with their class.
    pub class_names: bool,
    /// Mark the most expensive edge of every node.
    pub highlight_critical: bool,
    /// Include per-method min/max.
    pub min_max: bool,
    /// Human-oriented layout (indentation, line breaks).
    pub pretty: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            class_names: true,
            highlight_critical: true,
            min_max: false,
            pretty: true,
        }
    }
}

/// Serializes a snapshot. The snapshot carries its own window timestamps.
pub trait Renderer {
    /// File extension for delivered output, without the dot.
    fn extension(&self) -> &'static str;

    fn render(&self, snapshot: &Snapshot, options: &RenderOptions) -> Result<String, RenderError>;
}

/// The snapshot a renderer should walk: annotated with the critical path
/// when the options ask for it, untouched otherwise.
pub fn prepare<'a>(snapshot: &'a Snapshot, options: &RenderOptions) -> Cow<'a, Snapshot> {
    if options.highlight_critical {
        let mut annotated = snapshot.clone();
        analysis::highlight_critical_path(&mut annotated);
        Cow::Owned(annotated)
    } else {
        Cow::Borrowed(snapshot)
    }
}
