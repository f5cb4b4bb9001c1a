//! JSON snapshot documents.
//!
//! Measurements are stored as arrays of nanosecond components (`[wall]` or
//! `[wall, cpu]`). `class` and the `min`/`max` pair are omitted when the
//! render options turn them off; a loaded document fills the gaps with an
//! empty class and no bounds.

use std::path::Path;

use serde::{Deserialize, Serialize};

use callgauge_runtime::{
    prepare, CallEdge, CallNode, Measurement, MethodId, MethodSummary, RenderError, RenderOptions,
    Renderer, Snapshot,
};

use crate::error::Error;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    started_at_ms: u64,
    ended_at_ms: u64,
    source: String,
    roots: Vec<NodeDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeDoc {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class: Option<String>,
    method: String,
    calls: u64,
    #[serde(default)]
    recursive_calls: u64,
    #[serde(default)]
    errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sum: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    edges: Vec<EdgeDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeDoc {
    calls: u64,
    #[serde(default)]
    recursive_calls: u64,
    value: Vec<u64>,
    #[serde(default)]
    cyclic: bool,
    #[serde(default)]
    highlighted: bool,
    target: NodeDoc,
}

/// Renders snapshots as JSON documents readable by [`load_snapshot`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, snapshot: &Snapshot, options: &RenderOptions) -> Result<String, RenderError> {
        let snapshot = prepare(snapshot, options);
        let doc = SnapshotDoc {
            started_at_ms: snapshot.started_at_ms,
            ended_at_ms: snapshot.ended_at_ms,
            source: snapshot.source.clone(),
            roots: snapshot.roots.iter().map(|r| node_doc(r, options)).collect(),
        };
        let json = if options.pretty {
            serde_json::to_string_pretty(&doc)
        } else {
            serde_json::to_string(&doc)
        };
        json.map_err(|e| RenderError::Serialize(e.to_string()))
    }
}

fn node_doc(node: &CallNode, options: &RenderOptions) -> NodeDoc {
    let components = |m: Option<Measurement>| m.map(|m| m.components().to_vec());
    NodeDoc {
        id: node.id.0,
        class: options.class_names.then(|| node.class.clone()),
        method: node.method.clone(),
        calls: node.stats.calls,
        recursive_calls: node.stats.recursive_calls,
        errors: node.stats.errors,
        sum: components(node.stats.sum),
        min: components(node.stats.min.filter(|_| options.min_max)),
        max: components(node.stats.max.filter(|_| options.min_max)),
        edges: node
            .edges
            .iter()
            .map(|e| EdgeDoc {
                calls: e.calls,
                recursive_calls: e.recursive_calls,
                value: e.value.components().to_vec(),
                cyclic: e.cyclic,
                highlighted: e.highlighted,
                target: node_doc(&e.target, options),
            })
            .collect(),
    }
}

/// Parse a JSON snapshot document.
pub fn parse_snapshot(json: &str) -> Result<Snapshot, String> {
    let doc: SnapshotDoc = serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok(Snapshot {
        started_at_ms: doc.started_at_ms,
        ended_at_ms: doc.ended_at_ms,
        source: doc.source,
        roots: doc
            .roots
            .into_iter()
            .map(node_from_doc)
            .collect::<Result<_, _>>()?,
    })
}

/// Load a snapshot file written by [`JsonRenderer`].
pub fn load_snapshot(path: &Path) -> Result<Snapshot, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::SnapshotReadError {
        path: path.to_path_buf(),
        source,
    })?;
    parse_snapshot(&contents).map_err(|reason| Error::InvalidSnapshot {
        path: path.to_path_buf(),
        reason,
    })
}

fn measurement(components: &[u64]) -> Result<Measurement, String> {
    Measurement::from_components(components)
        .ok_or_else(|| format!("measurement must have 1 or 2 components, got {}", components.len()))
}

fn optional(components: Option<Vec<u64>>) -> Result<Option<Measurement>, String> {
    components.as_deref().map(measurement).transpose()
}

fn node_from_doc(doc: NodeDoc) -> Result<CallNode, String> {
    Ok(CallNode {
        id: MethodId(doc.id),
        class: doc.class.unwrap_or_default(),
        method: doc.method,
        stats: MethodSummary {
            calls: doc.calls,
            recursive_calls: doc.recursive_calls,
            errors: doc.errors,
            sum: optional(doc.sum)?,
            min: optional(doc.min)?,
            max: optional(doc.max)?,
        },
        edges: doc
            .edges
            .into_iter()
            .map(|e| -> Result<CallEdge, String> {
                Ok(CallEdge {
                    value: measurement(&e.value)?,
                    calls: e.calls,
                    recursive_calls: e.recursive_calls,
                    cyclic: e.cyclic,
                    highlighted: e.highlighted,
                    target: node_from_doc(e.target)?,
                })
            })
            .collect::<Result<_, _>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "started_at_ms": 1000,
            "ended_at_ms": 4000,
            "source": "wall+cpu",
            "roots": [{
                "id": 1, "class": "App", "method": "main", "calls": 1,
                "sum": [3000000, 2000000],
                "edges": [
                    {"calls": 2, "value": [2000000, 1500000], "highlighted": true,
                     "target": {"id": 2, "class": "Io", "method": "read", "calls": 2,
                                "errors": 1, "sum": [2000000, 1500000],
                                "min": [500000, 400000], "max": [1500000, 1100000]}},
                    {"calls": 1, "value": [10, 5], "cyclic": true,
                     "target": {"id": 1, "class": "App", "method": "main", "calls": 1}}
                ]
            }]
        }"#
    }

    #[test]
    fn parse_sample_document() {
        let snapshot = parse_snapshot(sample_json()).unwrap();
        assert_eq!(snapshot.source, "wall+cpu");
        assert_eq!(snapshot.ended_at_ms - snapshot.started_at_ms, 3000);
        let main = &snapshot.roots[0];
        assert_eq!(main.qualified_name(), "App::main");
        assert_eq!(main.stats.sum.unwrap().cpu(), Some(2_000_000));
        assert!(main.edges[0].highlighted);
        assert!(main.edges[1].cyclic);
        let read = snapshot.find("Io", "read").unwrap();
        assert_eq!(read.stats.errors, 1);
        assert_eq!(read.stats.min.unwrap().primary(), 500_000);
    }

    #[test]
    fn rendered_document_parses_back() {
        let original = parse_snapshot(sample_json()).unwrap();
        let options = RenderOptions {
            min_max: true,
            highlight_critical: false,
            ..RenderOptions::default()
        };
        let rendered = JsonRenderer.render(&original, &options).unwrap();
        assert_eq!(parse_snapshot(&rendered).unwrap(), original);
    }

    #[test]
    fn options_drop_classes_and_bounds() {
        let snapshot = parse_snapshot(sample_json()).unwrap();
        let options = RenderOptions {
            class_names: false,
            min_max: false,
            pretty: false,
            highlight_critical: false,
        };
        let rendered = JsonRenderer.render(&snapshot, &options).unwrap();
        assert!(!rendered.contains("\"class\""));
        assert!(!rendered.contains("\"min\""));
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn highlight_option_marks_critical_edge() {
        let mut snapshot = parse_snapshot(sample_json()).unwrap();
        snapshot.roots[0].edges[0].highlighted = false;
        let rendered = JsonRenderer
            .render(&snapshot, &RenderOptions::default())
            .unwrap();
        let reparsed = parse_snapshot(&rendered).unwrap();
        assert!(reparsed.roots[0].edges[0].highlighted);
        assert!(!reparsed.roots[0].edges[1].highlighted, "cyclic edges are never critical");
    }

    #[test]
    fn bad_measurement_is_rejected() {
        let json = r#"{"started_at_ms":0,"ended_at_ms":0,"source":"wall",
            "roots":[{"id":1,"method":"m","calls":1,"sum":[]}]}"#;
        let err = parse_snapshot(json).unwrap_err();
        assert!(err.contains("1 or 2 components"), "{err}");
    }

    #[test]
    fn load_snapshot_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.json");
        std::fs::write(&path, "not json").unwrap();
        match load_snapshot(&path) {
            Err(Error::InvalidSnapshot { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected InvalidSnapshot, got {other:?}"),
        }
        assert!(matches!(
            load_snapshot(&dir.path().join("missing.json")),
            Err(Error::SnapshotReadError { .. })
        ));
    }
}
