//! Indented text rendering of a call graph, one line per node.
//!
//! Root lines show the method's own totals; child lines show what flowed
//! through the edge from the parent. `*` marks a highlighted edge and `↺` an
//! edge back into a method already on the path.

use std::fmt::Write;

use callgauge_runtime::{
    format_measurement, prepare, CallEdge, CallNode, MethodSummary, RenderError, RenderOptions,
    Renderer, Snapshot,
};

const INDENT: &str = "  ";

#[derive(Debug, Default, Clone, Copy)]
pub struct OutlineRenderer;

impl Renderer for OutlineRenderer {
    fn extension(&self) -> &'static str {
        "txt"
    }

    fn render(&self, snapshot: &Snapshot, options: &RenderOptions) -> Result<String, RenderError> {
        let snapshot = prepare(snapshot, options);
        let mut out = String::new();
        if options.pretty {
            writeln!(
                out,
                "source: {}  window: {}..{} ms ({} ms)",
                snapshot.source,
                snapshot.started_at_ms,
                snapshot.ended_at_ms,
                snapshot.ended_at_ms.saturating_sub(snapshot.started_at_ms)
            )?;
        }
        if snapshot.is_empty() {
            writeln!(out, "(no calls recorded)")?;
            return Ok(out);
        }
        for root in &snapshot.roots {
            if options.pretty {
                writeln!(out)?;
            }
            write_root(&mut out, root, options)?;
        }
        Ok(out)
    }
}

fn name(node: &CallNode, options: &RenderOptions) -> String {
    if options.class_names && !node.class.is_empty() {
        node.qualified_name()
    } else {
        node.method.clone()
    }
}

fn plural(n: u64, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

fn write_root(out: &mut String, root: &CallNode, options: &RenderOptions) -> std::fmt::Result {
    let total = root
        .stats
        .sum
        .map(|s| format_measurement(&s))
        .unwrap_or_else(|| "-".to_owned());
    write!(
        out,
        "{}  {}  {}",
        name(root, options),
        plural(root.stats.calls, "call"),
        total
    )?;
    write_details(out, &root.stats, options)?;
    writeln!(out)?;
    for edge in &root.edges {
        write_edge(out, edge, 1, options)?;
    }
    Ok(())
}

fn write_edge(
    out: &mut String,
    edge: &CallEdge,
    depth: usize,
    options: &RenderOptions,
) -> std::fmt::Result {
    let marker = if edge.cyclic {
        "↺ "
    } else if edge.highlighted {
        "* "
    } else {
        ""
    };
    write!(
        out,
        "{}{}{}  {}  {}",
        INDENT.repeat(depth),
        marker,
        name(&edge.target, options),
        plural(edge.calls, "call"),
        format_measurement(&edge.value)
    )?;
    if edge.recursive_calls > 0 {
        write!(out, "  ({} recursive)", edge.recursive_calls)?;
    }
    if !edge.cyclic {
        write_details(out, &edge.target.stats, options)?;
    }
    writeln!(out)?;
    for child in &edge.target.edges {
        write_edge(out, child, depth + 1, options)?;
    }
    Ok(())
}

fn write_details(out: &mut String, stats: &MethodSummary, options: &RenderOptions) -> std::fmt::Result {
    if stats.errors > 0 {
        write!(out, "  [{}]", plural(stats.errors, "error"))?;
    }
    if options.min_max {
        if let (Some(min), Some(max)) = (stats.min, stats.max) {
            write!(
                out,
                "  min {}  max {}",
                format_measurement(&min),
                format_measurement(&max)
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::parse_snapshot;

    fn sample() -> Snapshot {
        parse_snapshot(
            r#"{
                "started_at_ms": 1000, "ended_at_ms": 1500, "source": "wall",
                "roots": [{
                    "id": 1, "class": "App", "method": "main", "calls": 1, "sum": [9000000],
                    "edges": [
                        {"calls": 3, "value": [6000000],
                         "target": {"id": 2, "class": "Text", "method": "parse", "calls": 3,
                                    "errors": 1, "sum": [6000000],
                                    "min": [1000000], "max": [3000000],
                                    "edges": [{"calls": 2, "recursive_calls": 2, "value": [500000],
                                               "cyclic": true,
                                               "target": {"id": 2, "class": "Text",
                                                          "method": "parse", "calls": 3}}]}},
                        {"calls": 1, "value": [2000000],
                         "target": {"id": 3, "class": "Io", "method": "load", "calls": 1,
                                    "sum": [2000000]}}
                    ]
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn outline_marks_critical_and_cyclic_edges() {
        let text = OutlineRenderer
            .render(&sample(), &RenderOptions::default())
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "source: wall  window: 1000..1500 ms (500 ms)");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "App::main  1 call  9.000ms");
        assert_eq!(lines[3], "  * Text::parse  3 calls  6.000ms  [1 error]");
        assert_eq!(lines[4], "    ↺ Text::parse  2 calls  0.500ms  (2 recursive)");
        assert_eq!(lines[5], "  Io::load  1 call  2.000ms");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn outline_without_classes_with_bounds() {
        let options = RenderOptions {
            class_names: false,
            highlight_critical: false,
            min_max: true,
            pretty: false,
        };
        let text = OutlineRenderer.render(&sample(), &options).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "main  1 call  9.000ms");
        assert_eq!(
            lines[1],
            "  parse  3 calls  6.000ms  [1 error]  min 1.000ms  max 3.000ms"
        );
    }

    #[test]
    fn empty_snapshot_says_so() {
        let snapshot = Snapshot {
            roots: Vec::new(),
            started_at_ms: 5,
            ended_at_ms: 5,
            source: "wall".to_owned(),
        };
        let options = RenderOptions {
            pretty: false,
            ..RenderOptions::default()
        };
        assert_eq!(
            OutlineRenderer.render(&snapshot, &options).unwrap(),
            "(no calls recorded)\n"
        );
    }
}
