//! JSON-path delta aggregation (design note 9): tool arguments stream as
//! delta key paths like `result.tools.0.arguments.query`; this rebuilds the
//! final document without attempting to decode before the stream ends, and
//! separately tracks when a tool at index `k` is first seen vs. updated.

use serde_json::Value;

#[derive(Debug, Default)]
pub struct JsonPathAggregator {
    root: Value,
}

impl JsonPathAggregator {
    pub fn new() -> Self {
        Self { root: Value::Null }
    }

    /// Merge one delta at `path` into the tree. String deltas at a leaf are
    /// concatenated (matching streamed text/argument fragments); any other
    /// value replaces the leaf.
    pub fn apply(&mut self, path: &str, delta: Value) {
        let segments: Vec<PathSegment> = parse_path(path);
        apply_at(&mut self.root, &segments, delta);
    }

    pub fn finish(self) -> Value {
        self.root
    }

    pub fn current(&self) -> &Value {
        &self.root
    }
}

#[derive(Debug, Clone)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<usize>() {
            Ok(i) => PathSegment::Index(i),
            Err(_) => PathSegment::Key(s.to_string()),
        })
        .collect()
}

fn apply_at(node: &mut Value, path: &[PathSegment], delta: Value) {
    let Some((head, rest)) = path.split_first() else {
        merge_leaf(node, delta);
        return;
    };

    match head {
        PathSegment::Key(key) => {
            if !node.is_object() {
                *node = Value::Object(Default::default());
            }
            let obj = node.as_object_mut().unwrap();
            let child = obj.entry(key.clone()).or_insert(Value::Null);
            apply_at(child, rest, delta);
        }
        PathSegment::Index(idx) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let arr = node.as_array_mut().unwrap();
            while arr.len() <= *idx {
                arr.push(Value::Null);
            }
            apply_at(&mut arr[*idx], rest, delta);
        }
    }
}

fn merge_leaf(node: &mut Value, delta: Value) {
    match (&node, &delta) {
        (Value::String(existing), Value::String(add)) => {
            let mut combined = existing.clone();
            combined.push_str(add);
            *node = Value::String(combined);
        }
        (Value::Null, _) => *node = delta,
        _ => *node = delta,
    }
}

/// Watches `result.tools.{k}.arguments` style paths and reports whether a
/// tool at index `k` is being seen for the first time.
#[derive(Debug, Default)]
pub struct ToolArgCollector {
    seen_indices: std::collections::HashSet<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolArgEvent {
    Start(usize),
    Delta(usize),
    Unrelated,
}

impl ToolArgCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `path` against the tool-arguments convention and records
    /// first-sight state. Paths not under `tools.{k}` are `Unrelated`.
    pub fn observe(&mut self, path: &str) -> ToolArgEvent {
        let segments = parse_path(path);
        let idx = segments.iter().enumerate().find_map(|(i, seg)| match seg {
            PathSegment::Key(k) if k == "tools" => segments.get(i + 1).and_then(|next| match next {
                PathSegment::Index(idx) => Some(*idx),
                _ => None,
            }),
            _ => None,
        });

        let Some(idx) = idx else {
            return ToolArgEvent::Unrelated;
        };

        if self.seen_indices.insert(idx) {
            ToolArgEvent::Start(idx)
        } else {
            ToolArgEvent::Delta(idx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuilds_text_deltas_at_a_path() {
        let mut agg = JsonPathAggregator::new();
        agg.apply("result.text", Value::String("Hel".to_string()));
        agg.apply("result.text", Value::String("lo".to_string()));
        let v = agg.finish();
        assert_eq!(v["result"]["text"], "Hello");
    }

    #[test]
    fn rebuilds_array_index_paths() {
        let mut agg = JsonPathAggregator::new();
        agg.apply("result.tools.0.name", Value::String("ls".to_string()));
        agg.apply("result.tools.0.arguments", Value::String("{\"path\":".to_string()));
        agg.apply("result.tools.0.arguments", Value::String("\".\"}".to_string()));
        let v = agg.finish();
        assert_eq!(v["result"]["tools"][0]["name"], "ls");
        assert_eq!(v["result"]["tools"][0]["arguments"], "{\"path\":\".\"}");
    }

    #[test]
    fn tool_arg_collector_emits_start_once() {
        let mut collector = ToolArgCollector::new();
        assert_eq!(
            collector.observe("result.tools.0.arguments.query"),
            ToolArgEvent::Start(0)
        );
        assert_eq!(
            collector.observe("result.tools.0.arguments.query"),
            ToolArgEvent::Delta(0)
        );
        assert_eq!(
            collector.observe("result.tools.1.arguments.query"),
            ToolArgEvent::Start(1)
        );
    }

    #[test]
    fn unpathed_text_is_unrelated() {
        let mut collector = ToolArgCollector::new();
        assert_eq!(collector.observe("text"), ToolArgEvent::Unrelated);
    }
}
