//! Golden conformance testing infrastructure.
//!
//! Provides symbol-graph fixtures in MXNet's JSON format, a plain-Rust oracle
//! for the fixture MLP, and tolerance-based comparison helpers. Nothing here
//! touches the engine, so every crate in the workspace can use it as a
//! dev-dependency.

use std::collections::BTreeMap;

use serde::Serialize;

pub mod fixtures;

/// One node of an MXNet symbol graph, as serialized in `*-symbol.json`.
#[derive(Clone, Debug, Serialize)]
pub struct NodeSpec {
    pub op: String,
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    pub inputs: Vec<[usize; 3]>,
}

/// Whole-graph document understood by `MXSymbolCreateFromJSON`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GraphSpec {
    pub nodes: Vec<NodeSpec>,
    pub arg_nodes: Vec<usize>,
    pub heads: Vec<[usize; 3]>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a variable node and return its node id.
    pub fn variable(&mut self, name: &str) -> usize {
        let id = self.nodes.len();
        self.nodes.push(NodeSpec {
            op: "null".to_string(),
            name: name.to_string(),
            attrs: BTreeMap::new(),
            inputs: Vec::new(),
        });
        self.arg_nodes.push(id);
        id
    }

    /// Append an operator node reading output 0 of each input node.
    pub fn op(&mut self, op: &str, name: &str, attrs: &[(&str, &str)], inputs: &[usize]) -> usize {
        let id = self.nodes.len();
        self.nodes.push(NodeSpec {
            op: op.to_string(),
            name: name.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            inputs: inputs.iter().map(|&n| [n, 0, 0]).collect(),
        });
        id
    }

    /// Mark output 0 of `node` as a graph head.
    pub fn head(&mut self, node: usize) -> &mut Self {
        self.heads.push([node, 0, 0]);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("graph spec is always serializable")
    }
}

/// Assert two f32 slices are element-wise close.
pub fn assert_allclose(a: &[f32], b: &[f32], atol: f32, rtol: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "length mismatch: engine={} oracle={}",
        a.len(),
        b.len()
    );
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "mismatch at [{i}]: engine={x} oracle={y} diff={diff} tol={tol}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allclose_exact() {
        assert_allclose(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], 1e-6, 1e-6);
    }

    #[test]
    fn test_allclose_within_tolerance() {
        assert_allclose(&[1.0001], &[1.0], 1e-3, 1e-3);
    }

    #[test]
    #[should_panic(expected = "mismatch")]
    fn test_allclose_fails() {
        assert_allclose(&[1.0], &[2.0], 1e-6, 1e-6);
    }

    #[test]
    fn graph_spec_serializes_mxnet_layout() {
        let mut g = GraphSpec::new();
        let x = g.variable("x");
        let y = g.op("relu", "act", &[], &[x]);
        g.head(y);

        let value: serde_json::Value = serde_json::from_str(&g.to_json()).unwrap();
        assert_eq!(value["nodes"][0]["op"], "null");
        assert_eq!(value["nodes"][1]["inputs"][0], serde_json::json!([0, 0, 0]));
        assert_eq!(value["arg_nodes"], serde_json::json!([0]));
        assert_eq!(value["heads"], serde_json::json!([[1, 0, 0]]));
        assert!(value["nodes"][1].get("attrs").is_none());
    }
}
