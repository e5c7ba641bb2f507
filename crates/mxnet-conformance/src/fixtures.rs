//! Ready-made graphs and weights.

use crate::GraphSpec;

pub const MLP_INPUT: usize = 3;
pub const MLP_HIDDEN: usize = 4;
pub const MLP_OUTPUT: usize = 2;

/// Names declared by [`mlp_symbol_json`], in declaration order.
pub const MLP_NAMES: [&str; 5] = ["data", "w1", "b1", "w2", "b2"];

/// `data -> FullyConnected(fc1) -> Activation(relu1) -> FullyConnected(fc2)`.
pub fn mlp_graph() -> GraphSpec {
    let hidden = MLP_HIDDEN.to_string();
    let output = MLP_OUTPUT.to_string();

    let mut g = GraphSpec::new();
    let data = g.variable("data");
    let w1 = g.variable("w1");
    let b1 = g.variable("b1");
    let fc1 = g.op(
        "FullyConnected",
        "fc1",
        &[("num_hidden", hidden.as_str())],
        &[data, w1, b1],
    );
    let relu1 = g.op("Activation", "relu1", &[("act_type", "relu")], &[fc1]);
    let w2 = g.variable("w2");
    let b2 = g.variable("b2");
    let fc2 = g.op(
        "FullyConnected",
        "fc2",
        &[("num_hidden", output.as_str())],
        &[relu1, w2, b2],
    );
    g.head(fc2);
    g
}

pub fn mlp_symbol_json() -> String {
    mlp_graph().to_json()
}

/// Two heads over one input: a dense `relu` and a CSR `cast_storage`.
pub fn sparse_heads_symbol_json() -> String {
    let mut g = GraphSpec::new();
    let data = g.variable("data");
    let dense = g.op("relu", "dense_out", &[], &[data]);
    let csr = g.op("cast_storage", "csr_out", &[("stype", "csr")], &[data]);
    g.head(dense).head(csr);
    g.to_json()
}

/// Deterministic MLP weights plus a plain-Rust forward pass used as oracle.
#[derive(Clone, Debug, PartialEq)]
pub struct MlpWeights {
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: Vec<f32>,
}

impl MlpWeights {
    pub fn deterministic() -> Self {
        let fill = |n: usize, phase: f32| -> Vec<f32> {
            (0..n)
                .map(|i| ((i as f32 + phase) * 0.37).sin() * 0.5)
                .collect()
        };
        Self {
            w1: fill(MLP_HIDDEN * MLP_INPUT, 0.0),
            b1: fill(MLP_HIDDEN, 1.5),
            w2: fill(MLP_OUTPUT * MLP_HIDDEN, 3.0),
            b2: fill(MLP_OUTPUT, 4.5),
        }
    }

    /// `(name, dims, values)` for every parameter, in graph order.
    pub fn named(&self) -> Vec<(&'static str, Vec<i64>, &[f32])> {
        vec![
            ("w1", vec![MLP_HIDDEN as i64, MLP_INPUT as i64], self.w1.as_slice()),
            ("b1", vec![MLP_HIDDEN as i64], self.b1.as_slice()),
            ("w2", vec![MLP_OUTPUT as i64, MLP_HIDDEN as i64], self.w2.as_slice()),
            ("b2", vec![MLP_OUTPUT as i64], self.b2.as_slice()),
        ]
    }

    /// Forward pass for a `[batch, MLP_INPUT]` row-major input.
    pub fn forward(&self, data: &[f32]) -> Vec<f32> {
        let batch = data.len() / MLP_INPUT;
        let hidden = dense(data, batch, MLP_INPUT, &self.w1, &self.b1, MLP_HIDDEN)
            .into_iter()
            .map(|v| v.max(0.0))
            .collect::<Vec<_>>();
        dense(&hidden, batch, MLP_HIDDEN, &self.w2, &self.b2, MLP_OUTPUT)
    }
}

fn dense(x: &[f32], rows: usize, k: usize, w: &[f32], b: &[f32], n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * n];
    for r in 0..rows {
        for h in 0..n {
            let dot: f32 = (0..k).map(|j| x[r * k + j] * w[h * k + j]).sum();
            out[r * n + h] = dot + b[h];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mlp_graph_declares_expected_variables() {
        let g = mlp_graph();
        let names: Vec<&str> = g
            .arg_nodes
            .iter()
            .map(|&i| g.nodes[i].name.as_str())
            .collect();
        assert_eq!(names, MLP_NAMES);
    }

    #[test]
    fn oracle_shapes() {
        let w = MlpWeights::deterministic();
        let out = w.forward(&[0.5; 2 * MLP_INPUT]);
        assert_eq!(out.len(), 2 * MLP_OUTPUT);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn oracle_relu_clamps_hidden_layer() {
        let w = MlpWeights {
            w1: vec![-1.0; MLP_HIDDEN * MLP_INPUT],
            b1: vec![0.0; MLP_HIDDEN],
            w2: vec![1.0; MLP_OUTPUT * MLP_HIDDEN],
            b2: vec![0.25; MLP_OUTPUT],
        };
        // Every hidden unit is negative before relu, so only the bias survives.
        assert_eq!(w.forward(&[1.0, 2.0, 3.0]), vec![0.25, 0.25]);
    }
}
