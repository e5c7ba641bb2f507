//! Symbol graphs: MXNet JSON parsing, naming rules and host evaluation.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;

use libc::{c_char, c_int};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::ndarray::NdArrayData;
use super::ops::{Attrs, OpDef, Value, lookup};
use super::{
    EngineError, EngineResult, NATIVE_ENGINE_VERSION, api_call, box_handle, c_str, free_handle,
    out_ptr, ref_handle, return_strings, with_returns,
};
use crate::{
    NN_LIST_INPUTS_ALL, NN_LIST_INPUTS_AUX, NN_LIST_INPUTS_READ_ONLY, SymbolHandle, mx_uint,
};

// ── JSON document ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct GraphJson {
    nodes: Vec<NodeJson>,
    #[serde(default)]
    arg_nodes: Vec<usize>,
    #[serde(default, skip_deserializing)]
    node_row_ptr: Vec<usize>,
    heads: Vec<Vec<usize>>,
    #[serde(default, skip_deserializing)]
    attrs: BTreeMap<String, (String, c_int)>,
}

#[derive(Debug, Deserialize, Serialize)]
struct NodeJson {
    op: String,
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: Attrs,
    // Graphs written by MXNet < 1.0 keep attributes under these keys.
    #[serde(default, skip_serializing)]
    attr: Attrs,
    #[serde(default, skip_serializing)]
    param: Attrs,
    #[serde(default)]
    inputs: Vec<Vec<usize>>,
}

// ── In-memory graph ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeEntry {
    pub node: usize,
    pub index: usize,
}

impl NodeEntry {
    fn parse(raw: &[usize]) -> EngineResult<Self> {
        match raw {
            [node, index] | [node, index, _] => Ok(Self {
                node: *node,
                index: *index,
            }),
            _ => Err(EngineError::InvalidArgument(format!(
                "node entry must have 2 or 3 elements, got {raw:?}"
            ))),
        }
    }
}

pub(crate) struct Node {
    /// `None` for variables.
    op: Option<&'static OpDef>,
    name: String,
    attrs: Attrs,
    inputs: SmallVec<[NodeEntry; 3]>,
}

impl Node {
    fn num_outputs(&self) -> usize {
        self.op.map_or(1, |op| op.num_outputs)
    }

    fn is_variable(&self) -> bool {
        self.op.is_none()
    }
}

pub(crate) struct Graph {
    nodes: Vec<Node>,
    heads: Vec<NodeEntry>,
}

impl Graph {
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let doc: GraphJson = serde_json::from_str(text)?;
        let mut nodes: Vec<Node> = Vec::with_capacity(doc.nodes.len());

        for (id, raw) in doc.nodes.into_iter().enumerate() {
            let op = match raw.op.as_str() {
                "null" => None,
                name => Some(lookup(name)?),
            };
            let mut attrs = raw.param;
            attrs.extend(raw.attr);
            attrs.extend(raw.attrs);

            let mut inputs = SmallVec::new();
            for entry in &raw.inputs {
                let entry = NodeEntry::parse(entry)?;
                let Some(source) = nodes.get(entry.node) else {
                    return Err(EngineError::InvalidArgument(format!(
                        "node {id} ({}) reads node {} which is not defined before it",
                        raw.name, entry.node
                    )));
                };
                if entry.index >= source.num_outputs() {
                    return Err(EngineError::InvalidArgument(format!(
                        "node {id} ({}) reads output {} of {}, which has {}",
                        raw.name,
                        entry.index,
                        source.name,
                        source.num_outputs()
                    )));
                }
                inputs.push(entry);
            }

            let expected = match op {
                Some(op) => op.arity(&attrs)?,
                None => 0,
            };
            if inputs.len() != expected {
                return Err(EngineError::InvalidArgument(format!(
                    "node {id} ({}) has {} inputs, expected {expected}",
                    raw.name,
                    inputs.len()
                )));
            }

            nodes.push(Node {
                op,
                name: raw.name,
                attrs,
                inputs,
            });
        }

        let heads = doc
            .heads
            .iter()
            .map(|raw| {
                let entry = NodeEntry::parse(raw)?;
                match nodes.get(entry.node) {
                    Some(node) if entry.index < node.num_outputs() => Ok(entry),
                    _ => Err(EngineError::InvalidArgument(format!(
                        "head {raw:?} does not name a node output"
                    ))),
                }
            })
            .collect::<EngineResult<Vec<_>>>()?;
        if heads.is_empty() {
            return Err(EngineError::InvalidArgument("symbol has no heads".into()));
        }

        Ok(Self { nodes, heads })
    }

    /// Nodes reachable from `roots`, each after all of its inputs.
    fn post_order(&self, roots: &[NodeEntry]) -> Vec<usize> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in roots {
            if visited[root.node] {
                continue;
            }
            visited[root.node] = true;
            stack.push((root.node, 0));
            while let Some((id, next)) = stack.pop() {
                match self.nodes[id].inputs.get(next) {
                    Some(input) => {
                        stack.push((id, next + 1));
                        if !visited[input.node] {
                            visited[input.node] = true;
                            stack.push((input.node, 0));
                        }
                    }
                    None => order.push(id),
                }
            }
        }
        order
    }

    fn entry_name(&self, entry: NodeEntry) -> String {
        let node = &self.nodes[entry.node];
        match (node.is_variable(), node.num_outputs()) {
            (true, _) => node.name.clone(),
            (false, 1) => format!("{}_output", node.name),
            (false, _) => format!("{}_output{}", node.name, entry.index),
        }
    }
}

// ── Symbol ──────────────────────────────────────────────────────────────

/// A view onto a shared graph: the set of entries it outputs.
#[derive(Clone)]
pub(crate) struct SymbolData {
    graph: Arc<Graph>,
    outputs: Vec<NodeEntry>,
}

impl SymbolData {
    pub fn new(graph: Graph) -> Self {
        let outputs = graph.heads.clone();
        Self {
            graph: Arc::new(graph),
            outputs,
        }
    }

    fn order(&self) -> Vec<usize> {
        self.graph.post_order(&self.outputs)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.order()
            .into_iter()
            .filter(|&id| self.graph.nodes[id].is_variable())
            .map(|id| self.graph.nodes[id].name.clone())
            .collect()
    }

    pub fn num_inputs(&self) -> usize {
        self.order()
            .into_iter()
            .filter(|&id| self.graph.nodes[id].is_variable())
            .count()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs
            .iter()
            .map(|&e| self.graph.entry_name(e))
            .collect()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Every output of every reachable node, in evaluation order.
    pub fn internals(&self) -> Self {
        let outputs = self
            .order()
            .into_iter()
            .flat_map(|id| {
                (0..self.graph.nodes[id].num_outputs()).map(move |index| NodeEntry { node: id, index })
            })
            .collect();
        Self {
            graph: Arc::clone(&self.graph),
            outputs,
        }
    }

    pub fn output(&self, index: usize) -> EngineResult<Self> {
        let entry = self.outputs.get(index).copied().ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "output index {index} out of range for symbol with {} outputs",
                self.outputs.len()
            ))
        })?;
        Ok(Self {
            graph: Arc::clone(&self.graph),
            outputs: vec![entry],
        })
    }

    /// Serialize the reachable subgraph, renumbering nodes densely.
    pub fn to_json(&self) -> EngineResult<String> {
        let order = self.order();
        let mut remap = vec![usize::MAX; self.graph.nodes.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }
        let entry = |e: &NodeEntry| vec![remap[e.node], e.index, 0];

        let mut doc = GraphJson {
            nodes: Vec::with_capacity(order.len()),
            arg_nodes: Vec::new(),
            node_row_ptr: vec![0],
            heads: self.outputs.iter().map(entry).collect(),
            attrs: BTreeMap::from([(
                "mxnet_version".to_string(),
                ("int".to_string(), NATIVE_ENGINE_VERSION),
            )]),
        };
        let mut rows = 0;
        for (new, &old) in order.iter().enumerate() {
            let node = &self.graph.nodes[old];
            if node.is_variable() {
                doc.arg_nodes.push(new);
            }
            rows += node.num_outputs();
            doc.node_row_ptr.push(rows);
            doc.nodes.push(NodeJson {
                op: node.op.map_or("null", |op| op.name).to_string(),
                name: node.name.clone(),
                attrs: node.attrs.clone(),
                attr: Attrs::new(),
                param: Attrs::new(),
                inputs: node.inputs.iter().map(entry).collect(),
            });
        }
        Ok(serde_json::to_string(&doc)?)
    }

    /// Evaluate the outputs given one array per input, in `input_names` order.
    pub fn evaluate(&self, inputs: &[&NdArrayData]) -> EngineResult<Vec<Value>> {
        let order = self.order();
        let mut values: Vec<Option<Vec<Value>>> = vec![None; self.graph.nodes.len()];
        let mut feed = inputs.iter();

        for id in order {
            let node = &self.graph.nodes[id];
            let outputs = match node.op {
                None => {
                    let array = feed.next().ok_or_else(|| {
                        EngineError::InvalidArgument(format!("no array bound to input {}", node.name))
                    })?;
                    vec![array.to_value()]
                }
                Some(op) => {
                    let args = node
                        .inputs
                        .iter()
                        .map(|e| {
                            values[e.node].as_ref().map(|v| &v[e.index]).ok_or_else(|| {
                                EngineError::InvalidArgument(format!(
                                    "node {} evaluated before its inputs",
                                    node.name
                                ))
                            })
                        })
                        .collect::<EngineResult<SmallVec<[&Value; 3]>>>()?;
                    let outputs = op.compute(&node.attrs, &args)?;
                    if outputs.len() != op.num_outputs {
                        return Err(EngineError::Operator {
                            op: op.name.to_string(),
                            message: format!(
                                "produced {} outputs, declared {}",
                                outputs.len(),
                                op.num_outputs
                            ),
                        });
                    }
                    outputs
                }
            };
            values[id] = Some(outputs);
        }
        if feed.next().is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "too many input arrays for {} graph inputs",
                inputs.len() - feed.len() - 1
            )));
        }

        self.outputs
            .iter()
            .map(|e| {
                values[e.node]
                    .as_ref()
                    .map(|v| v[e.index].clone())
                    .ok_or_else(|| EngineError::InvalidArgument("head was not evaluated".into()))
            })
            .collect()
    }
}

// ── Symbol ABI ──────────────────────────────────────────────────────────

unsafe fn symbol<'a>(handle: SymbolHandle) -> EngineResult<&'a SymbolData> {
    unsafe { ref_handle(handle, "symbol") }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolCreateFromJSON(json: *const c_char, out: *mut SymbolHandle) -> c_int {
    api_call(|| {
        let json = unsafe { c_str(json, "json") }?;
        let out = unsafe { out_ptr(out, "out") }?;
        *out = box_handle(SymbolData::new(Graph::from_json(json)?));
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolCreateFromFile(fname: *const c_char, out: *mut SymbolHandle) -> c_int {
    api_call(|| {
        let path = unsafe { c_str(fname, "fname") }?;
        let out = unsafe { out_ptr(out, "out") }?;
        let json = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_string(),
            source,
        })?;
        *out = box_handle(SymbolData::new(Graph::from_json(&json)?));
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolSaveToJSON(symbol_handle: SymbolHandle, out_json: *mut *const c_char) -> c_int {
    api_call(|| {
        let sym = unsafe { symbol(symbol_handle) }?;
        let out = unsafe { out_ptr(out_json, "out_json") }?;
        let json = CString::new(sym.to_json()?)
            .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        with_returns(|r| {
            r.json = json;
            *out = r.json.as_ptr();
        });
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolFree(symbol_handle: SymbolHandle) -> c_int {
    api_call(|| {
        unsafe { free_handle::<SymbolData, _>(symbol_handle) };
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolListOutputs(
    symbol_handle: SymbolHandle,
    out_size: *mut mx_uint,
    out_str_array: *mut *mut *const c_char,
) -> c_int {
    api_call(|| unsafe {
        let sym = symbol(symbol_handle)?;
        return_strings(sym.output_names(), out_size, out_str_array)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolGetNumOutputs(symbol_handle: SymbolHandle, output_count: *mut mx_uint) -> c_int {
    api_call(|| {
        let sym = unsafe { symbol(symbol_handle) }?;
        *unsafe { out_ptr(output_count, "output_count") }? = sym.num_outputs() as mx_uint;
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolGetOutput(
    symbol_handle: SymbolHandle,
    index: mx_uint,
    out: *mut SymbolHandle,
) -> c_int {
    api_call(|| {
        let sym = unsafe { symbol(symbol_handle) }?;
        let out = unsafe { out_ptr(out, "out") }?;
        *out = box_handle(sym.output(index as usize)?);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolGetInternals(symbol_handle: SymbolHandle, out: *mut SymbolHandle) -> c_int {
    api_call(|| {
        let sym = unsafe { symbol(symbol_handle) }?;
        let out = unsafe { out_ptr(out, "out") }?;
        *out = box_handle(sym.internals());
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolListArguments(
    symbol_handle: SymbolHandle,
    out_size: *mut mx_uint,
    out_str_array: *mut *mut *const c_char,
) -> c_int {
    api_call(|| unsafe {
        let sym = symbol(symbol_handle)?;
        return_strings(sym.input_names(), out_size, out_str_array)
    })
}

/// None of the supported operators carry auxiliary state.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolListAuxiliaryStates(
    symbol_handle: SymbolHandle,
    out_size: *mut mx_uint,
    out_str_array: *mut *mut *const c_char,
) -> c_int {
    api_call(|| unsafe {
        symbol(symbol_handle)?;
        return_strings(Vec::new(), out_size, out_str_array)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn NNSymbolListInputNames(
    symbol_handle: SymbolHandle,
    option: c_int,
    out_size: *mut mx_uint,
    out_str_array: *mut *mut *const c_char,
) -> c_int {
    api_call(|| unsafe {
        let sym = symbol(symbol_handle)?;
        let names = match option {
            NN_LIST_INPUTS_ALL | NN_LIST_INPUTS_READ_ONLY => sym.input_names(),
            NN_LIST_INPUTS_AUX => Vec::new(),
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unknown input listing option {other}"
                )));
            }
        };
        return_strings(names, out_size, out_str_array)
    })
}
