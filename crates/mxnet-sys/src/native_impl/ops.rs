//! Operator table of the reference engine.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::CString;

use libc::{c_char, c_int};

use super::{EngineError, EngineResult, api_call, c_str, out_ptr, ref_handle, return_strings, to_cstrings};
use crate::{MX_STORAGE_CSR, MX_STORAGE_DEFAULT, MX_STORAGE_ROW_SPARSE, OpHandle, mx_uint};

pub(crate) type Attrs = BTreeMap<String, String>;

/// A host tensor flowing through graph evaluation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Value {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub stype: c_int,
}

impl Value {
    pub fn dense(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data,
            stype: MX_STORAGE_DEFAULT,
        }
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self::dense(self.shape.clone(), self.data.iter().map(|&v| f(v)).collect())
    }
}

type Compute = fn(&OpDef, &Attrs, &[&Value]) -> EngineResult<Vec<Value>>;

pub(crate) struct OpDef {
    pub name: &'static str,
    pub description: &'static str,
    /// `(name, type info, description)` per argument.
    pub arguments: &'static [(&'static str, &'static str, &'static str)],
    pub num_outputs: usize,
    num_inputs: fn(&Attrs) -> EngineResult<usize>,
    compute: Compute,
}

impl OpDef {
    /// Number of graph inputs the operator consumes under `attrs`.
    pub fn arity(&self, attrs: &Attrs) -> EngineResult<usize> {
        (self.num_inputs)(attrs)
    }

    pub fn compute(&self, attrs: &Attrs, inputs: &[&Value]) -> EngineResult<Vec<Value>> {
        (self.compute)(self, attrs, inputs)
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Operator {
            op: self.name.to_string(),
            message: message.into(),
        }
    }
}

const DATA: (&str, &str, &str) = ("data", "NDArray-or-Symbol", "Input data.");
const LHS: (&str, &str, &str) = ("lhs", "NDArray-or-Symbol", "First input.");
const RHS: (&str, &str, &str) = ("rhs", "NDArray-or-Symbol", "Second input.");

static OPS: &[OpDef] = &[
    OpDef {
        name: "FullyConnected",
        description: "Applies a linear transformation: Y = XW^T + b.",
        arguments: &[
            DATA,
            ("weight", "NDArray-or-Symbol", "Weight matrix."),
            ("bias", "NDArray-or-Symbol", "Bias parameter."),
            ("num_hidden", "int, required", "Number of hidden nodes of the output."),
            ("no_bias", "boolean, optional, default=0", "Whether to disable bias parameter."),
            ("flatten", "boolean, optional, default=1", "Whether to collapse all but the first axis of the input data tensor."),
        ],
        num_outputs: 1,
        num_inputs: |attrs| Ok(if attr_bool(attrs, "no_bias")?.unwrap_or(false) { 2 } else { 3 }),
        compute: fully_connected,
    },
    OpDef {
        name: "Activation",
        description: "Applies an activation function element-wise to the input.",
        arguments: &[
            DATA,
            ("act_type", "{'relu', 'sigmoid', 'softrelu', 'softsign', 'tanh'}, required", "Activation function to be applied."),
        ],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: activation,
    },
    OpDef {
        name: "relu",
        description: "Computes rectified linear activation: max(x, 0).",
        arguments: &[DATA],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |_, _, x| Ok(vec![x[0].map(|v| v.max(0.0))]),
    },
    OpDef {
        name: "sigmoid",
        description: "Computes sigmoid of x element-wise.",
        arguments: &[DATA],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |_, _, x| Ok(vec![x[0].map(sigmoid)]),
    },
    OpDef {
        name: "tanh",
        description: "Returns the hyperbolic tangent of the input array, computed element-wise.",
        arguments: &[DATA],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |_, _, x| Ok(vec![x[0].map(f32::tanh)]),
    },
    OpDef {
        name: "elemwise_add",
        description: "Adds arguments element-wise.",
        arguments: &[LHS, RHS],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| binary(op, x, |a, b| a + b),
    },
    OpDef {
        name: "_plus",
        description: "Adds arguments element-wise.",
        arguments: &[LHS, RHS],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| binary(op, x, |a, b| a + b),
    },
    OpDef {
        name: "elemwise_sub",
        description: "Subtracts arguments element-wise.",
        arguments: &[LHS, RHS],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| binary(op, x, |a, b| a - b),
    },
    OpDef {
        name: "_minus",
        description: "Subtracts arguments element-wise.",
        arguments: &[LHS, RHS],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| binary(op, x, |a, b| a - b),
    },
    OpDef {
        name: "elemwise_mul",
        description: "Multiplies arguments element-wise.",
        arguments: &[LHS, RHS],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| binary(op, x, |a, b| a * b),
    },
    OpDef {
        name: "_mul",
        description: "Multiplies arguments element-wise.",
        arguments: &[LHS, RHS],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| binary(op, x, |a, b| a * b),
    },
    OpDef {
        name: "softmax",
        description: "Applies the softmax function along one axis.",
        arguments: &[
            DATA,
            ("axis", "int, optional, default='-1'", "The axis along which to compute softmax."),
        ],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |op, attrs, x| {
            let axis = attr_i64(attrs, "axis")?.unwrap_or(-1);
            Ok(vec![softmax_along(op, x[0], axis)?])
        },
    },
    OpDef {
        name: "SoftmaxOutput",
        description: "Computes the softmax of the input; the label is only used by the backward pass.",
        arguments: &[
            DATA,
            ("label", "NDArray-or-Symbol", "Ground truth label."),
        ],
        num_outputs: 1,
        num_inputs: |_| Ok(2),
        compute: |op, _, x| {
            let flat = flatten(op, x[0])?;
            let mut out = softmax_along(op, &flat, -1)?;
            out.shape = x[0].shape.clone();
            Ok(vec![out])
        },
    },
    OpDef {
        name: "Flatten",
        description: "Flattens the input array into a 2-D array by collapsing the higher dimensions.",
        arguments: &[DATA],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |op, _, x| Ok(vec![flatten(op, x[0])?]),
    },
    OpDef {
        name: "_copy",
        description: "Returns a copy of the input.",
        arguments: &[DATA],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |_, _, x| Ok(vec![Value::dense(x[0].shape.clone(), x[0].data.clone())]),
    },
    OpDef {
        name: "cast_storage",
        description: "Casts tensor storage type to the new type.",
        arguments: &[
            DATA,
            ("stype", "{'csr', 'default', 'row_sparse'}, required", "Output storage type."),
        ],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: cast_storage,
    },
    OpDef {
        name: "_contrib_quadratic",
        description: "Computes f(x) = ax^2+bx+c element-wise.",
        arguments: &[
            DATA,
            ("a", "float, optional, default=0", "Coefficient of the quadratic term."),
            ("b", "float, optional, default=0", "Coefficient of the linear term."),
            ("c", "float, optional, default=0", "Constant term."),
        ],
        num_outputs: 1,
        num_inputs: |_| Ok(1),
        compute: |_, attrs, x| {
            let a = attr_f32(attrs, "a")?.unwrap_or(0.0);
            let b = attr_f32(attrs, "b")?.unwrap_or(0.0);
            let c = attr_f32(attrs, "c")?.unwrap_or(0.0);
            Ok(vec![x[0].map(|v| a * v * v + b * v + c)])
        },
    },
];

pub(crate) fn lookup(name: &str) -> EngineResult<&'static OpDef> {
    OPS.iter()
        .find(|op| op.name == name)
        .ok_or_else(|| EngineError::UnknownOp(name.to_string()))
}

// ── Attribute parsing ───────────────────────────────────────────────────

fn attr_parse<T: std::str::FromStr>(attrs: &Attrs, key: &str) -> EngineResult<Option<T>> {
    attrs
        .get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                EngineError::InvalidArgument(format!("cannot parse attribute {key}={raw:?}"))
            })
        })
        .transpose()
}

fn attr_i64(attrs: &Attrs, key: &str) -> EngineResult<Option<i64>> {
    attr_parse(attrs, key)
}

fn attr_f32(attrs: &Attrs, key: &str) -> EngineResult<Option<f32>> {
    attr_parse(attrs, key)
}

fn attr_bool(attrs: &Attrs, key: &str) -> EngineResult<Option<bool>> {
    attrs
        .get(key)
        .map(|raw| match raw.trim() {
            "1" | "true" | "True" => Ok(true),
            "0" | "false" | "False" => Ok(false),
            _ => Err(EngineError::InvalidArgument(format!(
                "cannot parse attribute {key}={raw:?} as a boolean"
            ))),
        })
        .transpose()
}

// ── Kernels ─────────────────────────────────────────────────────────────

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn fully_connected(op: &OpDef, attrs: &Attrs, x: &[&Value]) -> EngineResult<Vec<Value>> {
    let num_hidden: usize =
        attr_parse(attrs, "num_hidden")?.ok_or_else(|| op.error("missing attribute num_hidden"))?;
    let flatten = attr_bool(attrs, "flatten")?.unwrap_or(true);
    let (data, weight, bias) = (x[0], x[1], x.get(2).copied());

    let Some(&last) = data.shape.last() else {
        return Err(op.error("data must have at least one dimension"));
    };
    let numel = data.data.len();
    let (k, out_shape) = if flatten {
        let batch = data.shape[0];
        let k = if batch == 0 { 0 } else { numel / batch };
        (k, vec![batch, num_hidden])
    } else {
        let mut shape = data.shape.clone();
        if let Some(d) = shape.last_mut() {
            *d = num_hidden;
        }
        (last, shape)
    };
    let rows = if k == 0 { 0 } else { numel / k };

    if weight.shape != [num_hidden, k] {
        return Err(EngineError::Shape(format!(
            "{}: weight must be {:?}, got {:?}",
            op.name,
            [num_hidden, k],
            weight.shape
        )));
    }
    if let Some(bias) = bias
        && bias.shape != [num_hidden]
    {
        return Err(EngineError::Shape(format!(
            "{}: bias must be [{num_hidden}], got {:?}",
            op.name, bias.shape
        )));
    }

    let mut out = vec![0.0f32; rows * num_hidden];
    for r in 0..rows {
        let row = &data.data[r * k..(r + 1) * k];
        for h in 0..num_hidden {
            let w = &weight.data[h * k..(h + 1) * k];
            let dot: f32 = row.iter().zip(w).map(|(a, b)| a * b).sum();
            out[r * num_hidden + h] = dot + bias.map_or(0.0, |b| b.data[h]);
        }
    }
    Ok(vec![Value::dense(out_shape, out)])
}

fn activation(op: &OpDef, attrs: &Attrs, x: &[&Value]) -> EngineResult<Vec<Value>> {
    let act = attrs
        .get("act_type")
        .ok_or_else(|| op.error("missing attribute act_type"))?;
    let f: fn(f32) -> f32 = match act.as_str() {
        "relu" => |v: f32| v.max(0.0),
        "sigmoid" => sigmoid,
        "tanh" => f32::tanh,
        "softrelu" => |v: f32| v.exp().ln_1p(),
        "softsign" => |v: f32| v / (1.0 + v.abs()),
        other => return Err(op.error(format!("unsupported act_type {other:?}"))),
    };
    Ok(vec![x[0].map(f)])
}

fn binary(op: &OpDef, x: &[&Value], f: impl Fn(f32, f32) -> f32) -> EngineResult<Vec<Value>> {
    let (a, b) = (x[0], x[1]);
    if a.shape != b.shape {
        return Err(EngineError::Shape(format!(
            "{}: operands {:?} and {:?} differ",
            op.name, a.shape, b.shape
        )));
    }
    let data = a.data.iter().zip(&b.data).map(|(&l, &r)| f(l, r)).collect();
    Ok(vec![Value::dense(a.shape.clone(), data)])
}

fn flatten(op: &OpDef, x: &Value) -> EngineResult<Value> {
    let Some(&batch) = x.shape.first() else {
        return Err(op.error("cannot flatten a scalar"));
    };
    let rest = x.shape[1..].iter().product();
    Ok(Value::dense(vec![batch, rest], x.data.clone()))
}

fn softmax_along(op: &OpDef, x: &Value, axis: i64) -> EngineResult<Value> {
    let ndim = x.shape.len() as i64;
    let axis = if axis < 0 { axis + ndim } else { axis };
    if axis < 0 || axis >= ndim {
        return Err(op.error(format!("axis {axis} out of range for {ndim}-d input")));
    }
    let axis = axis as usize;
    let n = x.shape[axis];
    let outer: usize = x.shape[..axis].iter().product();
    let inner: usize = x.shape[axis + 1..].iter().product();

    let mut out = x.data.clone();
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| (o * n + j) * inner + i;
            let max = (0..n).map(|j| x.data[at(j)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for j in 0..n {
                let e = (x.data[at(j)] - max).exp();
                out[at(j)] = e;
                sum += e;
            }
            for j in 0..n {
                out[at(j)] /= sum;
            }
        }
    }
    Ok(Value::dense(x.shape.clone(), out))
}

fn cast_storage(op: &OpDef, attrs: &Attrs, x: &[&Value]) -> EngineResult<Vec<Value>> {
    let stype = match attrs.get("stype").map(String::as_str) {
        Some("default") => MX_STORAGE_DEFAULT,
        Some("row_sparse") if !x[0].shape.is_empty() => MX_STORAGE_ROW_SPARSE,
        Some("csr") if x[0].shape.len() == 2 => MX_STORAGE_CSR,
        Some("row_sparse") | Some("csr") => {
            return Err(op.error(format!("storage type not supported for shape {:?}", x[0].shape)));
        }
        Some(other) => return Err(op.error(format!("unknown stype {other:?}"))),
        None => return Err(op.error("missing attribute stype")),
    };
    Ok(vec![Value {
        shape: x[0].shape.clone(),
        data: x[0].data.clone(),
        stype,
    }])
}

// ── Operator registry ABI ───────────────────────────────────────────────

#[derive(Default)]
struct OpInfoBuffers {
    name: CString,
    description: CString,
    arg_names: Vec<CString>,
    arg_types: Vec<CString>,
    arg_descs: Vec<CString>,
    arg_name_ptrs: Vec<*const c_char>,
    arg_type_ptrs: Vec<*const c_char>,
    arg_desc_ptrs: Vec<*const c_char>,
    empty: CString,
}

thread_local! {
    static OP_INFO: RefCell<OpInfoBuffers> = RefCell::new(OpInfoBuffers::default());
}

fn op_string(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|e| EngineError::InvalidArgument(e.to_string()))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXListAllOpNames(
    out_size: *mut mx_uint,
    out_array: *mut *mut *const c_char,
) -> c_int {
    api_call(|| unsafe {
        return_strings(
            OPS.iter().map(|op| op.name.to_string()).collect(),
            out_size,
            out_array,
        )
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn NNGetOpHandle(op_name: *const c_char, op_out: *mut OpHandle) -> c_int {
    api_call(|| {
        let name = unsafe { c_str(op_name, "op_name") }?;
        let out = unsafe { out_ptr(op_out, "op_out") }?;
        let def: &'static OpDef = lookup(name)?;
        *out = (def as *const OpDef).cast_mut().cast();
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXSymbolGetAtomicSymbolInfo(
    creator: OpHandle,
    name: *mut *const c_char,
    description: *mut *const c_char,
    num_args: *mut mx_uint,
    arg_names: *mut *mut *const c_char,
    arg_type_infos: *mut *mut *const c_char,
    arg_descriptions: *mut *mut *const c_char,
    key_var_num_args: *mut *const c_char,
    return_type: *mut *const c_char,
) -> c_int {
    api_call(|| {
        let def: &OpDef = unsafe { ref_handle(creator, "creator") }?;
        let name = unsafe { out_ptr(name, "name") }?;
        let description = unsafe { out_ptr(description, "description") }?;
        let num_args = unsafe { out_ptr(num_args, "num_args") }?;
        let arg_names = unsafe { out_ptr(arg_names, "arg_names") }?;
        let arg_types = unsafe { out_ptr(arg_type_infos, "arg_type_infos") }?;
        let arg_descs = unsafe { out_ptr(arg_descriptions, "arg_descriptions") }?;
        let key_var = unsafe { out_ptr(key_var_num_args, "key_var_num_args") }?;
        let return_type = unsafe { out_ptr(return_type, "return_type") }?;

        let names = to_cstrings(def.arguments.iter().map(|a| a.0.to_string()).collect())?;
        let types = to_cstrings(def.arguments.iter().map(|a| a.1.to_string()).collect())?;
        let descs = to_cstrings(def.arguments.iter().map(|a| a.2.to_string()).collect())?;
        let op_name = op_string(def.name)?;
        let op_desc = op_string(def.description)?;

        OP_INFO.with(|cell| {
            let info = &mut *cell.borrow_mut();
            info.name = op_name;
            info.description = op_desc;
            info.arg_names = names;
            info.arg_types = types;
            info.arg_descs = descs;
            info.arg_name_ptrs = info.arg_names.iter().map(|s| s.as_ptr()).collect();
            info.arg_type_ptrs = info.arg_types.iter().map(|s| s.as_ptr()).collect();
            info.arg_desc_ptrs = info.arg_descs.iter().map(|s| s.as_ptr()).collect();

            *name = info.name.as_ptr();
            *description = info.description.as_ptr();
            *num_args = def.arguments.len() as mx_uint;
            *arg_names = info.arg_name_ptrs.as_mut_ptr();
            *arg_types = info.arg_type_ptrs.as_mut_ptr();
            *arg_descs = info.arg_desc_ptrs.as_mut_ptr();
            *key_var = info.empty.as_ptr();
            *return_type = info.empty.as_ptr();
        });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn run(op: &str, pairs: &[(&str, &str)], inputs: &[&Value]) -> EngineResult<Vec<Value>> {
        lookup(op)?.compute(&attrs(pairs), inputs)
    }

    #[test]
    fn fully_connected_matches_hand_computation() {
        let x = Value::dense(vec![1, 2], vec![1.0, 2.0]);
        let w = Value::dense(vec![2, 2], vec![1.0, 0.0, 0.5, -1.0]);
        let b = Value::dense(vec![2], vec![0.5, 1.0]);
        let out = run("FullyConnected", &[("num_hidden", "2")], &[&x, &w, &b]).unwrap();
        assert_eq!(out[0].shape, vec![1, 2]);
        assert_eq!(out[0].data, vec![1.5, -0.5]);
    }

    #[test]
    fn fully_connected_no_bias_changes_arity() {
        let op = lookup("FullyConnected").unwrap();
        assert_eq!(op.arity(&attrs(&[("num_hidden", "2")])).unwrap(), 3);
        assert_eq!(
            op.arity(&attrs(&[("num_hidden", "2"), ("no_bias", "True")]))
                .unwrap(),
            2
        );
    }

    #[test]
    fn fully_connected_rejects_bad_weight() {
        let x = Value::dense(vec![1, 3], vec![1.0; 3]);
        let w = Value::dense(vec![2, 2], vec![1.0; 4]);
        let b = Value::dense(vec![2], vec![0.0; 2]);
        let err = run("FullyConnected", &[("num_hidden", "2")], &[&x, &w, &b]).unwrap_err();
        assert!(matches!(err, EngineError::Shape(_)));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = Value::dense(vec![2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
        let out = run("softmax", &[], &[&x]).unwrap();
        for row in out[0].data.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn cast_storage_tags_output() {
        let x = Value::dense(vec![2, 2], vec![0.0, 1.0, 0.0, 0.0]);
        let out = run("cast_storage", &[("stype", "csr")], &[&x]).unwrap();
        assert_eq!(out[0].stype, MX_STORAGE_CSR);
        assert_eq!(out[0].data, x.data);

        let v = Value::dense(vec![4], vec![0.0; 4]);
        assert!(run("cast_storage", &[("stype", "csr")], &[&v]).is_err());
    }

    #[test]
    fn quadratic_defaults_to_zero() {
        let x = Value::dense(vec![2], vec![1.0, 2.0]);
        let out = run("_contrib_quadratic", &[("a", "1"), ("c", "0.5")], &[&x]).unwrap();
        assert_eq!(out[0].data, vec![1.5, 4.5]);
    }

    #[test]
    fn unknown_activation_is_an_error() {
        let x = Value::dense(vec![1], vec![1.0]);
        assert!(run("Activation", &[("act_type", "gelu")], &[&x]).is_err());
    }

    #[test]
    fn unknown_op_lookup_fails() {
        assert!(matches!(
            lookup("Convolution"),
            Err(EngineError::UnknownOp(name)) if name == "Convolution"
        ));
    }
}
