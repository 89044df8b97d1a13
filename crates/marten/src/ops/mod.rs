// Operator registry
//
// Every operator type is a record of plain function pointers:
//
//   build   - runs once per node at load time; validates attributes and
//             returns the node's configuration payload
//   forward - runs once per pass; takes the payload and the resolved inputs
//   convert - moves tensors held in the payload to another backend
//
// The registry is an open map from the ONNX op-type string to that record.
// The built-in set covers element-wise math, reductions, matrix products
// and shape manipulation; callers add their own with `register`.
//
//   let mut registry = OperatorRegistry::with_builtins();
//   registry.register("MyOp", OpDef::new(build_my_op, forward_my_op));

mod elementwise;
mod linalg;
mod misc;
mod reduce;
mod shape;

use std::any::Any;
use std::collections::HashMap;

use marten_core::{Error, Result};

use crate::onnx::{Attribute, NodeProto, TensorProto};
use crate::tensor::{AnyTensor, Device};

/// Highest opset any built-in operator is known to handle.
pub const MAX_OPSET: i64 = 21;

// NodeContext: what `build` sees

/// A node as seen by its operator's `build` function.
pub struct NodeContext<'a> {
    node: &'a NodeProto,
    opset: i64,
    constants: &'a HashMap<String, AnyTensor>,
}

impl<'a> NodeContext<'a> {
    pub fn new(
        node: &'a NodeProto,
        opset: i64,
        constants: &'a HashMap<String, AnyTensor>,
    ) -> Self {
        NodeContext {
            node,
            opset,
            constants,
        }
    }

    pub fn op_type(&self) -> &str {
        &self.node.op_type
    }

    pub fn opset(&self) -> i64 {
        self.opset
    }

    pub fn inputs(&self) -> &[String] {
        &self.node.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.node.outputs
    }

    /// Whether input `i` is present (not past the end and not the empty name).
    pub fn has_input(&self, i: usize) -> bool {
        self.node.inputs.get(i).is_some_and(|n| !n.is_empty())
    }

    /// The constant feeding input `i`, when it is one.
    pub fn constant(&self, i: usize) -> Option<&AnyTensor> {
        self.node.inputs.get(i).and_then(|n| self.constants.get(n))
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.node.attr(name)
    }

    fn wrong_type(name: &str, want: &str, got: &Attribute) -> Error {
        Error::attribute(name, format!("expected {want}, got {}", got.kind()))
    }

    pub fn attr_i(&self, name: &str, default: i64) -> Result<i64> {
        match self.attr(name) {
            None => Ok(default),
            Some(Attribute::Int(v)) => Ok(*v),
            Some(other) => Err(Self::wrong_type(name, "int", other)),
        }
    }

    pub fn attr_f(&self, name: &str, default: f32) -> Result<f32> {
        match self.attr(name) {
            None => Ok(default),
            Some(Attribute::Float(v)) => Ok(*v),
            Some(other) => Err(Self::wrong_type(name, "float", other)),
        }
    }

    pub fn attr_s(&self, name: &str, default: &str) -> Result<String> {
        match self.attr(name) {
            None => Ok(default.to_string()),
            Some(Attribute::String(v)) => Ok(v.clone()),
            Some(other) => Err(Self::wrong_type(name, "string", other)),
        }
    }

    pub fn attr_ints(&self, name: &str) -> Result<Option<Vec<i64>>> {
        match self.attr(name) {
            None => Ok(None),
            Some(Attribute::Ints(v)) => Ok(Some(v.clone())),
            Some(other) => Err(Self::wrong_type(name, "ints", other)),
        }
    }

    pub fn attr_floats(&self, name: &str) -> Result<Option<Vec<f32>>> {
        match self.attr(name) {
            None => Ok(None),
            Some(Attribute::Floats(v)) => Ok(Some(v.clone())),
            Some(other) => Err(Self::wrong_type(name, "floats", other)),
        }
    }

    pub fn attr_tensor(&self, name: &str) -> Result<Option<&TensorProto>> {
        match self.attr(name) {
            None => Ok(None),
            Some(Attribute::Tensor(t)) => Ok(Some(t)),
            Some(other) => Err(Self::wrong_type(name, "tensor", other)),
        }
    }

    /// A required attribute is missing.
    pub fn missing(&self, name: &str) -> Error {
        Error::attribute(name, format!("required by {}", self.node.op_type))
    }
}

// OpConfig: the per-node payload

/// Operator-specific configuration built once per node.
pub struct OpConfig(Box<dyn Any + Send + Sync>);

impl OpConfig {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        OpConfig(Box::new(value))
    }

    /// For operators with nothing to configure.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn get<T: Any>(&self) -> Result<&T> {
        self.0
            .downcast_ref()
            .ok_or_else(|| Error::msg("operator configuration has an unexpected type"))
    }

    pub fn get_mut<T: Any>(&mut self) -> Result<&mut T> {
        self.0
            .downcast_mut()
            .ok_or_else(|| Error::msg("operator configuration has an unexpected type"))
    }

    /// Take the payload back, if it is a `T`.
    pub fn into_inner<T: Any>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|b| *b)
    }
}

impl std::fmt::Debug for OpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OpConfig")
    }
}

// Inputs: what `forward` sees

/// Resolved inputs of one node, position for position. Absent optional
/// inputs are `None`.
pub struct Inputs<'a> {
    values: Vec<Option<&'a AnyTensor>>,
}

impl<'a> Inputs<'a> {
    pub fn new(values: Vec<Option<&'a AnyTensor>>) -> Self {
        Inputs { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Input `i`, which must be present.
    pub fn get(&self, i: usize) -> Result<&'a AnyTensor> {
        self.opt(i).ok_or(Error::MissingInput { index: i })
    }

    /// Input `i` if present.
    pub fn opt(&self, i: usize) -> Option<&'a AnyTensor> {
        self.values.get(i).copied().flatten()
    }

    /// Every present input, in order.
    pub fn present(&self) -> impl Iterator<Item = &'a AnyTensor> + '_ {
        self.values.iter().filter_map(|v| *v)
    }

    /// Input `i` read as integers (shapes, axes, indices).
    pub fn ints(&self, i: usize) -> Result<Vec<i64>> {
        self.get(i)?.to_i64_vec()
    }

    /// Optional input `i` read as integers.
    pub fn opt_ints(&self, i: usize) -> Result<Option<Vec<i64>>> {
        self.opt(i).map(|t| t.to_i64_vec()).transpose()
    }

    /// Optional scalar input `i`.
    pub fn opt_scalar(&self, i: usize) -> Result<Option<f32>> {
        self.opt(i).map(|t| t.to_scalar()).transpose()
    }
}

// OpDef and the registry

pub type BuildFn = fn(&NodeContext<'_>) -> Result<OpConfig>;
pub type ForwardFn = fn(&OpConfig, &Inputs<'_>) -> Result<Vec<AnyTensor>>;
pub type ConvertFn = fn(&mut OpConfig, &Device) -> Result<()>;

/// One operator type.
#[derive(Clone, Copy)]
pub struct OpDef {
    pub build: BuildFn,
    pub forward: ForwardFn,
    pub convert: Option<ConvertFn>,
    /// Inclusive opset range this definition handles.
    pub min_opset: i64,
    pub max_opset: i64,
}

impl OpDef {
    pub fn new(build: BuildFn, forward: ForwardFn) -> Self {
        OpDef {
            build,
            forward,
            convert: None,
            min_opset: 1,
            max_opset: MAX_OPSET,
        }
    }

    pub fn with_convert(mut self, convert: ConvertFn) -> Self {
        self.convert = Some(convert);
        self
    }

    pub fn with_opsets(mut self, min: i64, max: i64) -> Self {
        self.min_opset = min;
        self.max_opset = max;
        self
    }

    pub fn supports(&self, opset: i64) -> bool {
        (self.min_opset..=self.max_opset).contains(&opset)
    }
}

impl std::fmt::Debug for OpDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpDef(opsets {}..={})", self.min_opset, self.max_opset)
    }
}

/// Maps op-type strings to operator definitions.
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    ops: HashMap<String, OpDef>,
}

impl OperatorRegistry {
    /// A registry with no operators.
    pub fn empty() -> Self {
        OperatorRegistry {
            ops: HashMap::new(),
        }
    }

    /// A registry with every built-in operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        elementwise::register(&mut registry);
        reduce::register(&mut registry);
        linalg::register(&mut registry);
        shape::register(&mut registry);
        misc::register(&mut registry);
        registry
    }

    /// Add or replace an operator.
    pub fn register(&mut self, op_type: &str, def: OpDef) {
        self.ops.insert(op_type.to_string(), def);
    }

    pub fn get(&self, op_type: &str) -> Option<&OpDef> {
        self.ops.get(op_type)
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.ops.contains_key(op_type)
    }

    /// Registered op types, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// `build` for operators without configuration.
pub(crate) fn no_config(_: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::empty())
}

/// Axes given as an attribute (old opsets) or as input `index` (new ones).
#[derive(Debug, Clone)]
pub(crate) enum AxesSource {
    Attr(Option<Vec<i64>>),
    Input(usize),
}

impl AxesSource {
    pub(crate) fn from_context(
        ctx: &NodeContext<'_>,
        name: &str,
        input_since: i64,
        index: usize,
    ) -> Result<Self> {
        if ctx.opset() >= input_since {
            Ok(AxesSource::Input(index))
        } else {
            Ok(AxesSource::Attr(ctx.attr_ints(name)?))
        }
    }

    pub(crate) fn resolve(&self, inputs: &Inputs<'_>) -> Result<Option<Vec<i64>>> {
        match self {
            AxesSource::Attr(axes) => Ok(axes.clone()),
            AxesSource::Input(i) => inputs.opt_ints(*i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_cover_the_catalogue() {
        let registry = OperatorRegistry::with_builtins();
        for op in [
            "Add", "Sub", "Mul", "Div", "Pow", "Sum", "Mean", "Exp", "Relu", "Round",
            "LeakyRelu", "Elu", "HardSigmoid", "Softplus", "Softsign", "Clip", "Softmax",
            "ReduceSum", "ReduceLogSumExp", "MatMul", "Gemm", "Reshape", "Flatten",
            "Transpose", "Concat", "Slice", "Tile", "Expand", "Pad", "Gather", "Unsqueeze",
            "Squeeze", "Shape", "Size", "Identity", "Dropout", "Cast", "Constant",
            "ConstantOfShape", "Range", "PRelu", "Selu", "Celu",
        ] {
            assert!(registry.contains(op), "{op} missing");
        }
        assert!(!registry.contains("Conv"));
    }

    #[test]
    fn test_attribute_type_errors() {
        let node = NodeProto::new("X", &[], &[]).with_attr("axis", Attribute::Float(1.0));
        let constants = HashMap::new();
        let ctx = NodeContext::new(&node, 13, &constants);
        assert_eq!(ctx.attr_i("missing", 7).unwrap(), 7);
        let err = ctx.attr_i("axis", 0).unwrap_err();
        assert!(matches!(err, Error::Attribute { .. }));
    }

    #[test]
    fn test_absent_inputs() {
        let a = AnyTensor::from_slice(&[1.0], 1).unwrap();
        let inputs = Inputs::new(vec![Some(&a), None]);
        assert!(inputs.opt(1).is_none());
        assert!(matches!(
            inputs.get(1).unwrap_err(),
            Error::MissingInput { index: 1 }
        ));
        assert!(inputs.get(5).is_err());
        assert_eq!(inputs.present().count(), 1);
    }
}
