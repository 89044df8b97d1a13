// Reduce* operators

use marten_core::{Error, ReduceOp, Result};

use super::{AxesSource, Inputs, NodeContext, OpConfig, OpDef, OperatorRegistry};
use crate::tensor::AnyTensor;

const REDUCERS: &[(&str, ReduceOp)] = &[
    ("ReduceSum", ReduceOp::Sum),
    ("ReduceProd", ReduceOp::Product),
    ("ReduceMin", ReduceOp::Min),
    ("ReduceMax", ReduceOp::Max),
    ("ReduceMean", ReduceOp::Mean),
    ("ReduceSumSquare", ReduceOp::SumSquare),
    ("ReduceLogSum", ReduceOp::LogSum),
    ("ReduceLogSumExp", ReduceOp::LogSumExp),
];

pub(super) fn register(registry: &mut OperatorRegistry) {
    for (name, _) in REDUCERS {
        registry.register(name, OpDef::new(build_reduce, forward_reduce));
    }
}

#[derive(Debug, Clone)]
struct Reduce {
    op: ReduceOp,
    keep_dims: bool,
    axes: AxesSource,
    /// With no axes: pass the input through instead of reducing everything.
    noop_with_empty_axes: bool,
}

fn build_reduce(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let op = REDUCERS
        .iter()
        .find(|(name, _)| *name == ctx.op_type())
        .map(|(_, op)| *op)
        .ok_or_else(|| Error::UnknownOperator {
            op_type: ctx.op_type().to_string(),
        })?;
    // ReduceSum took its axes as an input from opset 13, the rest from 18
    let input_since = if op == ReduceOp::Sum { 13 } else { 18 };
    Ok(OpConfig::new(Reduce {
        op,
        keep_dims: ctx.attr_i("keepdims", 1)? != 0,
        axes: AxesSource::from_context(ctx, "axes", input_since, 1)?,
        noop_with_empty_axes: ctx.attr_i("noop_with_empty_axes", 0)? != 0,
    }))
}

fn forward_reduce(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let p = config.get::<Reduce>()?;
    let x = inputs.get(0)?;
    let out = match p.axes.resolve(inputs)? {
        Some(axes) if !axes.is_empty() => x.reduce(p.op, Some(&axes), p.keep_dims)?,
        _ if p.noop_with_empty_axes => x.clone(),
        _ => x.reduce(p.op, None, p.keep_dims)?,
    };
    Ok(vec![out])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::{Attribute, NodeProto};
    use std::collections::HashMap;

    fn reduce(op: &str, opset: i64, node: NodeProto, inputs: &[Option<&AnyTensor>]) -> AnyTensor {
        let def = *OperatorRegistry::with_builtins().get(op).unwrap();
        let constants = HashMap::new();
        let config = (def.build)(&NodeContext::new(&node, opset, &constants)).unwrap();
        (def.forward)(&config, &Inputs::new(inputs.to_vec()))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_axes_attribute_before_opset_18() {
        let x = AnyTensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
        let node = NodeProto::new("ReduceMax", &["x"], &["y"])
            .with_attr("axes", Attribute::Ints(vec![-1]))
            .with_attr("keepdims", Attribute::Int(0));
        let y = reduce("ReduceMax", 13, node, &[Some(&x)]);
        assert_eq!(y.dims(), &[2]);
        assert_eq!(y.to_vec().unwrap(), vec![3.0, 6.0]);
    }

    #[test]
    fn test_sum_axes_input_from_opset_13() {
        let x = AnyTensor::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        let axes = AnyTensor::from_i64(&[0], 1).unwrap();
        let node = NodeProto::new("ReduceSum", &["x", "axes"], &["y"]);
        let y = reduce("ReduceSum", 13, node, &[Some(&x), Some(&axes)]);
        assert_eq!(y.dims(), &[1, 2]);
        assert_eq!(y.to_vec().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_empty_axes() {
        let x = AnyTensor::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        let node = NodeProto::new("ReduceMean", &["x"], &["y"]);
        let y = reduce("ReduceMean", 18, node, &[Some(&x), None]);
        assert_eq!(y.dims(), &[1, 1]);
        assert_eq!(y.to_vec().unwrap(), vec![2.5]);

        let node = NodeProto::new("ReduceMean", &["x"], &["y"])
            .with_attr("noop_with_empty_axes", Attribute::Int(1));
        let y = reduce("ReduceMean", 18, node, &[Some(&x), None]);
        assert!(y.same_storage(&x));
    }
}
