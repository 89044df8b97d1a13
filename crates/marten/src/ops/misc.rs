// Identity, Dropout, Cast, Constant, ConstantOfShape, Range

use marten_core::{DType, Error, Result};

use super::{Inputs, NodeContext, OpConfig, OpDef, OperatorRegistry};
use crate::graph::tensor_from_proto;
use crate::onnx::onnx_to_dtype;
use crate::tensor::{AnyTensor, Device};

pub(super) fn register(registry: &mut OperatorRegistry) {
    registry.register("Identity", OpDef::new(super::no_config, forward_identity));
    registry.register("Dropout", OpDef::new(build_dropout, forward_dropout));
    registry.register(
        "Cast",
        OpDef::new(build_cast, forward_cast).with_opsets(6, super::MAX_OPSET),
    );
    registry.register(
        "Constant",
        OpDef::new(build_constant, forward_constant).with_convert(convert_constant),
    );
    registry.register(
        "ConstantOfShape",
        OpDef::new(build_constant_of_shape, forward_constant_of_shape).with_opsets(9, super::MAX_OPSET),
    );
    registry.register(
        "Range",
        OpDef::new(super::no_config, forward_range).with_opsets(11, super::MAX_OPSET),
    );
}

fn forward_identity(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![inputs.get(0)?.clone()])
}

// Dropout is inference-only: data passes through and the mask is all ones.

fn build_dropout(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(ctx.outputs().len() > 1))
}

fn forward_dropout(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let x = inputs.get(0)?;
    let mut out = vec![x.clone()];
    if *config.get::<bool>()? {
        out.push(x.new_like(vec![1.0; x.elem_count()], x.shape().clone(), DType::U8)?);
    }
    Ok(out)
}

fn build_cast(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let to = match ctx.attr("to") {
        None => return Err(ctx.missing("to")),
        Some(_) => ctx.attr_i("to", 0)?,
    };
    Ok(OpConfig::new(onnx_to_dtype(to as i32)?))
}

fn forward_cast(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![inputs.get(0)?.to_dtype(*config.get::<DType>()?)?])
}

// Constant: the value is materialized once at load time and handed out on
// every pass. Backend switches move it along with the model's initializers.

fn build_constant(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let value = if let Some(t) = ctx.attr_tensor("value")? {
        tensor_from_proto(t, DType::F32)?
    } else if ctx.attr("value_float").is_some() {
        AnyTensor::from_slice(&[ctx.attr_f("value_float", 0.0)?], ())?
    } else if let Some(v) = ctx.attr_floats("value_floats")? {
        let n = v.len();
        AnyTensor::from_slice(&v, n)?
    } else if ctx.attr("value_int").is_some() {
        AnyTensor::from_i64(&[ctx.attr_i("value_int", 0)?], ())?
    } else if let Some(v) = ctx.attr_ints("value_ints")? {
        AnyTensor::from_i64(&v, v.len())?
    } else {
        return Err(Error::attribute(
            "value",
            "Constant needs one of value, value_float(s), value_int(s)",
        ));
    };
    Ok(OpConfig::new(value))
}

fn forward_constant(config: &OpConfig, _: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![config.get::<AnyTensor>()?.clone()])
}

fn convert_constant(config: &mut OpConfig, device: &Device) -> Result<()> {
    let value = config.get_mut::<AnyTensor>()?;
    *value = value.to_backend(device)?;
    Ok(())
}

// ConstantOfShape: a one-element `value` tensor (default f32 zero) broadcast
// to the shape read from input 0.

#[derive(Debug, Clone, Copy)]
struct Fill {
    value: f32,
    dtype: DType,
}

fn build_constant_of_shape(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let Some(t) = ctx.attr_tensor("value")? else {
        return Ok(OpConfig::new(Fill {
            value: 0.0,
            dtype: DType::F32,
        }));
    };
    let values = t.to_f32_vec()?;
    if values.len() != 1 {
        return Err(Error::attribute(
            "value",
            format!("expected one element, got {}", values.len()),
        ));
    }
    Ok(OpConfig::new(Fill {
        value: values[0],
        dtype: onnx_to_dtype(t.data_type)?,
    }))
}

fn forward_constant_of_shape(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let fill = *config.get::<Fill>()?;
    let dims = inputs
        .ints(0)?
        .into_iter()
        .map(|d| {
            usize::try_from(d)
                .map_err(|_| Error::attribute("shape", format!("negative dimension {d}")))
        })
        .collect::<Result<Vec<usize>>>()?;
    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::attribute("shape", format!("{dims:?} has too many elements")))?;
    let out = inputs.get(0)?.new_like(vec![fill.value; count], dims, fill.dtype)?;
    Ok(vec![out])
}

/// `start, start + delta, ...` up to but excluding `limit`, in the dtype of
/// `start`.
fn forward_range(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let start = inputs.get(0)?;
    let from = start.to_scalar()?;
    let limit = inputs.get(1)?.to_scalar()?;
    let delta = inputs.get(2)?.to_scalar()?;
    if delta == 0.0 {
        return Err(Error::msg("Range delta must be non-zero"));
    }
    let count = ((limit - from) / delta).ceil().max(0.0) as usize;
    let values: Vec<f32> = (0..count).map(|i| from + i as f32 * delta).collect();
    Ok(vec![start.new_like(values, count, start.dtype())?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::{Attribute, NodeProto, TensorProto, INT64};
    use marten_core::BackendKind;
    use std::collections::HashMap;

    fn build(node: &NodeProto) -> Result<OpConfig> {
        let def = *OperatorRegistry::with_builtins().get(&node.op_type).unwrap();
        let constants = HashMap::new();
        (def.build)(&NodeContext::new(node, 13, &constants))
    }

    #[test]
    fn test_dropout_mask_only_when_requested() {
        let x = AnyTensor::from_slice(&[1.0, 2.0], 2).unwrap();
        let one = build(&NodeProto::new("Dropout", &["x"], &["y"])).unwrap();
        assert_eq!(forward_dropout(&one, &Inputs::new(vec![Some(&x)])).unwrap().len(), 1);

        let two = build(&NodeProto::new("Dropout", &["x"], &["y", "mask"])).unwrap();
        let out = forward_dropout(&two, &Inputs::new(vec![Some(&x)])).unwrap();
        assert_eq!(out[1].dtype(), DType::U8);
        assert_eq!(out[1].to_vec().unwrap(), vec![1.0, 1.0]);
        assert!(out[0].same_storage(&x));
    }

    #[test]
    fn test_cast_truncates_to_integer() {
        let x = AnyTensor::from_slice(&[1.6, -2.4], 2).unwrap();
        let node = NodeProto::new("Cast", &["x"], &["y"]).with_attr("to", Attribute::Int(INT64 as i64));
        let y = forward_cast(&build(&node).unwrap(), &Inputs::new(vec![Some(&x)])).unwrap();
        assert_eq!(y[0].dtype(), DType::I64);
        assert_eq!(y[0].to_i64_vec().unwrap(), vec![1, -2]);
    }

    #[test]
    fn test_constant_forms() {
        let node = NodeProto::constant("c", TensorProto::from_f32("", &[2], &[1.5, 2.5]));
        let c = forward_constant(&build(&node).unwrap(), &Inputs::new(vec![])).unwrap();
        assert_eq!(c[0].to_vec().unwrap(), vec![1.5, 2.5]);

        let node = NodeProto::new("Constant", &[], &["c"])
            .with_attr("value_ints", Attribute::Ints(vec![3, -1]));
        let c = forward_constant(&build(&node).unwrap(), &Inputs::new(vec![])).unwrap();
        assert_eq!(c[0].dtype(), DType::I64);
        assert_eq!(c[0].to_i64_vec().unwrap(), vec![3, -1]);

        let node = NodeProto::new("Constant", &[], &["c"]);
        assert!(matches!(build(&node).unwrap_err(), Error::Attribute { .. }));
    }

    #[test]
    fn test_constant_of_shape_value_and_default() {
        let shape = AnyTensor::from_i64(&[2, 3], 2).unwrap();
        let node = NodeProto::new("ConstantOfShape", &["s"], &["y"]);
        let y = forward_constant_of_shape(&build(&node).unwrap(), &Inputs::new(vec![Some(&shape)])).unwrap();
        assert_eq!(y[0].dims(), &[2, 3]);
        assert_eq!(y[0].dtype(), DType::F32);
        assert_eq!(y[0].to_vec().unwrap(), vec![0.0; 6]);

        let node = NodeProto::new("ConstantOfShape", &["s"], &["y"])
            .with_attr("value", Attribute::Tensor(TensorProto::from_i64("", &[1], &[7])));
        let y = forward_constant_of_shape(&build(&node).unwrap(), &Inputs::new(vec![Some(&shape)])).unwrap();
        assert_eq!(y[0].dtype(), DType::I64);
        assert_eq!(y[0].to_i64_vec().unwrap(), vec![7; 6]);
    }

    #[test]
    fn test_range_counts_and_dtype() {
        let run = |start: AnyTensor, limit: f32, delta: f32| {
            let limit = AnyTensor::from_slice(&[limit], ()).unwrap();
            let delta = AnyTensor::from_slice(&[delta], ()).unwrap();
            forward_range(&OpConfig::empty(), &Inputs::new(vec![Some(&start), Some(&limit), Some(&delta)]))
        };
        let y = run(AnyTensor::from_slice(&[1.0], ()).unwrap(), 2.0, 0.25).unwrap();
        assert_eq!(y[0].to_vec().unwrap(), vec![1.0, 1.25, 1.5, 1.75]);

        let y = run(AnyTensor::from_i64(&[10], ()).unwrap(), 4.0, -3.0).unwrap();
        assert_eq!(y[0].dtype(), DType::I64);
        assert_eq!(y[0].to_i64_vec().unwrap(), vec![10, 7]);

        let y = run(AnyTensor::from_slice(&[3.0], ()).unwrap(), 1.0, 1.0).unwrap();
        assert_eq!(y[0].elem_count(), 0);

        assert!(run(AnyTensor::from_slice(&[0.0], ()).unwrap(), 1.0, 0.0).is_err());
    }

    #[test]
    fn test_constant_converts_backend() {
        let node = NodeProto::new("Constant", &[], &["c"])
            .with_attr("value_float", Attribute::Float(4.0));
        let mut config = build(&node).unwrap();
        convert_constant(&mut config, &Device::Native(Default::default())).unwrap();
        let c = forward_constant(&config, &Inputs::new(vec![])).unwrap();
        assert_eq!(c[0].kind(), BackendKind::Native);
        assert_eq!(c[0].to_scalar().unwrap(), 4.0);
    }
}
