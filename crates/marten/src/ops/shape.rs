// Shape manipulation: reshape, transpose, slicing, tiling, padding, gather

use marten_core::{DType, Error, PadMode, Result};

use super::{AxesSource, Inputs, NodeContext, OpConfig, OpDef, OperatorRegistry};
use crate::tensor::AnyTensor;

pub(super) fn register(registry: &mut OperatorRegistry) {
    registry.register("Reshape", OpDef::new(build_reshape, forward_reshape));
    registry.register("Flatten", OpDef::new(build_flatten, forward_flatten));
    registry.register("Transpose", OpDef::new(build_transpose, forward_transpose));
    registry.register("Concat", OpDef::new(build_concat, forward_concat));
    registry.register("Slice", OpDef::new(build_slice, forward_slice));
    registry.register(
        "Tile",
        OpDef::new(super::no_config, forward_tile).with_opsets(6, super::MAX_OPSET),
    );
    registry.register(
        "Expand",
        OpDef::new(super::no_config, forward_expand).with_opsets(8, super::MAX_OPSET),
    );
    registry.register("Pad", OpDef::new(build_pad, forward_pad));
    registry.register("Gather", OpDef::new(build_gather, forward_gather));
    registry.register("Unsqueeze", OpDef::new(build_unsqueeze, forward_unsqueeze));
    registry.register("Squeeze", OpDef::new(build_squeeze, forward_squeeze));
    registry.register("Shape", OpDef::new(build_shape, forward_shape));
    registry.register("Size", OpDef::new(super::no_config, forward_size));
}

/// Non-negative integers, or an attribute error naming `what`.
fn to_usize(values: &[i64], what: &str) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| Error::attribute(what, format!("negative value {v}")))
        })
        .collect()
}

// Reshape

#[derive(Debug, Clone)]
struct Reshape {
    /// Target from the attribute (opset < 5); otherwise input 1.
    shape: Option<Vec<i64>>,
    /// A 0 in the target is a literal 0 rather than "copy this dim".
    allow_zero: bool,
}

fn build_reshape(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let shape = if ctx.opset() < 5 {
        Some(ctx.attr_ints("shape")?.ok_or_else(|| ctx.missing("shape"))?)
    } else {
        None
    };
    Ok(OpConfig::new(Reshape {
        shape,
        allow_zero: ctx.attr_i("allowzero", 0)? != 0,
    }))
}

fn forward_reshape(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let p = config.get::<Reshape>()?;
    let x = inputs.get(0)?;
    let mut spec = match &p.shape {
        Some(s) => s.clone(),
        None => inputs.ints(1)?,
    };
    if !p.allow_zero {
        for (i, d) in spec.iter_mut().enumerate() {
            if *d == 0 {
                *d = *x.dims().get(i).ok_or(Error::DimOutOfRange {
                    dim: i as i64,
                    rank: x.rank(),
                })? as i64;
            }
        }
    }
    Ok(vec![x.reshape_spec(&spec)?])
}

// Flatten / Transpose / Concat

fn build_flatten(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(ctx.attr_i("axis", 1)?))
}

fn forward_flatten(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![inputs.get(0)?.flatten(*config.get::<i64>()?)?])
}

fn build_transpose(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let perm = ctx
        .attr_ints("perm")?
        .map(|p| to_usize(&p, "perm"))
        .transpose()?;
    Ok(OpConfig::new(perm))
}

fn forward_transpose(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let perm = config.get::<Option<Vec<usize>>>()?;
    Ok(vec![inputs.get(0)?.transpose(perm.as_deref())?])
}

fn build_concat(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    match ctx.attr("axis") {
        None => Err(ctx.missing("axis")),
        Some(_) => Ok(OpConfig::new(ctx.attr_i("axis", 0)?)),
    }
}

fn forward_concat(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let parts: Vec<&AnyTensor> = inputs.present().collect();
    Ok(vec![AnyTensor::cat(&parts, *config.get::<i64>()?)?])
}

// Slice

#[derive(Debug, Clone)]
enum Slice {
    /// starts / ends / axes attributes (opset < 10).
    Attr {
        starts: Vec<i64>,
        ends: Vec<i64>,
        axes: Option<Vec<i64>>,
    },
    /// starts, ends, axes and steps from inputs 1..=4.
    Inputs,
}

fn build_slice(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    if ctx.opset() >= 10 {
        return Ok(OpConfig::new(Slice::Inputs));
    }
    Ok(OpConfig::new(Slice::Attr {
        starts: ctx.attr_ints("starts")?.ok_or_else(|| ctx.missing("starts"))?,
        ends: ctx.attr_ints("ends")?.ok_or_else(|| ctx.missing("ends"))?,
        axes: ctx.attr_ints("axes")?,
    }))
}

fn forward_slice(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let x = inputs.get(0)?;
    let out = match config.get::<Slice>()? {
        Slice::Attr { starts, ends, axes } => x.slice(starts, ends, axes.as_deref(), None)?,
        Slice::Inputs => {
            let starts = inputs.ints(1)?;
            let ends = inputs.ints(2)?;
            let axes = inputs.opt_ints(3)?;
            let steps = inputs.opt_ints(4)?;
            x.slice(&starts, &ends, axes.as_deref(), steps.as_deref())?
        }
    };
    Ok(vec![out])
}

// Tile / Expand

fn forward_tile(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let repeats = to_usize(&inputs.ints(1)?, "repeats")?;
    Ok(vec![inputs.get(0)?.repeat(&repeats)?])
}

fn forward_expand(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let shape = to_usize(&inputs.ints(1)?, "shape")?;
    Ok(vec![inputs.get(0)?.expand(shape)?])
}

// Pad

#[derive(Debug, Clone)]
struct Pad {
    mode: PadMode,
    /// pads and value from attributes (opset < 11).
    legacy: Option<(Vec<i64>, f32)>,
}

fn build_pad(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let mode = match ctx.attr_s("mode", "constant")?.as_str() {
        "constant" => PadMode::Constant,
        "reflect" => PadMode::Reflect,
        "edge" => PadMode::Edge,
        other => {
            return Err(Error::attribute(
                "mode",
                format!("unsupported pad mode '{other}'"),
            ))
        }
    };
    let legacy = if ctx.opset() < 11 {
        // opset 1 called it "paddings"
        let pads = match ctx.attr_ints("pads")? {
            Some(p) => p,
            None => ctx
                .attr_ints("paddings")?
                .ok_or_else(|| ctx.missing("pads"))?,
        };
        Some((pads, ctx.attr_f("value", 0.0)?))
    } else {
        None
    };
    Ok(OpConfig::new(Pad { mode, legacy }))
}

fn forward_pad(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let p = config.get::<Pad>()?;
    let x = inputs.get(0)?;
    let rank = x.rank();
    let (pads, value, axes) = match &p.legacy {
        Some((pads, value)) => (pads.clone(), *value, None),
        None => (
            inputs.ints(1)?,
            inputs.opt_scalar(2)?.unwrap_or(0.0),
            inputs.opt_ints(3)?,
        ),
    };
    let axes: Vec<usize> = match axes {
        Some(a) => a
            .iter()
            .map(|&v| marten_core::shape::normalize_axis(v, rank))
            .collect::<Result<_>>()?,
        None => (0..rank).collect(),
    };
    if pads.len() != 2 * axes.len() {
        return Err(Error::attribute(
            "pads",
            format!("expected {} values, got {}", 2 * axes.len(), pads.len()),
        ));
    }
    // [b_0, .., b_k, e_0, .., e_k] over `axes` -> (before, after) per axis
    let mut per_axis = vec![(0i64, 0i64); rank];
    for (i, &axis) in axes.iter().enumerate() {
        per_axis[axis] = (pads[i], pads[i + axes.len()]);
    }
    Ok(vec![x.pad(&per_axis, p.mode, value)?])
}

// Gather / Unsqueeze / Squeeze

fn build_gather(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(ctx.attr_i("axis", 0)?))
}

fn forward_gather(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let axis = *config.get::<i64>()?;
    Ok(vec![inputs.get(0)?.gather(inputs.get(1)?, axis)?])
}

fn build_unsqueeze(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(AxesSource::from_context(ctx, "axes", 13, 1)?))
}

fn forward_unsqueeze(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let axes = config
        .get::<AxesSource>()?
        .resolve(inputs)?
        .ok_or_else(|| Error::attribute("axes", "required by Unsqueeze"))?;
    Ok(vec![inputs.get(0)?.unsqueeze(&axes)?])
}

fn build_squeeze(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(AxesSource::from_context(ctx, "axes", 13, 1)?))
}

fn forward_squeeze(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let axes = config.get::<AxesSource>()?.resolve(inputs)?;
    Ok(vec![inputs.get(0)?.squeeze(axes.as_deref())?])
}

// Shape / Size

#[derive(Debug, Clone, Copy)]
struct ShapeRange {
    start: i64,
    end: Option<i64>,
}

fn build_shape(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let end = match ctx.attr("end") {
        Some(_) => Some(ctx.attr_i("end", 0)?),
        None => None,
    };
    Ok(OpConfig::new(ShapeRange {
        start: ctx.attr_i("start", 0)?,
        end,
    }))
}

fn forward_shape(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let r = *config.get::<ShapeRange>()?;
    let x = inputs.get(0)?;
    let rank = x.rank() as i64;
    let clamp = |v: i64| (if v < 0 { (v + rank).max(0) } else { v.min(rank) }) as usize;
    let start = clamp(r.start);
    let end = clamp(r.end.unwrap_or(rank)).max(start);
    let dims: Vec<f32> = x.dims()[start..end].iter().map(|&d| d as f32).collect();
    let n = dims.len();
    Ok(vec![x.new_like(dims, n, DType::I64)?])
}

fn forward_size(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let x = inputs.get(0)?;
    Ok(vec![x.new_like(vec![x.elem_count() as f32], (), DType::I64)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::{Attribute, NodeProto};
    use std::collections::HashMap;

    fn run(op: &str, opset: i64, node: NodeProto, inputs: &[Option<&AnyTensor>]) -> Result<AnyTensor> {
        let def = *OperatorRegistry::with_builtins().get(op).unwrap();
        let constants = HashMap::new();
        let config = (def.build)(&NodeContext::new(&node, opset, &constants))?;
        Ok((def.forward)(&config, &Inputs::new(inputs.to_vec()))?.remove(0))
    }

    fn seq(n: usize, dims: impl Into<marten_core::Shape>) -> AnyTensor {
        let data: Vec<f32> = (0..n).map(|v| v as f32).collect();
        AnyTensor::from_slice(&data, dims).unwrap()
    }

    #[test]
    fn test_reshape_zero_copies_dim() {
        let x = seq(24, (2, 3, 4));
        let shape = AnyTensor::from_i64(&[0, -1], 2).unwrap();
        let node = NodeProto::new("Reshape", &["x", "s"], &["y"]);
        let y = run("Reshape", 13, node, &[Some(&x), Some(&shape)]).unwrap();
        assert_eq!(y.dims(), &[2, 12]);
    }

    #[test]
    fn test_slice_inputs_with_negative_step() {
        let x = seq(5, 5);
        let starts = AnyTensor::from_i64(&[-1], 1).unwrap();
        let ends = AnyTensor::from_i64(&[i64::MIN], 1).unwrap();
        let steps = AnyTensor::from_i64(&[-2], 1).unwrap();
        let node = NodeProto::new("Slice", &["x", "s", "e", "", "st"], &["y"]);
        let y = run("Slice", 13, node, &[Some(&x), Some(&starts), Some(&ends), None, Some(&steps)])
            .unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![4.0, 2.0, 0.0]);
    }

    #[test]
    fn test_legacy_slice_attributes() {
        let x = seq(6, (2, 3));
        let node = NodeProto::new("Slice", &["x"], &["y"])
            .with_attr("starts", Attribute::Ints(vec![1]))
            .with_attr("ends", Attribute::Ints(vec![100]))
            .with_attr("axes", Attribute::Ints(vec![1]));
        let y = run("Slice", 9, node, &[Some(&x)]).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_pad_with_axes_input() {
        let x = seq(4, (2, 2));
        let pads = AnyTensor::from_i64(&[1, 0], 2).unwrap();
        let value = AnyTensor::from_slice(&[9.0], ()).unwrap();
        let axes = AnyTensor::from_i64(&[-1], 1).unwrap();
        let node = NodeProto::new("Pad", &["x", "p", "v", "a"], &["y"]);
        let y = run("Pad", 18, node, &[Some(&x), Some(&pads), Some(&value), Some(&axes)]).unwrap();
        assert_eq!(y.dims(), &[2, 3]);
        assert_eq!(y.to_vec().unwrap(), vec![9.0, 0.0, 1.0, 9.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pad_rejects_wrap() {
        let node = NodeProto::new("Pad", &["x", "p"], &["y"])
            .with_attr("mode", Attribute::String("wrap".into()));
        let x = seq(2, 2);
        assert!(matches!(
            run("Pad", 13, node, &[Some(&x)]).unwrap_err(),
            Error::Attribute { .. }
        ));
    }

    #[test]
    fn test_unsqueeze_attr_vs_input() {
        let x = seq(3, 3);
        let node = NodeProto::new("Unsqueeze", &["x"], &["y"])
            .with_attr("axes", Attribute::Ints(vec![0, 2]));
        assert_eq!(run("Unsqueeze", 11, node, &[Some(&x)]).unwrap().dims(), &[1, 3, 1]);
        let axes = AnyTensor::from_i64(&[-1], 1).unwrap();
        let node = NodeProto::new("Unsqueeze", &["x", "a"], &["y"]);
        assert_eq!(
            run("Unsqueeze", 13, node, &[Some(&x), Some(&axes)]).unwrap().dims(),
            &[3, 1]
        );
    }

    #[test]
    fn test_shape_and_size() {
        let x = seq(24, (2, 3, 4));
        let node = NodeProto::new("Shape", &["x"], &["y"]).with_attr("start", Attribute::Int(-2));
        let s = run("Shape", 15, node, &[Some(&x)]).unwrap();
        assert_eq!(s.dtype(), DType::I64);
        assert_eq!(s.to_i64_vec().unwrap(), vec![3, 4]);
        let node = NodeProto::new("Size", &["x"], &["y"]);
        assert_eq!(run("Size", 13, node, &[Some(&x)]).unwrap().to_scalar().unwrap(), 24.0);
    }

    #[test]
    fn test_tile_and_expand() {
        let x = seq(2, (2, 1));
        let reps = AnyTensor::from_i64(&[1, 2], 2).unwrap();
        let node = NodeProto::new("Tile", &["x", "r"], &["y"]);
        let y = run("Tile", 13, node, &[Some(&x), Some(&reps)]).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![0.0, 0.0, 1.0, 1.0]);
        let shape = AnyTensor::from_i64(&[3], 1).unwrap();
        let node = NodeProto::new("Expand", &["x", "s"], &["y"]);
        assert_eq!(run("Expand", 13, node, &[Some(&x), Some(&shape)]).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_concat_requires_axis() {
        let node = NodeProto::new("Concat", &["a", "b"], &["y"]);
        let x = seq(2, 2);
        assert!(run("Concat", 13, node, &[Some(&x), Some(&x)]).is_err());
    }
}
