// Element-wise operators: broadcasting arithmetic, unary math, activations

use marten_core::{BinaryOp, Error, Result, UnaryOp};

use super::{Inputs, NodeContext, OpConfig, OpDef, OperatorRegistry};
use crate::tensor::AnyTensor;

pub(super) fn register(registry: &mut OperatorRegistry) {
    for op in ["Add", "Sub", "Mul", "Div", "Pow"] {
        registry.register(op, OpDef::new(build_binary, forward_binary).with_opsets(7, super::MAX_OPSET));
    }
    registry.register("Sum", OpDef::new(super::no_config, forward_sum).with_opsets(8, super::MAX_OPSET));
    registry.register("Mean", OpDef::new(super::no_config, forward_mean).with_opsets(8, super::MAX_OPSET));
    for op in UNARY.iter().map(|(name, _)| name) {
        registry.register(op, OpDef::new(build_unary, forward_unary));
    }
    registry.register("LeakyRelu", OpDef::new(build_leaky_relu, forward_leaky_relu));
    registry.register("Elu", OpDef::new(build_elu, forward_elu));
    registry.register(
        "PRelu",
        OpDef::new(super::no_config, forward_prelu).with_opsets(7, super::MAX_OPSET),
    );
    registry.register("Selu", OpDef::new(build_selu, forward_selu).with_opsets(6, super::MAX_OPSET));
    registry.register("Celu", OpDef::new(build_celu, forward_celu).with_opsets(12, super::MAX_OPSET));
    registry.register("HardSigmoid", OpDef::new(build_hard_sigmoid, forward_hard_sigmoid));
    registry.register("Softplus", OpDef::new(super::no_config, forward_softplus));
    registry.register("Softsign", OpDef::new(super::no_config, forward_softsign));
    registry.register("Clip", OpDef::new(build_clip, forward_clip));
    registry.register("Softmax", OpDef::new(build_softmax, forward_softmax));
    registry.register("LogSoftmax", OpDef::new(build_softmax, forward_log_softmax));
}

// Binary

fn build_binary(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let op = match ctx.op_type() {
        "Add" => BinaryOp::Add,
        "Sub" => BinaryOp::Sub,
        "Mul" => BinaryOp::Mul,
        "Div" => BinaryOp::Div,
        "Pow" => BinaryOp::Pow,
        other => return Err(Error::UnknownOperator { op_type: other.to_string() }),
    };
    Ok(OpConfig::new(op))
}

fn forward_binary(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let op = *config.get::<BinaryOp>()?;
    Ok(vec![inputs.get(0)?.binary(op, inputs.get(1)?, 1.0, 1.0)?])
}

/// Left fold of `Add` over every present input.
fn sum_all(inputs: &Inputs<'_>) -> Result<(AnyTensor, usize)> {
    let mut terms = inputs.present();
    let first = terms.next().ok_or(Error::MissingInput { index: 0 })?;
    let mut acc = first.clone();
    let mut count = 1;
    for t in terms {
        let next = acc.add(t)?;
        if count > 1 {
            acc.release();
        }
        acc = next;
        count += 1;
    }
    Ok((acc, count))
}

fn forward_sum(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![sum_all(inputs)?.0])
}

fn forward_mean(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let (sum, count) = sum_all(inputs)?;
    let mean = sum.affine(1.0 / count as f32, 0.0)?;
    if count > 1 {
        sum.release();
    }
    Ok(vec![mean])
}

// Unary

const UNARY: &[(&str, UnaryOp)] = &[
    ("Neg", UnaryOp::Neg),
    ("Abs", UnaryOp::Abs),
    ("Sign", UnaryOp::Sign),
    ("Exp", UnaryOp::Exp),
    ("Log", UnaryOp::Log),
    ("Sqrt", UnaryOp::Sqrt),
    ("Reciprocal", UnaryOp::Reciprocal),
    ("Sin", UnaryOp::Sin),
    ("Cos", UnaryOp::Cos),
    ("Tan", UnaryOp::Tan),
    ("Asin", UnaryOp::Asin),
    ("Acos", UnaryOp::Acos),
    ("Atan", UnaryOp::Atan),
    ("Sinh", UnaryOp::Sinh),
    ("Cosh", UnaryOp::Cosh),
    ("Tanh", UnaryOp::Tanh),
    ("Asinh", UnaryOp::Asinh),
    ("Acosh", UnaryOp::Acosh),
    ("Atanh", UnaryOp::Atanh),
    ("Floor", UnaryOp::Floor),
    ("Ceil", UnaryOp::Ceil),
    ("Round", UnaryOp::Round),
    ("Sigmoid", UnaryOp::Sigmoid),
    ("Relu", UnaryOp::Relu),
];

fn build_unary(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let op = UNARY
        .iter()
        .find(|(name, _)| *name == ctx.op_type())
        .map(|(_, op)| *op)
        .ok_or_else(|| Error::UnknownOperator {
            op_type: ctx.op_type().to_string(),
        })?;
    Ok(OpConfig::new(op))
}

fn forward_unary(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let op = *config.get::<UnaryOp>()?;
    Ok(vec![inputs.get(0)?.unary(op)?])
}

// Parameterized activations

fn build_leaky_relu(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(ctx.attr_f("alpha", 0.01)?))
}

fn build_elu(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(ctx.attr_f("alpha", 1.0)?))
}

/// `max(x, 0) + alpha * min(x, 0)`, as `relu(x) - alpha * relu(-x)`.
fn forward_leaky_relu(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let alpha = *config.get::<f32>()?;
    let x = inputs.get(0)?;
    let pos = x.unary(UnaryOp::Relu)?;
    let neg_x = x.affine(-1.0, 0.0)?;
    let neg = neg_x.unary(UnaryOp::Relu)?;
    neg_x.release();
    let out = pos.binary(BinaryOp::Sub, &neg, 1.0, alpha)?;
    pos.release();
    neg.release();
    Ok(vec![out])
}

/// `x` for positive inputs, `alpha * (exp(x) - 1)` otherwise.
fn forward_elu(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let alpha = *config.get::<f32>()?;
    let x = inputs.get(0)?;
    let pos = x.unary(UnaryOp::Relu)?;
    let tail = exp_tail(x, 1.0, alpha)?;
    let out = pos.add(&tail)?;
    pos.release();
    tail.release();
    Ok(vec![out])
}

/// `exp(min(x, 0)) - 1` scaled by `alpha`, zero for positive inputs.
fn exp_tail(x: &AnyTensor, inv_scale: f32, alpha: f32) -> Result<AnyTensor> {
    let low = x.clamp(f32::NEG_INFINITY, 0.0)?;
    let scaled = low.affine(inv_scale, 0.0)?;
    low.release();
    let e = scaled.unary(UnaryOp::Exp)?;
    scaled.release();
    let tail = e.affine(alpha, -alpha)?;
    e.release();
    Ok(tail)
}

/// `max(x, 0) + slope * min(x, 0)`; `slope` broadcasts against `x`.
fn forward_prelu(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let x = inputs.get(0)?;
    let slope = inputs.get(1)?;
    let pos = x.unary(UnaryOp::Relu)?;
    let low = x.clamp(f32::NEG_INFINITY, 0.0)?;
    let neg = low.mul(slope)?;
    low.release();
    let out = pos.add(&neg)?;
    pos.release();
    neg.release();
    Ok(vec![out])
}

#[derive(Debug, Clone, Copy)]
struct Selu {
    alpha: f32,
    gamma: f32,
}

fn build_selu(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(Selu {
        alpha: ctx.attr_f("alpha", 1.673_263_2)?,
        gamma: ctx.attr_f("gamma", 1.050_701)?,
    }))
}

/// `gamma * (max(x, 0) + alpha * (exp(min(x, 0)) - 1))`.
fn forward_selu(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let p = *config.get::<Selu>()?;
    let x = inputs.get(0)?;
    let pos = x.unary(UnaryOp::Relu)?;
    let tail = exp_tail(x, 1.0, p.alpha * p.gamma)?;
    let out = tail.binary(BinaryOp::Add, &pos, 1.0, p.gamma)?;
    pos.release();
    tail.release();
    Ok(vec![out])
}

fn build_celu(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let alpha = ctx.attr_f("alpha", 1.0)?;
    if alpha == 0.0 {
        return Err(Error::attribute("alpha", "must be non-zero"));
    }
    Ok(OpConfig::new(alpha))
}

/// `max(x, 0) + alpha * (exp(min(x, 0) / alpha) - 1)`.
fn forward_celu(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let alpha = *config.get::<f32>()?;
    let x = inputs.get(0)?;
    let pos = x.unary(UnaryOp::Relu)?;
    let tail = exp_tail(x, 1.0 / alpha, alpha)?;
    let out = pos.add(&tail)?;
    pos.release();
    tail.release();
    Ok(vec![out])
}

#[derive(Debug, Clone, Copy)]
struct HardSigmoid {
    alpha: f32,
    beta: f32,
}

fn build_hard_sigmoid(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(HardSigmoid {
        alpha: ctx.attr_f("alpha", 0.2)?,
        beta: ctx.attr_f("beta", 0.5)?,
    }))
}

fn forward_hard_sigmoid(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let p = *config.get::<HardSigmoid>()?;
    let y = inputs.get(0)?.affine(p.alpha, p.beta)?;
    let out = y.clamp(0.0, 1.0)?;
    y.release();
    Ok(vec![out])
}

/// `ln(exp(x) + 1)`.
fn forward_softplus(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let e = inputs.get(0)?.unary(UnaryOp::Exp)?;
    let shifted = e.affine(1.0, 1.0)?;
    e.release();
    let out = shifted.unary(UnaryOp::Log)?;
    shifted.release();
    Ok(vec![out])
}

/// `x / (1 + |x|)`.
fn forward_softsign(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let x = inputs.get(0)?;
    let a = x.unary(UnaryOp::Abs)?;
    let denom = a.affine(1.0, 1.0)?;
    a.release();
    let out = x.div(&denom)?;
    denom.release();
    Ok(vec![out])
}

// Clip

#[derive(Debug, Clone, Copy)]
enum Clip {
    /// Bounds fixed at load time (opset < 11).
    Attr { min: f32, max: f32 },
    /// Bounds from optional inputs 1 and 2.
    Inputs,
}

fn build_clip(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    if ctx.opset() >= 11 {
        return Ok(OpConfig::new(Clip::Inputs));
    }
    Ok(OpConfig::new(Clip::Attr {
        min: ctx.attr_f("min", f32::NEG_INFINITY)?,
        max: ctx.attr_f("max", f32::INFINITY)?,
    }))
}

fn forward_clip(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let (min, max) = match *config.get::<Clip>()? {
        Clip::Attr { min, max } => (min, max),
        Clip::Inputs => (
            inputs.opt_scalar(1)?.unwrap_or(f32::NEG_INFINITY),
            inputs.opt_scalar(2)?.unwrap_or(f32::INFINITY),
        ),
    };
    Ok(vec![inputs.get(0)?.clamp(min, max)?])
}

// Softmax

#[derive(Debug, Clone, Copy)]
struct Softmax {
    axis: i64,
    /// Before opset 13 the input is coerced to 2-D at `axis` first.
    coerce_2d: bool,
}

fn build_softmax(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    let coerce_2d = ctx.opset() < 13;
    let axis = ctx.attr_i("axis", if coerce_2d { 1 } else { -1 })?;
    Ok(OpConfig::new(Softmax { axis, coerce_2d }))
}

fn softmax(config: &OpConfig, x: &AnyTensor) -> Result<AnyTensor> {
    let p = *config.get::<Softmax>()?;
    if !p.coerce_2d {
        return x.softmax(p.axis);
    }
    let flat = x.flatten(p.axis)?;
    let y = flat.softmax(1)?;
    y.reshape(x.shape().clone())
}

fn forward_softmax(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![softmax(config, inputs.get(0)?)?])
}

fn forward_log_softmax(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let s = softmax(config, inputs.get(0)?)?;
    let out = s.unary(UnaryOp::Log)?;
    s.release();
    Ok(vec![out])
}
