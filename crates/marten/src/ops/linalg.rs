// Matrix products

use marten_core::Result;

use super::{Inputs, NodeContext, OpConfig, OpDef, OperatorRegistry};
use crate::tensor::AnyTensor;

pub(super) fn register(registry: &mut OperatorRegistry) {
    registry.register("MatMul", OpDef::new(super::no_config, forward_matmul));
    registry.register("Gemm", OpDef::new(build_gemm, forward_gemm));
}

fn forward_matmul(_: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    Ok(vec![inputs.get(0)?.matmul(inputs.get(1)?)?])
}

#[derive(Debug, Clone, Copy)]
struct Gemm {
    alpha: f32,
    beta: f32,
    trans_a: bool,
    trans_b: bool,
}

fn build_gemm(ctx: &NodeContext<'_>) -> Result<OpConfig> {
    Ok(OpConfig::new(Gemm {
        alpha: ctx.attr_f("alpha", 1.0)?,
        beta: ctx.attr_f("beta", 1.0)?,
        trans_a: ctx.attr_i("transA", 0)? != 0,
        trans_b: ctx.attr_i("transB", 0)? != 0,
    }))
}

/// `alpha * A' @ B' + beta * C`; `C` is optional and broadcasts.
fn forward_gemm(config: &OpConfig, inputs: &Inputs<'_>) -> Result<Vec<AnyTensor>> {
    let p = *config.get::<Gemm>()?;
    let y = inputs.get(0)?.gemm(
        inputs.get(1)?,
        inputs.opt(2),
        p.alpha,
        p.beta,
        p.trans_a,
        p.trans_b,
    )?;
    Ok(vec![y])
}
