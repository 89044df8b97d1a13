//! WGSL compute kernels.
//!
//! Every kernel reads its parameters from a `array<u32>` storage buffer at
//! binding 0 (shape and stride arrays have no fixed rank that way), takes
//! its inputs at the next bindings and writes the last one. One thread per
//! output element; grids wider than the per-dimension dispatch limit wrap
//! into `y`.

/// Shared declarations, pasted in front of every kernel.
macro_rules! prelude {
    () => {
        r#"
const WORKGROUP_SIZE: u32 = 256u;

@group(0) @binding(0) var<storage, read> params: array<u32>;

fn thread_index(gid: vec3<u32>, groups: vec3<u32>) -> u32 {
    return gid.x + gid.y * groups.x * WORKGROUP_SIZE;
}

// Storage offset of logical element `i` of a layout whose dims start at
// params[dims_at] and strides at params[strides_at].
fn strided_offset(i: u32, rank: u32, dims_at: u32, strides_at: u32) -> u32 {
    var rem = i;
    var off = 0u;
    for (var d = i32(rank) - 1; d >= 0; d = d - 1) {
        let n = params[dims_at + u32(d)];
        off = off + (rem % n) * params[strides_at + u32(d)];
        rem = rem / n;
    }
    return off;
}
"#
    };
}

/// Strided element-wise map: unary ops, affine, clamp and plain copy.
///
/// params: `[n, rank, offset, op, p0, p1, dims.., strides..]`
pub const MAP: &str = concat!(
    prelude!(),
    r#"
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;

fn apply(op: u32, x: f32, p0: f32, p1: f32) -> f32 {
    var r = x;
    switch op {
        case 0u: { r = -x; }
        case 1u: { r = abs(x); }
        case 2u: { r = sign(x); }
        case 3u: { r = exp(x); }
        case 4u: { r = log(x); }
        case 5u: { r = sqrt(x); }
        case 6u: { r = 1.0 / x; }
        case 7u: { r = sin(x); }
        case 8u: { r = cos(x); }
        case 9u: { r = tan(x); }
        case 10u: { r = asin(x); }
        case 11u: { r = acos(x); }
        case 12u: { r = atan(x); }
        case 13u: { r = sinh(x); }
        case 14u: { r = cosh(x); }
        case 15u: { r = tanh(x); }
        case 16u: { r = asinh(x); }
        case 17u: { r = acosh(x); }
        case 18u: { r = atanh(x); }
        case 19u: { r = floor(x); }
        case 20u: { r = ceil(x); }
        case 21u: { r = round(x); }
        case 22u: { r = trunc(x); }
        case 23u: { r = 1.0 / (1.0 + exp(-x)); }
        case 24u: { r = max(x, 0.0); }
        case 100u: { r = x * p0 + p1; }
        case 101u: { r = min(max(x, p0), p1); }
        default: {}
    }
    return r;
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let i = thread_index(gid, groups);
    if (i >= params[0]) {
        return;
    }
    let rank = params[1];
    let src_at = params[2] + strided_offset(i, rank, 6u, 6u + rank);
    dst[i] = apply(params[3], src[src_at], bitcast<f32>(params[4]), bitcast<f32>(params[5]));
}
"#
);

/// `op(alpha * lhs, beta * rhs)` over two strided layouts of one shape.
///
/// params: `[n, rank, op, alpha, beta, lhs_offset, rhs_offset, dims.., lhs_strides.., rhs_strides..]`
pub const BINARY: &str = concat!(
    prelude!(),
    r#"
@group(0) @binding(1) var<storage, read> lhs: array<f32>;
@group(0) @binding(2) var<storage, read> rhs: array<f32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;

// pow() is undefined for negative bases
fn power(a: f32, b: f32) -> f32 {
    if (b == 0.0) {
        return 1.0;
    }
    if (a < 0.0 && b == trunc(b)) {
        let r = pow(-a, b);
        if (abs(b % 2.0) == 1.0) {
            return -r;
        }
        return r;
    }
    return pow(a, b);
}

fn combine(op: u32, a: f32, b: f32) -> f32 {
    var r = 0.0;
    switch op {
        case 0u: { r = a + b; }
        case 1u: { r = a - b; }
        case 2u: { r = a * b; }
        case 3u: { r = a / b; }
        default: { r = power(a, b); }
    }
    return r;
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let i = thread_index(gid, groups);
    if (i >= params[0]) {
        return;
    }
    let rank = params[1];
    let a = lhs[params[5] + strided_offset(i, rank, 7u, 7u + rank)];
    let b = rhs[params[6] + strided_offset(i, rank, 7u, 7u + 2u * rank)];
    dst[i] = combine(params[2], bitcast<f32>(params[3]) * a, bitcast<f32>(params[4]) * b);
}
"#
);

/// One thread per output element folds its group of reduced elements.
///
/// params: `[n_out, group, op, offset, inf, kept_rank, red_rank,
///           kept_dims.., kept_strides.., red_dims.., red_strides..]`
pub const REDUCE: &str = concat!(
    prelude!(),
    r#"
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let i = thread_index(gid, groups);
    if (i >= params[0]) {
        return;
    }
    let size = params[1];
    let op = params[2];
    let inf = bitcast<f32>(params[4]);
    let kr = params[5];
    let rr = params[6];
    let base = params[3] + strided_offset(i, kr, 7u, 7u + kr);
    let rd = 7u + 2u * kr;
    let rs = rd + rr;

    var acc = 0.0;
    if (op == 1u) {
        acc = 1.0;
    } else if (op == 2u) {
        acc = inf;
    } else if (op == 3u || op == 7u) {
        acc = -inf;
    }
    for (var g = 0u; g < size; g = g + 1u) {
        let v = src[base + strided_offset(g, rr, rd, rs)];
        switch op {
            case 1u: { acc = acc * v; }
            case 2u: { acc = min(acc, v); }
            case 3u, 7u: { acc = max(acc, v); }
            case 5u: { acc = acc + v * v; }
            default: { acc = acc + v; }
        }
    }

    if (op == 4u) {
        acc = acc / f32(size);
    } else if (op == 6u) {
        acc = log(acc);
    } else if (op == 7u && abs(acc) != inf) {
        let m = acc;
        var s = 0.0;
        for (var g = 0u; g < size; g = g + 1u) {
            s = s + exp(src[base + strided_offset(g, rr, rd, rs)] - m);
        }
        acc = m + log(s);
    }
    dst[i] = acc;
}
"#
);

/// Batched `[b, m, k] @ [b, k, n]` over row-major operands.
///
/// params: `[batch, m, k, n, lhs_offset, rhs_offset]`
pub const MATMUL: &str = concat!(
    prelude!(),
    r#"
@group(0) @binding(1) var<storage, read> lhs: array<f32>;
@group(0) @binding(2) var<storage, read> rhs: array<f32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let i = thread_index(gid, groups);
    let m = params[1];
    let k = params[2];
    let n = params[3];
    if (i >= params[0] * m * n) {
        return;
    }
    let b = i / (m * n);
    let row = (i / n) % m;
    let col = i % n;
    let a_at = params[4] + (b * m + row) * k;
    let b_at = params[5] + b * k * n + col;
    var acc = 0.0;
    for (var p = 0u; p < k; p = p + 1u) {
        acc = acc + lhs[a_at + p] * rhs[b_at + p * n];
    }
    dst[i] = acc;
}
"#
);

/// Pick entries along one axis by position.
///
/// params: `[n, rank, dim, offset, out_dims.., strides.., indices..]`
pub const GATHER: &str = concat!(
    prelude!(),
    r#"
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let i = thread_index(gid, groups);
    if (i >= params[0]) {
        return;
    }
    let rank = params[1];
    let dim = params[2];
    var rem = i;
    var off = params[3];
    for (var d = i32(rank) - 1; d >= 0; d = d - 1) {
        let ud = u32(d);
        let size = params[4u + ud];
        var c = rem % size;
        rem = rem / size;
        if (ud == dim) {
            c = params[4u + 2u * rank + c];
        }
        off = off + c * params[4u + rank + ud];
    }
    dst[i] = src[off];
}
"#
);

/// Copy a strided input into a region of a larger row-major output.
///
/// params: `[n, rank, src_offset, dst_base, dims.., src_strides.., dst_strides..]`
pub const PLACE: &str = concat!(
    prelude!(),
    r#"
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let i = thread_index(gid, groups);
    if (i >= params[0]) {
        return;
    }
    let rank = params[1];
    let src_at = params[2] + strided_offset(i, rank, 4u, 4u + rank);
    let dst_at = params[3] + strided_offset(i, rank, 4u, 4u + 2u * rank);
    dst[dst_at] = src[src_at];
}
"#
);
