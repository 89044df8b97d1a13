// Native backend checked element-for-element against the reference backend

use marten_core::{BinaryOp, DType, PadMode, ReduceOp, Tensor, UnaryOp};
use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};
use marten_native::{NativeBackend, NativeDevice, NativeTensor};
use proptest::prelude::*;

fn pair(data: &[f32], dims: &[usize], dev: &NativeDevice) -> (CpuTensor, NativeTensor) {
    (
        Tensor::<CpuBackend>::from_slice(data, dims, &CpuDevice).unwrap(),
        Tensor::<NativeBackend>::from_slice(data, dims, dev).unwrap(),
    )
}

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= 1e-5 * (1.0 + x.abs()), "{x} vs {y}");
    }
}

fn seq(n: usize) -> Vec<f32> {
    (0..n).map(|v| (v as f32) * 0.25 - 3.0).collect()
}

#[test]
fn test_broadcast_binary_matches_reference() {
    let dev = NativeDevice::new();
    let (ca, na) = pair(&seq(24), &[2, 3, 4], &dev);
    let (cb, nb) = pair(&seq(4), &[4], &dev);
    for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div] {
        let c = ca.binary(op, &cb, 2.0, 0.5).unwrap();
        let n = na.binary(op, &nb, 2.0, 0.5).unwrap();
        assert_eq!(c.dims(), n.dims());
        assert_close(&c.to_vec().unwrap(), &n.to_vec().unwrap());
    }
}

#[test]
fn test_transposed_unary_matches_reference() {
    let dev = NativeDevice::new();
    let (c, n) = pair(&seq(12), &[3, 4], &dev);
    let (c, n) = (c.transpose(None).unwrap(), n.transpose(None).unwrap());
    for op in [UnaryOp::Abs, UnaryOp::Tanh, UnaryOp::Sigmoid, UnaryOp::Relu] {
        assert_close(
            &c.unary(op).unwrap().to_vec().unwrap(),
            &n.unary(op).unwrap().to_vec().unwrap(),
        );
    }
}

#[test]
fn test_reductions_match_reference() {
    let dev = NativeDevice::new();
    let (c, n) = pair(&seq(60), &[3, 4, 5], &dev);
    for op in [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Mean, ReduceOp::LogSumExp] {
        for axes in [&[0i64][..], &[1, 2], &[-1]] {
            let a = c.reduce(op, Some(axes), true).unwrap();
            let b = n.reduce(op, Some(axes), true).unwrap();
            assert_eq!(a.dims(), b.dims());
            assert_close(&a.to_vec().unwrap(), &b.to_vec().unwrap());
        }
    }
}

#[test]
fn test_batched_matmul_matches_reference() {
    let dev = NativeDevice::new();
    let (ca, na) = pair(&seq(2 * 3 * 4), &[2, 3, 4], &dev);
    let (cb, nb) = pair(&seq(4 * 5), &[4, 5], &dev);
    let c = ca.matmul(&cb).unwrap();
    let n = na.matmul(&nb).unwrap();
    assert_eq!(n.dims(), &[2, 3, 5]);
    assert_close(&c.to_vec().unwrap(), &n.to_vec().unwrap());
}

#[test]
fn test_large_matmul_matches_reference() {
    // big enough to take the parallel path
    let dev = NativeDevice::new();
    let (ca, na) = pair(&seq(64 * 48), &[64, 48], &dev);
    let (cb, nb) = pair(&seq(48 * 32), &[48, 32], &dev);
    assert_close(
        &ca.matmul(&cb).unwrap().to_vec().unwrap(),
        &na.matmul(&nb).unwrap().to_vec().unwrap(),
    );
}

#[test]
fn test_structural_ops_match_reference() {
    let dev = NativeDevice::new();
    let (c, n) = pair(&seq(12), &[3, 4], &dev);

    let cs = c.slice(&[2, 3], &[0, 0], None, Some(&[-1, -2])).unwrap();
    let ns = n.slice(&[2, 3], &[0, 0], None, Some(&[-1, -2])).unwrap();
    assert_eq!(cs.to_vec().unwrap(), ns.to_vec().unwrap());

    let cp = c.pad(&[(1, 0), (0, 2)], PadMode::Reflect, 0.0).unwrap();
    let np = n.pad(&[(1, 0), (0, 2)], PadMode::Reflect, 0.0).unwrap();
    assert_eq!(cp.to_vec().unwrap(), np.to_vec().unwrap());

    let cc = CpuTensor::cat(&[&c, &c], 1).unwrap();
    let nc = NativeTensor::cat(&[&n, &n], 1).unwrap();
    assert_eq!(nc.dims(), &[3, 8]);
    assert_eq!(cc.to_vec().unwrap(), nc.to_vec().unwrap());

    assert_eq!(
        c.repeat(&[2, 1]).unwrap().to_vec().unwrap(),
        n.repeat(&[2, 1]).unwrap().to_vec().unwrap()
    );
}

#[test]
fn test_softmax_matches_reference() {
    let dev = NativeDevice::new();
    let (c, n) = pair(&seq(20), &[4, 5], &dev);
    assert_close(
        &c.softmax(-1).unwrap().to_vec().unwrap(),
        &n.softmax(-1).unwrap().to_vec().unwrap(),
    );
}

#[test]
fn test_repeated_pass_hits_the_pool() {
    let dev = NativeDevice::new();
    let x = NativeTensor::from_slice(&seq(16), (4, 4), &dev).unwrap();
    let run = || {
        let y = x.exp().unwrap();
        let z = y.add(&x).unwrap();
        y.release();
        z.release();
    };
    run();
    dev.pool().reset_stats();
    run();
    let stats = dev.pool_stats();
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.hits, 2);
    dev.empty_cache();
    assert_eq!(dev.pool_stats().cached_bytes, 0);
}

#[test]
fn test_half_precision_tag_survives() {
    let dev = NativeDevice::new();
    let t = NativeTensor::from_vec(vec![1.0 / 3.0], 1, DType::F16, &dev).unwrap();
    let y = t.affine(1.0, 0.0).unwrap();
    assert_eq!(y.dtype(), DType::F16);
    assert_eq!(t.to_vec().unwrap()[0], half::f16::from_f32(1.0 / 3.0).to_f32());
}

proptest! {
    #[test]
    fn add_agrees_with_reference(rows in 1usize..6, cols in 1usize..6, seed in -4.0f32..4.0) {
        let dev = NativeDevice::new();
        let data: Vec<f32> = (0..rows * cols).map(|i| seed + i as f32).collect();
        let (c, n) = pair(&data, &[rows, cols], &dev);
        let (cb, nb) = pair(&data[..cols], &[cols], &dev);
        prop_assert_eq!(c.add(&cb).unwrap().to_vec().unwrap(), n.add(&nb).unwrap().to_vec().unwrap());
    }
}
