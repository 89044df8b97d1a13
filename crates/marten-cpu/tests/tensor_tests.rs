// Tensor contract tests against the reference backend

use marten_core::{BinaryOp, DType, Error, PadMode, ReduceOp, UnaryOp};
use marten_cpu::{CpuDevice, CpuTensor};
use proptest::prelude::*;

const DEV: CpuDevice = CpuDevice;

fn t(data: &[f32], shape: &[usize]) -> CpuTensor {
    CpuTensor::from_slice(data, shape, &DEV).unwrap()
}

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len(), "length: {got:?} vs {want:?}");
    for (g, w) in got.iter().zip(want) {
        assert!((g - w).abs() < 1e-5, "{got:?} vs {want:?}");
    }
}

// Broadcasting

#[test]
fn test_debug_names_device() {
    let a = t(&[1.0, 2.0], &[2]);
    let shown = format!("{a:?}");
    assert!(shown.starts_with("Tensor("));
    assert!(shown.contains("device=cpu"));
}

#[test]
fn test_broadcast_row_vector() {
    let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let b = t(&[10.0, 20.0], &[2]);
    let c = a.add(&b).unwrap();
    assert_eq!(c.dims(), &[2, 2]);
    assert_eq!(c.to_vec().unwrap(), vec![11.0, 22.0, 13.0, 24.0]);
}

#[test]
fn test_broadcast_incompatible() {
    let a = t(&[1.0, 2.0, 3.0], &[3]);
    let b = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let err = a.add(&b).unwrap_err();
    assert!(matches!(err, Error::BroadcastIncompatible { .. }));
}

#[test]
fn test_broadcast_both_operands() {
    let a = t(&[1.0, 2.0], &[2, 1]);
    let b = t(&[10.0, 20.0, 30.0], &[1, 3]);
    let c = a.mul(&b).unwrap();
    assert_eq!(c.dims(), &[2, 3]);
    assert_eq!(c.to_vec().unwrap(), vec![10.0, 20.0, 30.0, 20.0, 40.0, 60.0]);
}

#[test]
fn test_binary_scale_factors() {
    let a = t(&[1.0, 2.0], &[2]);
    let b = t(&[3.0, 4.0], &[2]);
    // 2a - 3b
    let c = a.binary(BinaryOp::Sub, &b, 2.0, 3.0).unwrap();
    assert_eq!(c.to_vec().unwrap(), vec![-7.0, -8.0]);
}

#[test]
fn test_scalar_operand() {
    let a = t(&[1.0, 2.0, 3.0], &[3]);
    let s = CpuTensor::scalar(2.0, DType::F32, &DEV).unwrap();
    assert_eq!(s.elem_count(), 1);
    assert_eq!(a.pow(&s).unwrap().to_vec().unwrap(), vec![1.0, 4.0, 9.0]);
}

// Element access

#[test]
fn test_get_and_linear_get() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    assert_eq!(a.get(&[1, 2]).unwrap(), 6.0);
    assert_eq!(a.get_linear(4).unwrap(), 5.0);
    let tr = a.transpose(None).unwrap();
    assert_eq!(tr.get(&[2, 0]).unwrap(), 3.0);
    assert!(matches!(
        a.get(&[2, 0]),
        Err(Error::IndexOutOfBounds { .. })
    ));
}

#[test]
fn test_set_does_not_leak_into_shared_views() {
    let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let mut b = a.clone();
    b.set(&[0, 1], 9.0).unwrap();
    assert_eq!(b.to_vec().unwrap(), vec![1.0, 9.0, 3.0, 4.0]);
    assert_eq!(a.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let mut e = t(&[5.0], &[1]).expand(&[3][..]).unwrap();
    e.set_linear(1, 0.0).unwrap();
    assert_eq!(e.to_vec().unwrap(), vec![5.0, 0.0, 5.0]);
}

#[test]
fn test_set_quantizes_to_dtype() {
    let mut a = CpuTensor::zeros(&[2][..], DType::I64, &DEV).unwrap();
    a.set(&[0], 2.9).unwrap();
    assert_eq!(a.get(&[0]).unwrap(), 2.0);
}

#[test]
fn test_release_only_last_handle() {
    let a = t(&[1.0, 2.0], &[2]);
    let b = a.clone();
    assert!(!a.release());
    assert!(b.release());
}

// Structural ops

#[test]
fn test_reshape_inferred_axis() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let r = a.reshape_spec(&[3, -1]).unwrap();
    assert_eq!(r.dims(), &[3, 2]);
    assert!(r.same_storage(&a));
    assert!(matches!(
        a.reshape_spec(&[-1, -1]),
        Err(Error::MultipleInferredAxes { .. })
    ));
    assert!(matches!(
        a.reshape_spec(&[4, -1]),
        Err(Error::InferredAxisNotDivisible { .. })
    ));
}

#[test]
fn test_reshape_of_transposed_copies() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let r = a.transpose(None).unwrap().reshape(&[6][..]).unwrap();
    assert_eq!(r.to_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}

#[test]
fn test_transpose_permutation() {
    let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
    let a = t(&data, &[2, 3, 4]);
    let p = a.transpose(Some(&[2, 0, 1])).unwrap();
    assert_eq!(p.dims(), &[4, 2, 3]);
    assert_eq!(p.get(&[3, 1, 2]).unwrap(), a.get(&[1, 2, 3]).unwrap());
}

#[test]
fn test_unsqueeze_squeeze_flatten() {
    let a = t(&[1.0, 2.0, 3.0], &[3]);
    let u = a.unsqueeze(&[0, -1]).unwrap();
    assert_eq!(u.dims(), &[1, 3, 1]);
    assert_eq!(u.squeeze(None).unwrap().dims(), &[3]);
    assert_eq!(u.squeeze(Some(&[0])).unwrap().dims(), &[3, 1]);
    assert!(u.squeeze(Some(&[1])).is_err());

    let b = CpuTensor::zeros(&[2, 3, 4][..], DType::F32, &DEV).unwrap();
    assert_eq!(b.flatten(1).unwrap().dims(), &[2, 12]);
    assert_eq!(b.flatten(0).unwrap().dims(), &[1, 24]);
    assert_eq!(b.flatten(3).unwrap().dims(), &[24, 1]);
}

#[test]
fn test_slice_negative_and_clamped() {
    let a = t(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[6]);
    let s = a.slice(&[-4], &[i64::MAX], None, None).unwrap();
    assert_eq!(s.to_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
    let s = a.slice(&[1], &[100], None, Some(&[2])).unwrap();
    assert_eq!(s.to_vec().unwrap(), vec![1.0, 3.0, 5.0]);
    let s = a.slice(&[-1], &[i64::MIN], None, Some(&[-2])).unwrap();
    assert_eq!(s.to_vec().unwrap(), vec![5.0, 3.0, 1.0]);
    let s = a.slice(&[4], &[2], None, None).unwrap();
    assert_eq!(s.elem_count(), 0);
}

#[test]
fn test_slice_on_axis() {
    let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let a = t(&data, &[3, 4]);
    let s = a.slice(&[1], &[3], Some(&[-1]), None).unwrap();
    assert_eq!(s.dims(), &[3, 2]);
    assert_eq!(s.to_vec().unwrap(), vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);
}

#[test]
fn test_expand_and_repeat() {
    let a = t(&[1.0, 2.0], &[2, 1]);
    let e = a.expand(&[2, 3][..]).unwrap();
    assert!(e.same_storage(&a));
    assert_eq!(e.to_vec().unwrap(), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);

    let b = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let r = b.repeat(&[1, 2]).unwrap();
    assert_eq!(r.dims(), &[2, 4]);
    assert_eq!(
        r.to_vec().unwrap(),
        vec![1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0]
    );
    let r = b.repeat(&[2, 1]).unwrap();
    assert_eq!(
        r.to_vec().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]
    );
}

#[test]
fn test_cat() {
    let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let b = t(&[5.0, 6.0], &[2, 1]);
    let c = CpuTensor::cat(&[&a, &b], 1).unwrap();
    assert_eq!(c.dims(), &[2, 3]);
    assert_eq!(c.to_vec().unwrap(), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    assert!(CpuTensor::cat(&[&a, &b], 0).is_err());
}

#[test]
fn test_pad_modes() {
    let a = t(&[1.0, 2.0, 3.0], &[3]);
    let c = a.pad(&[(2, 1)], PadMode::Constant, 0.0).unwrap();
    assert_eq!(c.to_vec().unwrap(), vec![0.0, 0.0, 1.0, 2.0, 3.0, 0.0]);
    let r = a.pad(&[(2, 2)], PadMode::Reflect, 0.0).unwrap();
    assert_eq!(r.to_vec().unwrap(), vec![3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]);
    let e = a.pad(&[(1, 2)], PadMode::Edge, 0.0).unwrap();
    assert_eq!(e.to_vec().unwrap(), vec![1.0, 1.0, 2.0, 3.0, 3.0, 3.0]);
    let crop = a.pad(&[(-1, 1)], PadMode::Constant, 7.0).unwrap();
    assert_eq!(crop.to_vec().unwrap(), vec![2.0, 3.0, 7.0]);
    assert!(a.pad(&[(3, 0)], PadMode::Reflect, 0.0).is_err());
}

#[test]
fn test_pad_2d_constant() {
    let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let p = a.pad(&[(1, 0), (0, 1)], PadMode::Constant, -1.0).unwrap();
    assert_eq!(p.dims(), &[3, 3]);
    assert_eq!(
        p.to_vec().unwrap(),
        vec![-1.0, -1.0, -1.0, 1.0, 2.0, -1.0, 3.0, 4.0, -1.0]
    );
}

#[test]
fn test_gather() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
    let idx = CpuTensor::from_vec(vec![0.0, 2.0, -1.0, 1.0], &[2, 2][..], DType::I64, &DEV)
        .unwrap();
    let g = a.gather(&idx, 0).unwrap();
    assert_eq!(g.dims(), &[2, 2, 2]);
    assert_eq!(
        g.to_vec().unwrap(),
        vec![1.0, 2.0, 5.0, 6.0, 5.0, 6.0, 3.0, 4.0]
    );
    let bad = CpuTensor::from_vec(vec![3.0], &[1][..], DType::I64, &DEV).unwrap();
    assert!(matches!(
        a.gather(&bad, 0),
        Err(Error::IndexOutOfBounds { .. })
    ));
}

// Math

#[test]
fn test_softmax_rows_sum_to_one() {
    let a = t(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3]);
    let s = a.softmax(-1).unwrap();
    let v = s.to_vec().unwrap();
    assert!((v[0] + v[1] + v[2] - 1.0).abs() < 1e-6);
    assert_close(&v[3..], &[1.0 / 3.0; 3]);
    assert!(v[2] > v[1] && v[1] > v[0]);
}

#[test]
fn test_reductions_keep_dims() {
    let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let s = a.reduce(ReduceOp::Sum, Some(&[0]), true).unwrap();
    assert_eq!(s.dims(), &[1, 2]);
    assert_eq!(s.to_vec().unwrap(), vec![4.0, 6.0]);
    let p = a.reduce(ReduceOp::Product, None, false).unwrap();
    assert_eq!(p.rank(), 0);
    assert_eq!(p.to_scalar().unwrap(), 24.0);
    let m = a.reduce(ReduceOp::Mean, Some(&[-1]), false).unwrap();
    assert_eq!(m.to_vec().unwrap(), vec![1.5, 3.5]);
    let l = a.reduce(ReduceOp::LogSumExp, Some(&[1]), false).unwrap();
    assert_close(
        &l.to_vec().unwrap(),
        &[(1f32.exp() + 2f32.exp()).ln(), (3f32.exp() + 4f32.exp()).ln()],
    );
}

#[test]
fn test_matmul_vector_promotion() {
    let m = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let v = t(&[1.0, 1.0], &[2]);
    let mv = m.matmul(&v).unwrap();
    assert_eq!(mv.dims(), &[2]);
    assert_eq!(mv.to_vec().unwrap(), vec![3.0, 7.0]);
    let vm = v.matmul(&m).unwrap();
    assert_eq!(vm.dims(), &[2]);
    assert_eq!(vm.to_vec().unwrap(), vec![4.0, 6.0]);
    let bad = t(&[1.0, 2.0, 3.0], &[3]);
    assert!(matches!(
        m.matmul(&bad),
        Err(Error::MatmulShapeMismatch { .. })
    ));
}

#[test]
fn test_gemm_transposes_and_bias() {
    let a = t(&[1.0, 3.0, 2.0, 4.0], &[2, 2]); // A^T = [[1, 2], [3, 4]]
    let b = t(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
    let c = t(&[1.0, 2.0], &[2]);
    let y = a.gemm(&b, Some(&c), 2.0, 0.5, true, false).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![2.5, 5.0, 6.5, 9.0]);
}

#[test]
fn test_unary_affine_clamp() {
    let a = t(&[-1.0, 0.0, 2.0], &[3]);
    assert_eq!(
        a.unary(UnaryOp::Relu).unwrap().to_vec().unwrap(),
        vec![0.0, 0.0, 2.0]
    );
    assert_eq!(a.affine(2.0, 1.0).unwrap().to_vec().unwrap(), vec![-1.0, 1.0, 5.0]);
    assert_eq!(a.clamp(-0.5, 1.0).unwrap().to_vec().unwrap(), vec![-0.5, 0.0, 1.0]);
}

#[test]
fn test_to_dtype_truncates() {
    let a = t(&[1.7, -1.7], &[2]);
    let i = a.to_dtype(DType::I64).unwrap();
    assert_eq!(i.dtype(), DType::I64);
    assert_eq!(i.to_vec().unwrap(), vec![1.0, -1.0]);
}

// Properties

proptest! {
    #[test]
    fn add_commutes_under_broadcast(
        rows in 1usize..4,
        cols in 1usize..4,
        seed in prop::collection::vec(-10.0f32..10.0, 16),
    ) {
        let a = t(&seed[..rows * cols], &[rows, cols]);
        let b = t(&seed[..cols], &[cols]);
        let ab = a.add(&b).unwrap().to_vec().unwrap();
        let ba = b.add(&a).unwrap().to_vec().unwrap();
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn reshape_round_trips(
        dims in prop::collection::vec(1usize..4, 1..4),
        flat_first in any::<bool>(),
    ) {
        let count: usize = dims.iter().product();
        let data: Vec<f32> = (0..count).map(|v| v as f32).collect();
        let a = t(&data, &dims);
        let other: Vec<usize> = if flat_first { vec![count] } else { dims.iter().rev().copied().collect() };
        let back = a.reshape(other).unwrap().reshape(dims.clone()).unwrap();
        prop_assert_eq!(back.dims(), &dims[..]);
        prop_assert_eq!(back.to_vec().unwrap(), data);
    }
}
