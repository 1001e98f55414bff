use std::sync::Arc;

use nnir::ops::{BinaryOp, OpKind, TransposeSpec};
use nnir::{DType, Graph, Runtime, Shape};
use nnir_runtime_cpu::CpuRuntime;

fn runtime() -> Arc<dyn Runtime> {
    Arc::new(CpuRuntime::new())
}

#[test]
fn matmul_broadcasts_batch_dimensions() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([4, 1, 5, 6], DType::F32);
    let b = graph.add_tensor([1, 7, 6, 3], DType::F32);
    let (_, c) = graph.matmul(a, b, false, false).unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[4, 7, 5, 3]);
}

#[test]
fn matmul_transpose_flags_swap_contraction_axes() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([4, 6], DType::F32);
    let b = graph.add_tensor([3, 6], DType::F32);
    let (_, c) = graph.matmul(a, b, false, true).unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[4, 3]);
}

#[test]
fn matmul_contraction_mismatch_is_an_error() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([2, 3], DType::F32);
    let b = graph.add_tensor([4, 5], DType::F32);
    assert!(graph.matmul(a, b, false, false).is_err());
}

#[test]
fn matmul_requires_rank_two_operands() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([3], DType::F32);
    let b = graph.add_tensor([3, 2], DType::F32);
    assert!(graph.matmul(a, b, false, false).is_err());
}

#[test]
fn shape_infer_overwrites_stale_output_shapes() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3, 4], DType::F32);
    // Declare the output with a placeholder shape.
    let y = graph.add_tensor([1], DType::F32);
    graph
        .add_operator(
            OpKind::Transpose(TransposeSpec {
                perm: vec![2, 0, 1],
            }),
            vec![x],
            vec![y],
        )
        .unwrap();

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(y).unwrap().shape().dims(), &[4, 2, 3]);
}

#[test]
fn shape_infer_is_idempotent() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([2, 1, 5, 6], DType::F32);
    let b = graph.add_tensor([3, 6, 4], DType::F32);
    let (_, c) = graph.matmul(a, b, false, false).unwrap();
    let w = graph.add_tensor([4], DType::F32);
    graph.elementwise(BinaryOp::Add, c, w).unwrap();

    graph.shape_infer().unwrap();
    let first: Vec<Shape> = graph.tensors().map(|t| t.shape().clone()).collect();
    graph.shape_infer().unwrap();
    let second: Vec<Shape> = graph.tensors().map(|t| t.shape().clone()).collect();
    assert_eq!(first, second);
}

#[test]
fn concat_sums_the_negative_axis() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([2, 3], DType::F32);
    let b = graph.add_tensor([2, 5], DType::F32);
    let (_, c) = graph.concat(vec![a, b], -1).unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[2, 8]);
}

#[test]
fn concat_rejects_disagreement_outside_the_axis() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([2, 3], DType::F32);
    let b = graph.add_tensor([2, 4], DType::F32);
    assert!(graph.concat(vec![a, b], 0).is_err());
}

#[test]
fn concat_axis_out_of_range_is_an_error() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([2, 3], DType::F32);
    let b = graph.add_tensor([2, 3], DType::F32);
    assert!(graph.concat(vec![a, b], 2).is_err());
    assert!(graph.concat(vec![a, b], -3).is_err());
}

#[test]
fn elementwise_broadcasts_right_aligned() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([4, 1, 3], DType::F32);
    let b = graph.add_tensor([2, 1], DType::F32);
    let (_, c) = graph.elementwise(BinaryOp::Mul, a, b).unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[4, 2, 3]);
}

#[test]
fn elementwise_scalar_broadcasts_to_the_other_operand() {
    let mut graph = Graph::new(runtime());
    let scalar = graph.add_tensor(Shape::scalar(), DType::F32);
    let m = graph.add_tensor([2, 3], DType::F32);
    let (_, c) = graph.elementwise(BinaryOp::Add, scalar, m).unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[2, 3]);
}

#[test]
fn incompatible_broadcast_is_an_error() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([2, 3], DType::F32);
    let b = graph.add_tensor([4, 3], DType::F32);
    assert!(graph.elementwise(BinaryOp::Add, a, b).is_err());
}

#[test]
fn invalid_permutation_is_an_error() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3], DType::F32);
    assert!(graph.transpose(x, vec![0, 0]).is_err());
    assert!(graph.transpose(x, vec![0]).is_err());
    assert!(graph.transpose(x, vec![0, 2]).is_err());
}
