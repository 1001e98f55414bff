use std::sync::Arc;

use nnir::ops::{BinaryOp, OpKind};
use nnir::{DType, Graph, Runtime, TensorId};
use nnir_runtime_cpu::CpuRuntime;

fn runtime() -> Arc<dyn Runtime> {
    Arc::new(CpuRuntime::new())
}

fn transpose_count(graph: &Graph) -> usize {
    graph
        .operators()
        .filter(|op| matches!(op.kind(), OpKind::Transpose(_)))
        .count()
}

fn connectivity(graph: &Graph) -> Vec<(String, Vec<TensorId>, Vec<TensorId>)> {
    graph
        .operators()
        .map(|op| {
            (
                op.descriptor(),
                op.inputs().to_vec(),
                op.outputs().to_vec(),
            )
        })
        .collect()
}

#[test]
fn inverse_transpose_pair_is_spliced_out() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3, 4], DType::F32);
    let (_, y) = graph.transpose(x, vec![2, 0, 1]).unwrap();
    let (_, z) = graph.transpose(y, vec![1, 2, 0]).unwrap();
    let w = graph.add_tensor([2, 3, 4], DType::F32);
    let (add_op, _) = graph.elementwise(BinaryOp::Add, z, w).unwrap();
    assert_eq!(transpose_count(&graph), 2);

    let stats = graph.optimize().unwrap();
    assert!(stats.changed);
    assert_eq!(stats.rewrites_applied, 1);

    assert_eq!(transpose_count(&graph), 0);
    let add = graph.operator(add_op).unwrap();
    assert_eq!(add.inputs(), &[x, w]);
    assert_eq!(graph.tensor(x).unwrap().targets(), &[add_op]);
    assert!(graph.tensor(y).is_none());
    assert!(graph.tensor(z).is_none());
    graph.check_valid().unwrap();
}

#[test]
fn non_inverse_transpose_pair_is_kept() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3, 4], DType::F32);
    let (_, y) = graph.transpose(x, vec![1, 0, 2]).unwrap();
    graph.transpose(y, vec![2, 1, 0]).unwrap();

    graph.optimize().unwrap();
    assert_eq!(transpose_count(&graph), 2);
    graph.check_valid().unwrap();
}

#[test]
fn shared_intermediate_blocks_elimination() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3, 4], DType::F32);
    let (_, y) = graph.transpose(x, vec![2, 0, 1]).unwrap();
    graph.transpose(y, vec![1, 2, 0]).unwrap();
    // Second consumer of the intermediate tensor.
    let w = graph.add_tensor([4, 2, 3], DType::F32);
    graph.elementwise(BinaryOp::Add, y, w).unwrap();

    graph.optimize().unwrap();
    assert_eq!(transpose_count(&graph), 2);
    graph.check_valid().unwrap();
}

#[test]
fn dangling_pair_on_a_graph_input_is_left_alone() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3, 4], DType::F32);
    let (_, y) = graph.transpose(x, vec![2, 0, 1]).unwrap();
    graph.transpose(y, vec![1, 2, 0]).unwrap();

    // Splicing would leave `x` with neither source nor targets.
    let stats = graph.optimize().unwrap();
    assert!(!stats.changed);
    assert_eq!(stats.rewrites_applied, 0);
    assert_eq!(transpose_count(&graph), 2);
    graph.check_valid().unwrap();
}

#[test]
fn produced_input_pair_is_spliced_even_without_consumers() {
    let mut graph = Graph::new(runtime());
    let w1 = graph.add_tensor([2, 3, 4], DType::F32);
    let w2 = graph.add_tensor([2, 3, 4], DType::F32);
    let (add_op, x) = graph.elementwise(BinaryOp::Add, w1, w2).unwrap();
    let (_, y) = graph.transpose(x, vec![2, 0, 1]).unwrap();
    let (_, z) = graph.transpose(y, vec![1, 2, 0]).unwrap();

    graph.optimize().unwrap();

    assert_eq!(transpose_count(&graph), 0);
    assert_eq!(graph.operator_ids(), &[add_op]);
    assert!(graph.tensor(y).is_none());
    assert!(graph.tensor(z).is_none());
    // `x` became a graph output.
    assert_eq!(graph.outputs(), vec![x]);
    graph.check_valid().unwrap();
}

#[test]
fn transpose_fuses_into_matmul_right_operand() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([4, 6], DType::F32);
    let b0 = graph.add_tensor([3, 6], DType::F32);
    let (t_op, b) = graph.transpose(b0, vec![1, 0]).unwrap();
    let (mm, c) = graph.matmul(a, b, false, false).unwrap();

    graph.optimize().unwrap();

    assert_eq!(graph.operator_ids().len(), 1);
    let fused = graph.operators().next().unwrap();
    let fused_guid = fused.guid();
    assert!(matches!(
        fused.kind(),
        OpKind::MatMul(spec) if !spec.trans_a && spec.trans_b
    ));
    assert_eq!(fused.inputs(), &[a, b0]);
    assert_eq!(fused.outputs(), &[c]);
    assert!(graph.operator(t_op).is_none());
    assert!(graph.operator(mm).is_none());
    assert!(graph.tensor(b).is_none());
    assert_eq!(graph.tensor(c).unwrap().source(), Some(fused_guid));
    graph.check_valid().unwrap();

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[4, 3]);
}

#[test]
fn transpose_fuses_into_matmul_left_operand() {
    let mut graph = Graph::new(runtime());
    let a0 = graph.add_tensor([2, 6, 4], DType::F32);
    let (_, a) = graph.transpose(a0, vec![0, 2, 1]).unwrap();
    let b = graph.add_tensor([2, 6, 3], DType::F32);
    let (_, c) = graph.matmul(a, b, false, false).unwrap();

    graph.optimize().unwrap();

    assert_eq!(graph.operator_ids().len(), 1);
    let fused = graph.operators().next().unwrap();
    assert!(matches!(
        fused.kind(),
        OpKind::MatMul(spec) if spec.trans_a && !spec.trans_b
    ));
    assert_eq!(fused.inputs(), &[a0, b]);
    assert!(graph.tensor(a).is_none());
    graph.check_valid().unwrap();

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[2, 4, 3]);
}

#[test]
fn shared_transpose_survives_matmul_fusion() {
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([4, 6], DType::F32);
    let b0 = graph.add_tensor([3, 6], DType::F32);
    let (t_op, b) = graph.transpose(b0, vec![1, 0]).unwrap();
    let other = graph.add_tensor([6, 3], DType::F32);
    let (keep_op, _) = graph.elementwise(BinaryOp::Add, b, other).unwrap();
    graph.matmul(a, b, false, false).unwrap();

    graph.optimize().unwrap();

    assert_eq!(graph.operator_ids().len(), 3);
    assert!(graph.operator(t_op).is_some());
    assert_eq!(graph.tensor(b).unwrap().targets(), &[keep_op]);
    let fused = graph
        .operators()
        .find(|op| matches!(op.kind(), OpKind::MatMul(_)))
        .unwrap();
    assert_eq!(fused.inputs(), &[a, b0]);
    assert!(matches!(
        fused.kind(),
        OpKind::MatMul(spec) if spec.trans_b
    ));
    graph.check_valid().unwrap();
}

#[test]
fn transpose_chain_feeding_matmul_collapses_to_its_base() {
    let mut graph = Graph::new(runtime());
    let a0 = graph.add_tensor([4, 6], DType::F32);
    let (_, a1) = graph.transpose(a0, vec![1, 0]).unwrap();
    let (_, a2) = graph.transpose(a1, vec![1, 0]).unwrap();
    let b = graph.add_tensor([6, 3], DType::F32);
    let (_, c) = graph.matmul(a2, b, false, false).unwrap();

    graph.optimize().unwrap();

    // The inverse pair cancels before fusion sees anything.
    assert_eq!(graph.operator_ids().len(), 1);
    let fused = graph.operators().next().unwrap();
    assert!(matches!(
        fused.kind(),
        OpKind::MatMul(spec) if !spec.trans_a && !spec.trans_b
    ));
    assert_eq!(fused.inputs(), &[a0, b]);
    graph.check_valid().unwrap();

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[4, 3]);
}

#[test]
fn optimize_is_idempotent() {
    let mut graph = Graph::new(runtime());
    let x = graph.add_tensor([2, 3, 4], DType::F32);
    let (_, y) = graph.transpose(x, vec![2, 0, 1]).unwrap();
    let (_, z) = graph.transpose(y, vec![1, 2, 0]).unwrap();
    let b0 = graph.add_tensor([2, 5, 4], DType::F32);
    let (_, b) = graph.transpose(b0, vec![0, 2, 1]).unwrap();
    graph.matmul(z, b, false, false).unwrap();

    let stats = graph.optimize().unwrap();
    assert!(stats.changed);
    let first = connectivity(&graph);

    let rerun = graph.optimize().unwrap();
    assert!(!rerun.changed);
    assert_eq!(rerun.rewrites_applied, 0);
    let second = connectivity(&graph);
    assert_eq!(first, second);
    graph.check_valid().unwrap();
}

#[test]
fn fusion_flags_round_trip_through_existing_flags() {
    // A matmul that already has trans_b set gets the flag flipped back off.
    let mut graph = Graph::new(runtime());
    let a = graph.add_tensor([4, 6], DType::F32);
    let b0 = graph.add_tensor([6, 3], DType::F32);
    let (_, b) = graph.transpose(b0, vec![1, 0]).unwrap();
    let (_, c) = graph.matmul(a, b, false, true).unwrap();

    graph.optimize().unwrap();

    let fused = graph.operators().next().unwrap();
    assert!(matches!(
        fused.kind(),
        OpKind::MatMul(spec) if !spec.trans_a && !spec.trans_b
    ));
    assert_eq!(fused.inputs(), &[a, b0]);
    graph.check_valid().unwrap();

    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(c).unwrap().shape().dims(), &[4, 3]);
}
