//! Folds last-two-axis transposes into matmul transpose flags.

use anyhow::Result;

use crate::graph::{Graph, OperatorId, TensorId};
use crate::ops::{MatMulSpec, OpKind};

use super::{GraphPass, PassResult};

/// A permutation that fixes every axis except it swaps the final two.
fn swaps_last_two(perm: &[usize]) -> bool {
    let rank = perm.len();
    if rank < 2 {
        return false;
    }
    perm[..rank - 2].iter().copied().eq(0..rank - 2)
        && perm[rank - 2] == rank - 1
        && perm[rank - 1] == rank - 2
}

struct Fusion {
    matmul: OperatorId,
    transpose: OperatorId,
    /// The matmul input fed by the transpose.
    transposed: TensorId,
    /// The transpose's own input, read directly after fusion.
    base: TensorId,
    /// The untouched matmul input.
    other: TensorId,
    output: TensorId,
    spec: MatMulSpec,
    /// Which flag flips: `trans_a` when true, `trans_b` otherwise.
    lhs: bool,
}

/// Replaces `matmul(transpose(x), y)` with `matmul(x, y)` and a flipped
/// `trans_a` (symmetrically for the right operand and `trans_b`).
///
/// Only one side is fused per rewrite; running to fixpoint handles the other
/// side with a fresh, locally verifiable rewrite. A transpose feeding other
/// consumers as well is kept; only the edge into this matmul changes.
pub struct TransposeMatMulFusion;

impl GraphPass for TransposeMatMulFusion {
    fn name(&self) -> &'static str {
        "transpose-matmul-fusion"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let mut result = PassResult::default();
        for guid in graph.operator_ids().to_vec() {
            let Some(fusion) = match_fusion(graph, guid) else {
                continue;
            };
            apply(graph, fusion)?;
            result.changed = true;
            result.rewrites_applied += 1;
        }
        Ok(result)
    }
}

fn match_fusion(graph: &Graph, guid: OperatorId) -> Option<Fusion> {
    let op = graph.operator(guid)?;
    let OpKind::MatMul(spec) = op.kind() else {
        return None;
    };
    let spec = *spec;
    let [a, b] = op.inputs() else { return None };
    let [output] = op.outputs() else { return None };
    let (a, b, output) = (*a, *b, *output);

    if let Some((transpose, base)) = last_two_transpose_source(graph, a) {
        return Some(Fusion {
            matmul: guid,
            transpose,
            transposed: a,
            base,
            other: b,
            output,
            spec,
            lhs: true,
        });
    }
    if let Some((transpose, base)) = last_two_transpose_source(graph, b) {
        return Some(Fusion {
            matmul: guid,
            transpose,
            transposed: b,
            base,
            other: a,
            output,
            spec,
            lhs: false,
        });
    }
    None
}

/// If `tensor` is produced by a last-two-axis transpose, returns that
/// operator and its input.
fn last_two_transpose_source(graph: &Graph, tensor: TensorId) -> Option<(OperatorId, TensorId)> {
    let source = graph.tensor(tensor)?.source()?;
    let op = graph.operator(source)?;
    let OpKind::Transpose(spec) = op.kind() else {
        return None;
    };
    if !swaps_last_two(&spec.perm) {
        return None;
    }
    let [base] = op.inputs() else { return None };
    Some((source, *base))
}

fn apply(graph: &mut Graph, fusion: Fusion) -> Result<()> {
    let (inputs, spec) = if fusion.lhs {
        (
            vec![fusion.base, fusion.other],
            MatMulSpec {
                trans_a: !fusion.spec.trans_a,
                trans_b: fusion.spec.trans_b,
            },
        )
    } else {
        (
            vec![fusion.other, fusion.base],
            MatMulSpec {
                trans_a: fusion.spec.trans_a,
                trans_b: !fusion.spec.trans_b,
            },
        )
    };
    graph.replace_operator(
        fusion.matmul,
        OpKind::MatMul(spec),
        inputs,
        vec![fusion.output],
    )?;

    // Drop the transpose when this matmul was its only reader.
    let orphaned = graph
        .tensor(fusion.transposed)
        .is_some_and(|t| t.targets().is_empty());
    if orphaned {
        graph.remove_operator(fusion.transpose)?;
        graph.remove_tensor(fusion.transposed)?;
    }
    Ok(())
}
