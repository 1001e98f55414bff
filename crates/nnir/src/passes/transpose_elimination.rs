//! Splices out adjacent transpose pairs whose permutations cancel.

use anyhow::Result;

use crate::graph::{Graph, OperatorId, TensorId};
use crate::ops::OpKind;

use super::{GraphPass, PassResult};

fn is_identity_perm(perm: &[usize]) -> bool {
    perm.iter().copied().eq(0..perm.len())
}

/// Composes two permutations as `r[i] = second[first[i]]`.
fn compose_perms(first: &[usize], second: &[usize]) -> Option<Vec<usize>> {
    if first.len() != second.len() {
        return None;
    }
    let mut composed = Vec::with_capacity(first.len());
    for &axis in first {
        if axis >= second.len() {
            return None;
        }
        composed.push(second[axis]);
    }
    Some(composed)
}

struct InversePair {
    first: OperatorId,
    second: OperatorId,
    /// Input of the first transpose; inherits the pair's consumers.
    input: TensorId,
    /// Intermediate tensor between the two transposes.
    mid: TensorId,
    /// Output of the second transpose.
    output: TensorId,
}

/// Removes `transpose(transpose(x, p), q)` pairs where `q` inverts `p`,
/// reconnecting every consumer of the pair's output to `x`.
pub struct InverseTransposeElimination;

impl GraphPass for InverseTransposeElimination {
    fn name(&self) -> &'static str {
        "inverse-transpose-elimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let mut result = PassResult::default();
        // Restart the scan after every splice: removals may expose new pairs.
        loop {
            let mut spliced = false;
            for guid in graph.operator_ids().to_vec() {
                let Some(pair) = match_inverse_pair(graph, guid) else {
                    continue;
                };
                splice(graph, pair)?;
                result.changed = true;
                result.rewrites_applied += 1;
                spliced = true;
                break;
            }
            if !spliced {
                return Ok(result);
            }
        }
    }
}

fn match_inverse_pair(graph: &Graph, guid: OperatorId) -> Option<InversePair> {
    let op = graph.operator(guid)?;
    let OpKind::Transpose(first_spec) = op.kind() else {
        return None;
    };
    let [input] = op.inputs() else { return None };
    let [mid] = op.outputs() else { return None };
    let (input, mid) = (*input, *mid);

    let [second] = graph.tensor(mid)?.targets() else {
        return None;
    };
    let second = *second;
    if second == guid {
        return None;
    }
    let second_op = graph.operator(second)?;
    let OpKind::Transpose(second_spec) = second_op.kind() else {
        return None;
    };
    let [output] = second_op.outputs() else {
        return None;
    };
    let output = *output;

    let composed = compose_perms(&first_spec.perm, &second_spec.perm)?;
    if !is_identity_perm(&composed) {
        return None;
    }

    // Splicing must not orphan `input`: with no producer and no consumers to
    // inherit, it would be left dangling.
    let input_tensor = graph.tensor(input)?;
    if graph.tensor(output)?.targets().is_empty()
        && input_tensor.source().is_none()
        && input_tensor.targets().len() == 1
    {
        return None;
    }

    Some(InversePair {
        first: guid,
        second,
        input,
        mid,
        output,
    })
}

fn splice(graph: &mut Graph, pair: InversePair) -> Result<()> {
    graph.redirect_consumers(pair.output, pair.input);
    graph.remove_operator(pair.second)?;
    graph.remove_operator(pair.first)?;
    graph.remove_tensor(pair.mid)?;
    graph.remove_tensor(pair.output)?;
    Ok(())
}
