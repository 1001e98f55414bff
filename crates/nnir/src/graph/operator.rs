//! Operator records owned by a [`Graph`](super::Graph).

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ops::OpKind;

use super::TensorId;

/// Unique identifier of an operator within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(pub u32);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static GUID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A computation node: kind, ordered operand lists and neighbor links.
///
/// `predecessors`/`successors` are derived from the tensor links and kept
/// deduplicated in first-encounter order; [`Graph`](super::Graph) mutations
/// re-establish them after every structural change.
#[derive(Debug, Clone)]
pub struct Operator {
    guid: OperatorId,
    kind: OpKind,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    predecessors: Vec<OperatorId>,
    successors: Vec<OperatorId>,
}

impl Operator {
    pub(super) fn new(kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Operator {
            guid: OperatorId(GUID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            kind,
            inputs,
            outputs,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn guid(&self) -> OperatorId {
        self.guid
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn predecessors(&self) -> &[OperatorId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[OperatorId] {
        &self.successors
    }

    /// Kind-specific one-line descriptor used in graph diagnostics.
    pub fn descriptor(&self) -> String {
        let ids = |ids: &[TensorId]| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        match &self.kind {
            OpKind::MatMul(spec) => format!(
                "Matmul([{},{}], A={}, B={}, C={})",
                if spec.trans_a { "A^T" } else { "A" },
                if spec.trans_b { "B^T" } else { "B" },
                self.inputs[0],
                self.inputs[1],
                ids(&self.outputs),
            ),
            OpKind::Transpose(spec) => format!(
                "Transpose(perm={:?}, in={}, out={})",
                spec.perm,
                ids(&self.inputs),
                ids(&self.outputs),
            ),
            OpKind::Concat(spec) => format!(
                "Concat(axis={}, in=[{}], out={})",
                spec.axis,
                ids(&self.inputs),
                ids(&self.outputs),
            ),
            OpKind::Elementwise(spec) => format!(
                "{:?}(in=[{}], out={})",
                spec.op,
                ids(&self.inputs),
                ids(&self.outputs),
            ),
        }
    }

    pub(super) fn add_predecessor(&mut self, guid: OperatorId) {
        if !self.predecessors.contains(&guid) {
            self.predecessors.push(guid);
        }
    }

    pub(super) fn add_successor(&mut self, guid: OperatorId) {
        if !self.successors.contains(&guid) {
            self.successors.push(guid);
        }
    }

    pub(super) fn remove_predecessor(&mut self, guid: OperatorId) {
        self.predecessors.retain(|g| *g != guid);
    }

    pub(super) fn remove_successor(&mut self, guid: OperatorId) {
        self.successors.retain(|g| *g != guid);
    }

    pub(super) fn set_links(&mut self, predecessors: Vec<OperatorId>, successors: Vec<OperatorId>) {
        self.predecessors = predecessors;
        self.successors = successors;
    }

    /// Rewrites every occurrence of `from` among the inputs to `to`.
    pub(super) fn replace_input(&mut self, from: TensorId, to: TensorId) {
        for input in &mut self.inputs {
            if *input == from {
                *input = to;
            }
        }
    }
}
