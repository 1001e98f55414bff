//! Dataflow graph: ownership of tensors and operators, connectivity
//! invariants, topological sorting, shape inference and memory planning.
//!
//! The graph is the single owner of every record; all cross-links between
//! tensors and operators are identifiers resolved through it. Each public
//! mutation leaves the graph in a state where [`Graph::check_valid`] holds.

mod allocator;
mod operator;
mod tensor;

pub use allocator::{Allocator, AllocatorInfo};
pub use operator::{Operator, OperatorId};
pub use tensor::{Storage, Tensor, TensorId};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use tracing::debug;

use crate::ops::shape_helpers::normalize_axis;
use crate::ops::{BinaryOp, ConcatSpec, ElementwiseSpec, MatMulSpec, OpKind, TransposeSpec};
use crate::passes::{default_passes, PassResult};
use crate::runtime::Runtime;
use crate::tensor::{DType, Shape};

/// A dataflow graph bound to one runtime, owning its tensors and operators.
#[derive(Debug)]
pub struct Graph {
    runtime: Arc<dyn Runtime>,
    tensors: HashMap<TensorId, Tensor>,
    tensor_order: Vec<TensorId>,
    ops: HashMap<OperatorId, Operator>,
    op_order: Vec<OperatorId>,
    sorted: bool,
    allocator: Allocator,
}

impl Graph {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Graph {
            allocator: Allocator::new(Arc::clone(&runtime)),
            runtime,
            tensors: HashMap::new(),
            tensor_order: Vec::new(),
            ops: HashMap::new(),
            op_order: Vec::new(),
            sorted: false,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Whether the operator list is currently in topological order.
    pub fn sorted(&self) -> bool {
        self.sorted
    }

    /// Creates a fresh tensor in this graph and returns its id.
    pub fn add_tensor(&mut self, shape: impl Into<Shape>, dtype: DType) -> TensorId {
        let tensor = Tensor::new(shape.into(), dtype, Arc::clone(&self.runtime));
        let id = tensor.fuid();
        self.tensor_order.push(id);
        self.tensors.insert(id, tensor);
        id
    }

    /// Adopts an externally constructed tensor into this graph.
    pub fn adopt_tensor(&mut self, tensor: Tensor) -> Result<TensorId> {
        ensure!(
            Arc::ptr_eq(tensor.runtime(), &self.runtime),
            "tensor {} lives on runtime {} and cannot join a graph on {}",
            tensor.fuid(),
            tensor.runtime().device(),
            self.runtime.device()
        );
        let id = tensor.fuid();
        ensure!(
            !self.tensors.contains_key(&id),
            "tensor {id} is already part of this graph"
        );
        self.tensor_order.push(id);
        self.tensors.insert(id, tensor);
        Ok(id)
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(&id)
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.ops.get(&id)
    }

    /// Tensor ids in insertion order; this order drives memory planning.
    pub fn tensor_ids(&self) -> &[TensorId] {
        &self.tensor_order
    }

    /// Operator ids in list order (topological after a successful sort).
    pub fn operator_ids(&self) -> &[OperatorId] {
        &self.op_order
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> + '_ {
        self.tensor_order.iter().map(|id| &self.tensors[id])
    }

    pub fn operators(&self) -> impl Iterator<Item = &Operator> + '_ {
        self.op_order.iter().map(|id| &self.ops[id])
    }

    /// Graph inputs: tensors with no producing operator.
    pub fn inputs(&self) -> Vec<TensorId> {
        self.tensors()
            .filter(|t| t.source().is_none())
            .map(|t| t.fuid())
            .collect()
    }

    /// Graph outputs: tensors with no consumers.
    pub fn outputs(&self) -> Vec<TensorId> {
        self.tensors()
            .filter(|t| t.targets().is_empty())
            .map(|t| t.fuid())
            .collect()
    }

    /// Adds an operator over pre-declared tensors and cross-links it.
    ///
    /// Declared outputs must not already have a producer; every referenced
    /// tensor must belong to this graph.
    pub fn add_operator(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OperatorId> {
        for id in inputs.iter().chain(outputs.iter()) {
            ensure!(
                self.tensors.contains_key(id),
                "tensor {id} is not owned by this graph"
            );
        }
        if let Some(expected) = kind.arity() {
            ensure!(
                inputs.len() == expected,
                "{} expects {} inputs, got {}",
                kind.name(),
                expected,
                inputs.len()
            );
        }
        for id in &outputs {
            ensure!(
                self.tensors[id].source().is_none(),
                "tensor {id} already has a producing operator"
            );
        }

        let op = Operator::new(kind, inputs, outputs);
        let guid = op.guid();
        self.ops.insert(guid, op);
        self.op_order.push(guid);
        self.connect(guid);
        self.sorted = false;
        Ok(guid)
    }

    /// Builds a matmul, creating its output tensor via shape inference.
    pub fn matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<(OperatorId, TensorId)> {
        let kind = OpKind::MatMul(MatMulSpec { trans_a, trans_b });
        let output = self.infer_new_output(&kind, &[a, b])?;
        let guid = self.add_operator(kind, vec![a, b], vec![output])?;
        Ok((guid, output))
    }

    /// Builds a transpose, creating its output tensor via shape inference.
    pub fn transpose(
        &mut self,
        input: TensorId,
        perm: Vec<usize>,
    ) -> Result<(OperatorId, TensorId)> {
        let kind = OpKind::Transpose(TransposeSpec { perm });
        let output = self.infer_new_output(&kind, &[input])?;
        let guid = self.add_operator(kind, vec![input], vec![output])?;
        Ok((guid, output))
    }

    /// Builds a concat along `axis` (negative axes count from the back).
    pub fn concat(&mut self, inputs: Vec<TensorId>, axis: i64) -> Result<(OperatorId, TensorId)> {
        ensure!(!inputs.is_empty(), "concat requires at least one input");
        let first = inputs[0];
        ensure!(
            self.tensors.contains_key(&first),
            "tensor {first} is not owned by this graph"
        );
        let axis = normalize_axis(axis, self.tensors[&first].rank())?;
        let kind = OpKind::Concat(ConcatSpec { axis });
        let output = self.infer_new_output(&kind, &inputs)?;
        let guid = self.add_operator(kind, inputs, vec![output])?;
        Ok((guid, output))
    }

    /// Builds a broadcasting elementwise binary operator.
    pub fn elementwise(
        &mut self,
        op: BinaryOp,
        a: TensorId,
        b: TensorId,
    ) -> Result<(OperatorId, TensorId)> {
        let kind = OpKind::Elementwise(ElementwiseSpec { op });
        let output = self.infer_new_output(&kind, &[a, b])?;
        let guid = self.add_operator(kind, vec![a, b], vec![output])?;
        Ok((guid, output))
    }

    /// Removes an operator, detaching it from tensors and neighbor links.
    ///
    /// Output tensors lose their producer; the caller is responsible for
    /// removing tensors this orphans.
    pub fn remove_operator(&mut self, guid: OperatorId) -> Result<()> {
        let Some(op) = self.ops.remove(&guid) else {
            bail!("operator {guid} is not part of this graph");
        };
        self.op_order.retain(|g| *g != guid);
        for id in op.inputs() {
            if let Some(tensor) = self.tensors.get_mut(id) {
                tensor.remove_target(guid);
            }
        }
        for id in op.outputs() {
            if let Some(tensor) = self.tensors.get_mut(id) {
                tensor.clear_source_if(guid);
            }
        }
        for pred in op.predecessors() {
            if let Some(pred) = self.ops.get_mut(pred) {
                pred.remove_successor(guid);
            }
        }
        for succ in op.successors() {
            if let Some(succ) = self.ops.get_mut(succ) {
                succ.remove_predecessor(guid);
            }
        }
        self.sorted = false;
        Ok(())
    }

    /// Removes a tensor record. Links held by operators are not touched; the
    /// caller must have detached them first.
    pub fn remove_tensor(&mut self, id: TensorId) -> Result<()> {
        ensure!(
            self.tensors.remove(&id).is_some(),
            "tensor {id} is not part of this graph"
        );
        self.tensor_order.retain(|t| *t != id);
        Ok(())
    }

    /// Rearranges the operator list into topological order.
    ///
    /// Kahn-style fixpoint: repeatedly emit operators whose inputs are all
    /// graph inputs or produced by already-emitted operators, scanning in list
    /// order so the result is stable. On a cycle the list is left untouched.
    pub fn topo_sort(&mut self) -> Result<()> {
        if self.sorted {
            return Ok(());
        }
        let total = self.op_order.len();
        let mut emitted: Vec<OperatorId> = Vec::with_capacity(total);
        let mut done: HashSet<OperatorId> = HashSet::with_capacity(total);
        while emitted.len() < total {
            let mut modified = false;
            for &guid in &self.op_order {
                if done.contains(&guid) {
                    continue;
                }
                let ready = self.ops[&guid].inputs().iter().all(|id| {
                    match self.tensors[id].source() {
                        None => true,
                        Some(source) => done.contains(&source),
                    }
                });
                if ready {
                    emitted.push(guid);
                    done.insert(guid);
                    modified = true;
                }
            }
            if !modified {
                bail!("graph contains a cycle; topological sort failed");
            }
        }
        self.op_order = emitted;
        self.sorted = true;
        Ok(())
    }

    /// Propagates shapes through the graph in topological order.
    ///
    /// Each operator's kind-specific inference runs on the current input
    /// shapes; outputs whose recorded shape differs are overwritten.
    pub fn shape_infer(&mut self) -> Result<()> {
        self.topo_sort()?;
        for guid in self.op_order.clone() {
            let (kind, input_ids, output_ids) = {
                let op = &self.ops[&guid];
                (op.kind().clone(), op.inputs().to_vec(), op.outputs().to_vec())
            };
            let input_shapes = input_ids
                .iter()
                .map(|id| self.tensors[id].shape().clone())
                .collect::<Vec<_>>();
            let inferred = kind.infer_shape(&input_shapes)?;
            ensure!(
                inferred.len() == output_ids.len(),
                "operator {} inferred {} shapes for {} outputs",
                guid,
                inferred.len(),
                output_ids.len()
            );
            for (id, shape) in output_ids.iter().zip(inferred) {
                let tensor = self.tensor_mut(*id);
                if tensor.shape() != &shape {
                    tensor.set_shape(shape);
                }
            }
        }
        Ok(())
    }

    /// Runs the registered rewrite passes until none reports a change and
    /// returns the accumulated statistics.
    pub fn optimize(&mut self) -> Result<PassResult> {
        let passes = default_passes();
        let mut totals = PassResult::default();
        loop {
            let mut iteration = PassResult::default();
            for pass in &passes {
                let result = pass.run(self)?;
                if result.changed {
                    debug!(
                        pass = pass.name(),
                        rewrites = result.rewrites_applied,
                        "rewrite pass applied"
                    );
                }
                iteration = iteration.merge(result);
            }
            totals = totals.merge(iteration);
            if !iteration.changed {
                return Ok(totals);
            }
        }
    }

    /// Plans arena offsets for every tensor, commits the device buffer once
    /// and binds each tensor's storage.
    ///
    /// May be called at most once per graph; the arena layout is frozen
    /// afterwards. An empty graph commits a zero-byte arena.
    pub fn data_malloc(&mut self) -> Result<()> {
        ensure!(
            !self.allocator.committed(),
            "memory was already planned for this graph"
        );
        self.topo_sort()?;

        let order = self.tensor_order.clone();
        let mut offsets = Vec::with_capacity(order.len());
        for id in &order {
            let bytes = self.tensors[id].bytes();
            offsets.push(self.allocator.alloc(bytes));
        }

        // The single device acquisition of `peak` bytes.
        self.allocator.get_ptr()?;
        for (id, offset) in order.iter().zip(offsets) {
            let bytes = self.tensors[id].bytes();
            self.tensor_mut(*id).bind_storage(Storage { offset, bytes });
        }

        let info = self.allocator.info();
        debug!(used = info.used, peak = info.peak, "tensor arena planned");
        Ok(())
    }

    /// Resolves a tensor's planned storage to a device pointer.
    ///
    /// `None` until [`Graph::data_malloc`] has bound the tensor.
    pub fn tensor_ptr(&self, id: TensorId) -> Option<NonNull<u8>> {
        let storage = self.tensor(id)?.storage()?;
        let base = self.allocator.committed_ptr()?;
        // SAFETY: planning guarantees `offset + bytes <= peak`, the size of
        // the committed buffer.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(storage.offset)) })
    }

    /// Verifies every structural invariant of the graph.
    pub fn check_valid(&self) -> Result<()> {
        ensure!(
            self.tensor_order.len() == self.tensors.len(),
            "tensor list and tensor map disagree"
        );
        ensure!(
            self.op_order.len() == self.ops.len(),
            "operator list and operator map disagree"
        );

        for id in &self.tensor_order {
            let Some(tensor) = self.tensors.get(id) else {
                bail!("tensor {id} listed but not owned");
            };
            ensure!(
                tensor.source().is_some() || !tensor.targets().is_empty(),
                "tensor {id} has neither source nor targets"
            );
            if let Some(source) = tensor.source() {
                let Some(op) = self.ops.get(&source) else {
                    bail!("tensor {id} names source {source} outside the graph");
                };
                ensure!(
                    op.outputs().contains(id),
                    "tensor {id} is not an output of its source {source}"
                );
            }
            for target in tensor.targets() {
                let Some(op) = self.ops.get(target) else {
                    bail!("tensor {id} names target {target} outside the graph");
                };
                ensure!(
                    op.inputs().contains(id),
                    "tensor {id} is not an input of its target {target}"
                );
            }
        }

        for guid in &self.op_order {
            let Some(op) = self.ops.get(guid) else {
                bail!("operator {guid} listed but not owned");
            };
            for id in op.inputs() {
                let Some(tensor) = self.tensors.get(id) else {
                    bail!("operator {guid} reads tensor {id} outside the graph");
                };
                ensure!(
                    tensor.targets().contains(guid),
                    "operator {guid} missing from targets of its input {id}"
                );
            }
            for id in op.outputs() {
                let Some(tensor) = self.tensors.get(id) else {
                    bail!("operator {guid} writes tensor {id} outside the graph");
                };
                ensure!(
                    tensor.source() == Some(*guid),
                    "operator {guid} is not recorded as source of its output {id}"
                );
            }

            let derived_preds: HashSet<OperatorId> = op
                .inputs()
                .iter()
                .filter_map(|id| self.tensors[id].source())
                .collect();
            let stored_preds: HashSet<OperatorId> = op.predecessors().iter().copied().collect();
            ensure!(
                derived_preds == stored_preds,
                "operator {guid} predecessor set diverged from tensor links"
            );

            let derived_succs: HashSet<OperatorId> = op
                .outputs()
                .iter()
                .flat_map(|id| self.tensors[id].targets().iter().copied())
                .collect();
            let stored_succs: HashSet<OperatorId> = op.successors().iter().copied().collect();
            ensure!(
                derived_succs == stored_succs,
                "operator {guid} successor set diverged from tensor links"
            );
        }
        Ok(())
    }

    /// Redirects every consumer of `from` to read `to` instead, moving the
    /// target links and re-deriving neighbor sets.
    pub(crate) fn redirect_consumers(&mut self, from: TensorId, to: TensorId) {
        let consumers = self.tensors[&from].targets().to_vec();
        for &guid in &consumers {
            self.op_mut(guid).replace_input(from, to);
        }
        self.tensor_mut(from).clear_targets();
        for &guid in &consumers {
            self.tensor_mut(to).add_target(guid);
        }
        self.rebuild_operator_links();
        self.sorted = false;
    }

    /// Replaces `old` with a freshly built operator at the same list
    /// position, re-linking tensors and neighbor sets.
    pub(crate) fn replace_operator(
        &mut self,
        old: OperatorId,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OperatorId> {
        for id in inputs.iter().chain(outputs.iter()) {
            ensure!(
                self.tensors.contains_key(id),
                "tensor {id} is not owned by this graph"
            );
        }
        let Some(old_op) = self.ops.remove(&old) else {
            bail!("operator {old} is not part of this graph");
        };
        for id in old_op.inputs() {
            self.tensor_mut(*id).remove_target(old);
        }
        for id in old_op.outputs() {
            self.tensor_mut(*id).clear_source_if(old);
        }
        for id in &outputs {
            ensure!(
                self.tensors[id].source().is_none(),
                "tensor {id} already has a producing operator"
            );
        }

        let op = Operator::new(kind, inputs.clone(), outputs.clone());
        let guid = op.guid();
        let position = self
            .op_order
            .iter()
            .position(|g| *g == old)
            .expect("replaced operator present in list");
        self.op_order[position] = guid;
        self.ops.insert(guid, op);

        for id in &inputs {
            self.tensor_mut(*id).add_target(guid);
        }
        for id in &outputs {
            self.tensor_mut(*id).set_source(Some(guid));
        }
        self.rebuild_operator_links();
        self.sorted = false;
        Ok(guid)
    }

    /// Re-derives every operator's predecessor/successor set from the tensor
    /// links, in deterministic first-encounter order.
    pub(crate) fn rebuild_operator_links(&mut self) {
        for guid in self.op_order.clone() {
            let (input_ids, output_ids) = {
                let op = &self.ops[&guid];
                (op.inputs().to_vec(), op.outputs().to_vec())
            };
            let mut preds = Vec::new();
            for id in &input_ids {
                if let Some(source) = self.tensors[id].source() {
                    if !preds.contains(&source) {
                        preds.push(source);
                    }
                }
            }
            let mut succs = Vec::new();
            for id in &output_ids {
                for &target in self.tensors[id].targets() {
                    if !succs.contains(&target) {
                        succs.push(target);
                    }
                }
            }
            self.op_mut(guid).set_links(preds, succs);
        }
    }

    /// Creates the output tensor for a factory-built operator.
    fn infer_new_output(&mut self, kind: &OpKind, inputs: &[TensorId]) -> Result<TensorId> {
        let mut shapes = Vec::with_capacity(inputs.len());
        let mut dtype = DType::default();
        for (idx, id) in inputs.iter().enumerate() {
            let Some(tensor) = self.tensors.get(id) else {
                bail!("tensor {id} is not owned by this graph");
            };
            if idx == 0 {
                dtype = tensor.dtype();
            }
            shapes.push(tensor.shape().clone());
        }
        let mut inferred = kind.infer_shape(&shapes)?;
        ensure!(
            inferred.len() == 1,
            "{} infers {} outputs, expected 1",
            kind.name(),
            inferred.len()
        );
        let shape = inferred.pop().expect("one inferred shape");
        Ok(self.add_tensor(shape, dtype))
    }

    /// Establishes bidirectional links for a freshly inserted operator.
    fn connect(&mut self, guid: OperatorId) {
        let (input_ids, output_ids) = {
            let op = &self.ops[&guid];
            (op.inputs().to_vec(), op.outputs().to_vec())
        };
        for id in input_ids {
            let source = {
                let tensor = self.tensor_mut(id);
                tensor.add_target(guid);
                tensor.source()
            };
            if let Some(pred) = source {
                self.op_mut(pred).add_successor(guid);
                self.op_mut(guid).add_predecessor(pred);
            }
        }
        for id in output_ids {
            let targets = {
                let tensor = self.tensor_mut(id);
                tensor.set_source(Some(guid));
                tensor.targets().to_vec()
            };
            for succ in targets {
                self.op_mut(succ).add_predecessor(guid);
                self.op_mut(guid).add_successor(succ);
            }
        }
    }

    fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        self.tensors
            .get_mut(&id)
            .expect("tensor id resolved through this graph")
    }

    fn op_mut(&mut self, guid: OperatorId) -> &mut Operator {
        self.ops
            .get_mut(&guid)
            .expect("operator id resolved through this graph")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph tensors:")?;
        for tensor in self.tensors() {
            writeln!(f, "  {tensor}")?;
        }
        writeln!(f, "Graph operators:")?;
        for op in self.operators() {
            let guids = |guids: &[OperatorId]| {
                guids
                    .iter()
                    .map(|g| g.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            writeln!(
                f,
                "  OP {}, pred [{}], succ [{}], {}",
                op.guid(),
                guids(op.predecessors()),
                guids(op.successors()),
                op.descriptor()
            )?;
        }
        Ok(())
    }
}
