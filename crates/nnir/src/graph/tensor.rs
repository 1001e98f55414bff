//! Tensor records owned by a [`Graph`](super::Graph).

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::runtime::Runtime;
use crate::tensor::{DType, Shape};

use super::OperatorId;

/// Flattened unique identifier of a tensor. Assigned at creation from a
/// process-wide counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static FUID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Arena placement assigned to a tensor by memory planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Storage {
    /// Byte offset of the tensor inside the arena.
    pub offset: usize,
    /// Dense byte size of the tensor.
    pub bytes: usize,
}

/// A dataflow value: shape, dtype, identity, producing operator and consumers.
#[derive(Debug, Clone)]
pub struct Tensor {
    fuid: TensorId,
    shape: Shape,
    dtype: DType,
    runtime: Arc<dyn Runtime>,
    source: Option<OperatorId>,
    targets: Vec<OperatorId>,
    storage: Option<Storage>,
}

impl Tensor {
    /// Creates a standalone tensor bound to `runtime`, assigning a fresh fuid.
    pub fn new(shape: Shape, dtype: DType, runtime: Arc<dyn Runtime>) -> Self {
        Tensor {
            fuid: TensorId(FUID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            shape,
            dtype,
            runtime,
            source: None,
            targets: Vec::new(),
            storage: None,
        }
    }

    pub fn fuid(&self) -> TensorId {
        self.fuid
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dense byte size implied by shape and dtype.
    pub fn bytes(&self) -> usize {
        self.shape.size_in_bytes(self.dtype)
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// The operator producing this tensor, or `None` for a graph input.
    pub fn source(&self) -> Option<OperatorId> {
        self.source
    }

    /// Consuming operators in insertion order. An operator reading the tensor
    /// through several inputs appears once per read.
    pub fn targets(&self) -> &[OperatorId] {
        &self.targets
    }

    /// Arena placement, unset until planning completes.
    pub fn storage(&self) -> Option<Storage> {
        self.storage
    }

    pub(super) fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    pub(super) fn set_source(&mut self, source: Option<OperatorId>) {
        self.source = source;
    }

    pub(super) fn clear_source_if(&mut self, guid: OperatorId) {
        if self.source == Some(guid) {
            self.source = None;
        }
    }

    pub(super) fn add_target(&mut self, guid: OperatorId) {
        self.targets.push(guid);
    }

    pub(super) fn remove_target(&mut self, guid: OperatorId) {
        self.targets.retain(|t| *t != guid);
    }

    pub(super) fn clear_targets(&mut self) {
        self.targets.clear();
    }

    pub(super) fn bind_storage(&mut self, storage: Storage) {
        self.storage = Some(storage);
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {}, shape {}, dtype {:?}, source ",
            self.fuid, self.shape, self.dtype
        )?;
        match self.source {
            Some(guid) => write!(f, "{guid}")?,
            None => write!(f, "none")?,
        }
        write!(f, ", targets [")?;
        for (idx, guid) in self.targets.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{guid}")?;
        }
        write!(f, "]")
    }
}
