//! Operator kinds, their typed attributes, and per-kind shape inference.
//!
//! Every operator the graph knows about is a variant of [`OpKind`] carrying a
//! kind-specific spec struct. Shape inference dispatches on the variant and is
//! total over well-typed inputs; any disagreement surfaces as a [`ShapeError`].

pub mod shape_helpers;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::Shape;

use self::shape_helpers::infer_broadcast;

/// Errors raised while inferring operator output shapes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{kind} expects {expected} inputs, got {got}")]
    ArityMismatch {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("matmul operands must have rank >= 2, got {lhs} and {rhs}")]
    MatMulRank { lhs: usize, rhs: usize },
    #[error("matmul contraction mismatch: lhs k={lhs} vs rhs k={rhs}")]
    ContractionMismatch { lhs: usize, rhs: usize },
    #[error("shapes {lhs} and {rhs} do not broadcast")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },
    #[error("{perm:?} is not a valid permutation for rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: i64, rank: usize },
    #[error("concat inputs disagree outside axis {axis}: {lhs} vs {rhs}")]
    ConcatMismatch { axis: usize, lhs: Shape, rhs: Shape },
}

/// Attributes of a matrix multiplication.
///
/// `trans_a`/`trans_b` swap the last two axes of the corresponding operand
/// before contraction; leading axes are batch dimensions and broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatMulSpec {
    pub trans_a: bool,
    pub trans_b: bool,
}

/// Attributes of an axis permutation. `perm[i]` names the input axis that
/// lands at output axis `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Attributes of a concatenation along one (already normalized) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Binary arithmetic applied elementwise with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Attributes of a broadcasting elementwise binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementwiseSpec {
    pub op: BinaryOp,
}

/// Tagged operator kind with its attribute payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    MatMul(MatMulSpec),
    Transpose(TransposeSpec),
    Concat(ConcatSpec),
    Elementwise(ElementwiseSpec),
}

impl OpKind {
    /// Stable lower-case tag used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::MatMul(_) => "matmul",
            OpKind::Transpose(_) => "transpose",
            OpKind::Concat(_) => "concat",
            OpKind::Elementwise(_) => "elementwise",
        }
    }

    /// Fixed input count for the kind, or `None` when variadic.
    pub fn arity(&self) -> Option<usize> {
        match self {
            OpKind::MatMul(_) | OpKind::Elementwise(_) => Some(2),
            OpKind::Transpose(_) => Some(1),
            OpKind::Concat(_) => None,
        }
    }

    /// Computes the output shapes implied by `inputs`.
    ///
    /// Inference is idempotent and never consults existing output shapes.
    pub fn infer_shape(&self, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        match self {
            OpKind::MatMul(spec) => infer_matmul(spec, inputs),
            OpKind::Transpose(spec) => infer_transpose(spec, inputs),
            OpKind::Concat(spec) => infer_concat(spec, inputs),
            OpKind::Elementwise(_) => infer_elementwise(inputs),
        }
    }
}

fn expect_arity(
    kind: &'static str,
    expected: usize,
    inputs: &[Shape],
) -> Result<(), ShapeError> {
    if inputs.len() != expected {
        return Err(ShapeError::ArityMismatch {
            kind,
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

fn infer_matmul(spec: &MatMulSpec, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    expect_arity("matmul", 2, inputs)?;
    let (a, b) = (&inputs[0], &inputs[1]);
    let (ra, rb) = (a.rank(), b.rank());
    if ra < 2 || rb < 2 {
        return Err(ShapeError::MatMulRank { lhs: ra, rhs: rb });
    }
    let (da, db) = (a.dims(), b.dims());

    // Effective matrix dimensions after the transpose flags.
    let (m, ka) = if spec.trans_a {
        (da[ra - 1], da[ra - 2])
    } else {
        (da[ra - 2], da[ra - 1])
    };
    let (kb, n) = if spec.trans_b {
        (db[rb - 1], db[rb - 2])
    } else {
        (db[rb - 2], db[rb - 1])
    };
    if ka != kb {
        return Err(ShapeError::ContractionMismatch { lhs: ka, rhs: kb });
    }

    let batch = infer_broadcast(&Shape::from(&da[..ra - 2]), &Shape::from(&db[..rb - 2]))?;
    let mut dims = batch.dims().to_vec();
    dims.push(m);
    dims.push(n);
    Ok(vec![Shape::new(dims)])
}

fn infer_transpose(spec: &TransposeSpec, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    expect_arity("transpose", 1, inputs)?;
    let input = &inputs[0];
    let rank = input.rank();
    if spec.perm.len() != rank || !is_permutation(&spec.perm) {
        return Err(ShapeError::InvalidPermutation {
            perm: spec.perm.clone(),
            rank,
        });
    }
    let dims = spec.perm.iter().map(|&axis| input.dims()[axis]).collect::<Vec<_>>();
    Ok(vec![Shape::new(dims)])
}

fn infer_concat(spec: &ConcatSpec, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    let Some(first) = inputs.first() else {
        return Err(ShapeError::ArityMismatch {
            kind: "concat",
            expected: 1,
            got: 0,
        });
    };
    let rank = first.rank();
    if spec.axis >= rank {
        return Err(ShapeError::AxisOutOfRange {
            axis: spec.axis as i64,
            rank,
        });
    }
    let mut dims = first.dims().to_vec();
    for other in &inputs[1..] {
        let compatible = other.rank() == rank
            && other
                .dims()
                .iter()
                .enumerate()
                .all(|(axis, &dim)| axis == spec.axis || dim == dims[axis]);
        if !compatible {
            return Err(ShapeError::ConcatMismatch {
                axis: spec.axis,
                lhs: first.clone(),
                rhs: other.clone(),
            });
        }
        dims[spec.axis] += other.dims()[spec.axis];
    }
    Ok(vec![Shape::new(dims)])
}

fn infer_elementwise(inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
    expect_arity("elementwise", 2, inputs)?;
    Ok(vec![infer_broadcast(&inputs[0], &inputs[1])?])
}

fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        if axis >= perm.len() || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}
