//! Core graph layer of a small inference framework.
//!
//! The crate provides three tightly coupled pieces:
//!
//! - a dataflow IR ([`graph::Graph`]) owning tensor and operator records and
//!   enforcing their connectivity invariants,
//! - algebraic rewrite passes ([`passes`]) that eliminate inverse transpose
//!   pairs and fold last-two-axis transposes into matmul flags,
//! - an arena planner ([`graph::Allocator`]) that assigns every tensor a byte
//!   offset inside a single contiguous buffer before any device memory is
//!   touched.
//!
//! Kernel execution lives behind the [`runtime::Runtime`] trait; the core only
//! ever asks it for one buffer of `peak` bytes.

pub mod graph;
pub mod ops;
pub mod passes;
pub mod runtime;
pub mod tensor;

pub use graph::{Allocator, Graph, Operator, OperatorId, Storage, Tensor, TensorId};
pub use ops::OpKind;
pub use runtime::Runtime;
pub use tensor::{DType, Shape};
