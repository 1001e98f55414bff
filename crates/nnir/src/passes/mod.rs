//! Fixpoint rewrite passes over the dataflow graph.
//!
//! Rewrites are expressed as objects implementing [`GraphPass`]: each run
//! either completes a rewrite with every graph invariant restored or leaves
//! the graph untouched, and reports whether anything changed. The driver in
//! [`Graph::optimize`](crate::graph::Graph::optimize) keeps running the
//! registered passes until an iteration reports no change.

mod matmul_fusion;
mod transpose_elimination;

pub use matmul_fusion::TransposeMatMulFusion;
pub use transpose_elimination::InverseTransposeElimination;

use anyhow::Result;

use crate::graph::Graph;

/// Result returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of rewrites applied during this run.
    pub rewrites_applied: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
        }
    }
}

/// Canonical interface implemented by graph rewrite passes.
pub trait GraphPass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> Result<PassResult>;
}

/// The standard rewrite pipeline applied by `Graph::optimize`.
pub fn default_passes() -> Vec<Box<dyn GraphPass>> {
    vec![
        Box::new(InverseTransposeElimination),
        Box::new(TransposeMatMulFusion),
    ]
}
