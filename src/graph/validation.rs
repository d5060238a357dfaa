//! Graph Tuple Validation
//!
//! Checks the structural invariants of a [`GraphTuple`].
//!
//! ## Checks Performed
//!
//! - **Batch**: at least one graph (one global row)
//! - **Ordering**: `node_idx` and `edge_idx` are non-decreasing, so each
//!   graph's rows are contiguous and in batch order
//! - **Membership**: every `node_idx` / `edge_idx` value names an existing graph
//! - **Connectivity**: every edge endpoint is an existing node
//! - **Locality**: both endpoints of an edge belong to the edge's own graph
//!
//! Feature widths need no check: a tensor has one width by construction,
//! and [`GraphTuple::new`] already enforces matching row counts. It also runs
//! [`validate_gt`], so every public way of building a tuple is checked.

use std::fmt;

use super::GraphTuple;
use crate::primitives::index_values;
use crate::{GraphNetError, Result};

/// One violated invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Short name of the violated invariant
    pub invariant: &'static str,
    /// Error message
    pub message: String,
    /// Flat row (node or edge) where the violation was found
    pub position: Option<usize>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.invariant, self.message)?;
        if let Some(pos) = self.position {
            write!(f, " (at row {})", pos)?;
        }
        Ok(())
    }
}

/// Validate a graph tuple
///
/// Returns every violation found (empty if valid). Fails only when the index
/// tensors cannot be read back.
pub fn validate(gt: &GraphTuple) -> Result<Vec<ValidationError>> {
    let mut errors = Vec::new();

    let b = gt.num_graphs();
    let n = gt.num_nodes();
    let node_idx = index_values(gt.node_idx())?;
    let edge_idx = index_values(gt.edge_idx())?;
    let senders = index_values(&gt.senders()?)?;
    let receivers = index_values(&gt.receivers()?)?;

    if b == 0 {
        errors.push(ValidationError {
            invariant: "batch",
            message: "graph tuple has no global rows".into(),
            position: None,
        });
    }

    check_membership("node_idx", &node_idx, b, &mut errors);
    check_membership("edge_idx", &edge_idx, b, &mut errors);

    for (e, (&s, &t)) in senders.iter().zip(&receivers).enumerate() {
        let (s, t) = (s as usize, t as usize);
        if s >= n || t >= n {
            errors.push(ValidationError {
                invariant: "connectivity",
                message: format!("edge {s} -> {t} references a node outside 0..{n}"),
                position: Some(e),
            });
            continue;
        }

        let g = edge_idx[e];
        if node_idx[s] != g || node_idx[t] != g {
            errors.push(ValidationError {
                invariant: "locality",
                message: format!(
                    "edge of graph {g} connects node {s} (graph {}) to node {t} (graph {})",
                    node_idx[s], node_idx[t]
                ),
                position: Some(e),
            });
        }
    }

    Ok(errors)
}

/// Validate a graph tuple, failing on the first violated invariant
///
/// Passes silently for a valid tuple; otherwise returns
/// [`GraphNetError::InvariantViolation`] describing the first violation.
pub fn validate_gt(gt: &GraphTuple) -> Result<()> {
    match validate(gt)?.into_iter().next() {
        None => Ok(()),
        Some(err) => Err(GraphNetError::InvariantViolation(err.to_string())),
    }
}

/// Non-decreasing and bounded by the number of graphs
fn check_membership(
    name: &'static str,
    idx: &[u32],
    num_graphs: usize,
    errors: &mut Vec<ValidationError>,
) {
    for (i, &g) in idx.iter().enumerate() {
        if g as usize >= num_graphs {
            errors.push(ValidationError {
                invariant: "membership",
                message: format!("{name} value {g} names a graph outside 0..{num_graphs}"),
                position: Some(i),
            });
        }
        if i > 0 && g < idx[i - 1] {
            errors.push(ValidationError {
                invariant: "ordering",
                message: format!("{name} decreases from {} to {g}", idx[i - 1]),
                position: Some(i),
            });
        }
    }
}
