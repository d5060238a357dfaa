//! Grouped reductions
//!
//! An [`Aggregator`] reduces the rows of a feature matrix into one row per
//! group, where a rank-1 index tensor names each row's group. Groups with no
//! rows come out as zero vectors, which is what isolated nodes and edgeless
//! graphs need.
//!
//! ```text
//! xs  [R, d]      idx [R]        out [G, d]
//! r0 ──────────── 2 ──┐
//! r1 ──────────── 0 ──┼──►  row 0 = reduce(r1)
//! r2 ──────────── 2 ──┘     row 1 = 0
//!                           row 2 = reduce(r0, r2)
//! ```
//!
//! Sum and mean are a single `index_add` scatter; max reduces a masked
//! `[groups, rows, width]` view, chunked over groups to bound memory. All
//! three keep gradient flow.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::primitives::index_values;
use crate::{GraphNetError, Result};

/// Reduction applied per group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    /// Sum of the group's rows
    #[default]
    #[serde(alias = "add")]
    Sum,
    /// Mean of the group's rows
    Mean,
    /// Component-wise maximum of the group's rows
    Max,
}

impl Aggregator {
    /// Reduce `xs` (`[R, d]`) into `num_groups` rows by the group ids in `idx` (`[R]`, u32)
    ///
    /// `idx` may be unsorted and need not cover every group.
    pub fn aggregate(&self, xs: &Tensor, idx: &Tensor, num_groups: usize) -> Result<Tensor> {
        let (rows, width) = xs.dims2().map_err(|_| {
            GraphNetError::ShapeMismatch(format!(
                "{self} aggregation expects [rows, width] features, got {:?}",
                xs.dims()
            ))
        })?;
        let n_idx = idx.dims1().map_err(|_| {
            GraphNetError::ShapeMismatch(format!(
                "{self} aggregation expects a 1D index, got {:?}",
                idx.dims()
            ))
        })?;
        if n_idx != rows {
            return Err(GraphNetError::ShapeMismatch(format!(
                "{self} aggregation got {n_idx} group ids for {rows} rows"
            )));
        }

        let zeros = Tensor::zeros((num_groups, width), xs.dtype(), xs.device())?;
        if rows == 0 {
            return Ok(zeros);
        }

        let ids = index_values(idx)?;
        if let Some(&bad) = ids.iter().find(|&&g| g as usize >= num_groups) {
            return Err(GraphNetError::IndexOutOfRange(format!(
                "group id {bad} outside 0..{num_groups}"
            )));
        }

        match self {
            Self::Sum => zeros
                .index_add(idx, xs, 0)
                .map_err(|e| GraphNetError::Tensor(format!("sum aggregation failed: {}", e))),
            Self::Mean => {
                let sums = zeros.index_add(idx, xs, 0)?;
                let ones = Tensor::ones((rows, 1), xs.dtype(), xs.device())?;
                let counts = Tensor::zeros((num_groups, 1), xs.dtype(), xs.device())?
                    .index_add(idx, &ones, 0)?
                    // empty groups divide a zero sum by one
                    .clamp(1f32, f32::MAX)?;
                sums.broadcast_div(&counts)
                    .map_err(|e| GraphNetError::Tensor(format!("mean aggregation failed: {}", e)))
            }
            Self::Max => max_by_group(xs, idx, num_groups),
        }
    }
}

/// Upper bound on the elements of one `[groups, rows, width]` mask
const MAX_MASK_ELEMS: usize = 1 << 22;

fn max_by_group(xs: &Tensor, idx: &Tensor, num_groups: usize) -> Result<Tensor> {
    max_by_group_chunked(xs, idx, num_groups, MAX_MASK_ELEMS)
}

/// Masked max over `[groups, rows, width]`, a chunk of groups at a time
///
/// Rows outside a group are replaced by `-inf` before the reduction, and
/// groups without rows are set to zero afterwards.
fn max_by_group_chunked(
    xs: &Tensor,
    idx: &Tensor,
    num_groups: usize,
    max_elems: usize,
) -> Result<Tensor> {
    let (rows, width) = xs.dims2()?;
    let device = xs.device();
    let chunk = (max_elems / (rows * width).max(1)).clamp(1, num_groups.max(1));

    let xs = xs.unsqueeze(0)?;
    let ids = idx.unsqueeze(0)?;
    let mut parts = Vec::with_capacity(num_groups.div_ceil(chunk));
    let mut start = 0;
    while start < num_groups {
        let len = chunk.min(num_groups - start);
        let groups = Tensor::arange(start as u32, (start + len) as u32, device)?.unsqueeze(1)?;
        let member = ids.broadcast_eq(&groups)?;

        let mask = member.unsqueeze(2)?.broadcast_as((len, rows, width))?;
        let floor = Tensor::full(f32::NEG_INFINITY, (len, rows, width), device)?
            .to_dtype(xs.dtype())?;
        let maxed = mask
            .where_cond(&xs.broadcast_as((len, rows, width))?, &floor)?
            .max(1)?;

        let occupied = member.max_keepdim(1)?.broadcast_as((len, width))?;
        let zeros = Tensor::zeros((len, width), xs.dtype(), device)?;
        parts.push(occupied.where_cond(&maxed, &zeros)?);
        start += len;
    }

    Tensor::cat(&parts, 0)
        .map_err(|e| GraphNetError::Tensor(format!("max aggregation failed: {}", e)))
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Mean => write!(f, "mean"),
            Self::Max => write!(f, "max"),
        }
    }
}

impl FromStr for Aggregator {
    type Err = GraphNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" | "add" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            "max" => Ok(Self::Max),
            other => Err(GraphNetError::Configuration(format!(
                "unknown aggregator '{other}' (expected sum, add, mean or max)"
            ))),
        }
    }
}
