//! Core Tensor Operations
//!
//! Device selection plus the handful of tensor helpers every block relies on.
//!
//! ## Device selection
//!
//! Set `AN_GRAPH_NETS_NO_GPU=1` to force CPU mode even when the crate is
//! compiled with the `metal` or `cuda` feature.
//!
//! ## Empty inputs
//!
//! Batches routinely contain graphs without edges, so every helper here
//! accepts zero-row tensors and returns correctly shaped zero-row results
//! instead of handing empty operands to the engine.

use crate::{GraphNetError, Result};
use candle_core::{DType, Device, Tensor};
use tracing::info;

/// Environment variable that forces CPU mode.
pub const NO_GPU_ENV: &str = "AN_GRAPH_NETS_NO_GPU";

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
pub fn gpu_disabled() -> bool {
    std::env::var(NO_GPU_ENV)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. `AN_GRAPH_NETS_NO_GPU` (forces CPU if set)
/// 2. Metal (with the `metal` feature)
/// 3. CUDA (with the `cuda` feature)
/// 4. CPU
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("Using CPU device ({} set)", NO_GPU_ENV);
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("Using Metal device");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("Using CUDA device");
            return device;
        }
    }

    info!("Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

/// Check if Metal is available (respects `AN_GRAPH_NETS_NO_GPU`)
#[cfg(feature = "metal")]
pub fn metal_available() -> bool {
    !gpu_disabled() && Device::new_metal(0).is_ok()
}

/// Check if Metal is available (always false when `metal` feature is not enabled)
#[cfg(not(feature = "metal"))]
pub fn metal_available() -> bool {
    false
}

/// Check if CUDA is available (respects `AN_GRAPH_NETS_NO_GPU`)
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    !gpu_disabled() && Device::new_cuda(0).is_ok()
}

/// Check if CUDA is available (always false when `cuda` feature is not enabled)
#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

/// Check if any GPU is available and enabled
pub fn gpu_available() -> bool {
    !gpu_disabled() && (metal_available() || cuda_available())
}

// ============================================================================
// Row helpers
// ============================================================================

/// Select rows of `src` by a rank-1 `U32` index tensor.
///
/// Every index is bounds-checked against the row count of `src` before the
/// engine sees it; a bad index is an [`GraphNetError::IndexOutOfRange`].
/// `what` names the lookup for the error message.
pub fn gather_rows(src: &Tensor, idx: &Tensor, what: &str) -> Result<Tensor> {
    let (rows, width) = src
        .dims2()
        .map_err(|e| GraphNetError::ShapeMismatch(format!("{what}: source must be 2D: {e}")))?;
    let n = idx
        .dims1()
        .map_err(|e| GraphNetError::ShapeMismatch(format!("{what}: index must be 1D: {e}")))?;

    if n == 0 {
        return Ok(Tensor::zeros((0, width), src.dtype(), src.device())?);
    }

    let max = idx
        .max(0)
        .and_then(|m| m.to_scalar::<u32>())
        .map_err(|e| GraphNetError::Tensor(format!("{what}: index max failed: {e}")))?;
    if max as usize >= rows {
        return Err(GraphNetError::IndexOutOfRange(format!(
            "{what}: index {max} references row {max} of a {rows}-row tensor"
        )));
    }

    src.index_select(idx, 0)
        .map_err(|e| GraphNetError::Tensor(format!("{what}: index_select failed: {e}")))
}

/// Concatenate 2D tensors with equal row counts along the feature dimension.
///
/// Zero-row inputs produce a `(0, sum of widths)` tensor.
pub fn concat_features(parts: &[&Tensor]) -> Result<Tensor> {
    let first = parts
        .first()
        .ok_or_else(|| GraphNetError::ShapeMismatch("nothing to concatenate".into()))?;
    let rows = first.dim(0)?;

    let mut width = 0;
    for (i, part) in parts.iter().enumerate() {
        let (r, w) = part.dims2()?;
        if r != rows {
            return Err(GraphNetError::ShapeMismatch(format!(
                "feature block {i} has {r} rows, expected {rows}"
            )));
        }
        width += w;
    }

    if rows == 0 {
        return Ok(Tensor::zeros((0, width), first.dtype(), first.device())?);
    }

    Tensor::cat(parts, 1).map_err(|e| GraphNetError::Tensor(format!("feature cat failed: {e}")))
}

/// Build a rank-1 `U32` index tensor from host values.
pub fn index_tensor(values: Vec<u32>, device: &Device) -> Result<Tensor> {
    let n = values.len();
    Tensor::from_vec(values, n, device)
        .map_err(|e| GraphNetError::Tensor(format!("index tensor failed: {e}")))
}

/// Read a rank-1 `U32` index tensor back to the host.
pub fn index_values(idx: &Tensor) -> Result<Vec<u32>> {
    if idx.dtype() != DType::U32 {
        return Err(GraphNetError::ShapeMismatch(format!(
            "index tensors must be u32, got {:?}",
            idx.dtype()
        )));
    }
    idx.to_vec1::<u32>()
        .map_err(|e| GraphNetError::Tensor(format!("index readback failed: {e}")))
}

// ============================================================================
// Losses
// ============================================================================

/// Mean squared error loss
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff =
        (pred - target).map_err(|e| GraphNetError::Tensor(format!("MSE diff failed: {}", e)))?;
    diff.sqr()?
        .mean_all()
        .map_err(|e| GraphNetError::Tensor(format!("MSE failed: {}", e)))
}

/// Binary cross-entropy on raw logits
///
/// Uses the stable form `max(x, 0) - x * y + log(1 + exp(-|x|))`.
pub fn bce_with_logits(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let positive = logits
        .relu()
        .map_err(|e| GraphNetError::Tensor(format!("BCE relu failed: {}", e)))?;
    let xy = logits
        .mul(target)
        .map_err(|e| GraphNetError::Tensor(format!("BCE x*y failed: {}", e)))?;
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?
        .log()
        .map_err(|e| GraphNetError::Tensor(format!("BCE softplus failed: {}", e)))?;

    ((positive - xy)? + softplus)?
        .mean_all()
        .map_err(|e| GraphNetError::Tensor(format!("BCE mean failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_cpu_device() {
        assert!(matches!(cpu_device(), Device::Cpu));
    }

    #[test]
    fn test_best_device() {
        let device = best_device();
        assert!(matches!(
            device,
            Device::Cpu | Device::Metal(_) | Device::Cuda(_)
        ));
    }

    #[test]
    fn test_gpu_available_without_features() {
        // Just verify it doesn't panic
        let _available = gpu_available();
    }

    #[test]
    fn test_gather_rows() {
        let src = matrix(3, 2, &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let idx = index_tensor(vec![2, 0, 2], &Device::Cpu).unwrap();
        let out = gather_rows(&src, &idx, "test").unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![20.0, 21.0], vec![0.0, 1.0], vec![20.0, 21.0]]
        );
    }

    #[test]
    fn test_gather_rows_out_of_range() {
        let src = matrix(2, 1, &[1.0, 2.0]);
        let idx = index_tensor(vec![0, 2], &Device::Cpu).unwrap();
        let err = gather_rows(&src, &idx, "senders").unwrap_err();
        assert!(matches!(err, GraphNetError::IndexOutOfRange(_)));
        assert!(err.to_string().contains("senders"));
    }

    #[test]
    fn test_gather_rows_empty_index() {
        let src = matrix(2, 3, &[0.0; 6]);
        let idx = index_tensor(vec![], &Device::Cpu).unwrap();
        let out = gather_rows(&src, &idx, "test").unwrap();
        assert_eq!(out.dims(), &[0, 3]);
    }

    #[test]
    fn test_concat_features() {
        let a = matrix(2, 1, &[1.0, 2.0]);
        let b = matrix(2, 2, &[3.0, 4.0, 5.0, 6.0]);
        let out = concat_features(&[&a, &b]).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 3.0, 4.0], vec![2.0, 5.0, 6.0]]
        );
    }

    #[test]
    fn test_concat_features_zero_rows() {
        let a = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((0, 5), DType::F32, &Device::Cpu).unwrap();
        let out = concat_features(&[&a, &b]).unwrap();
        assert_eq!(out.dims(), &[0, 7]);
    }

    #[test]
    fn test_concat_features_row_mismatch() {
        let a = matrix(2, 1, &[1.0, 2.0]);
        let b = matrix(1, 1, &[3.0]);
        assert!(matches!(
            concat_features(&[&a, &b]),
            Err(GraphNetError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_index_values_rejects_float() {
        let t = matrix(1, 2, &[0.0, 1.0]).flatten_all().unwrap();
        assert!(index_values(&t).is_err());
    }

    #[test]
    fn test_mse_loss() {
        let pred = matrix(1, 3, &[1.0, 2.0, 3.0]);
        let target = matrix(1, 3, &[1.0, 2.0, 3.0]);
        let loss = mse_loss(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.abs() < 0.001);
    }

    #[test]
    fn test_bce_with_logits() {
        // logit 0 against any target = ln 2
        let logits = matrix(1, 2, &[0.0, 0.0]);
        let target = matrix(1, 2, &[1.0, 0.0]);
        let loss = bce_with_logits(&logits, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-4);

        // confident, correct prediction = low loss
        let logits = matrix(1, 1, &[8.0]);
        let target = matrix(1, 1, &[1.0]);
        let loss = bce_with_logits(&logits, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 0.01);
    }
}
