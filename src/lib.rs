//! # multistream-lm
//!
//! Decoding engine for multi-stream autoregressive token models: a batch of
//! parallel codebook streams (audio residual codebooks plus an optional text
//! stream) generated jointly, one time step at a time.
//!
//! ## Features
//!
//! - **CPU inference** with optional MKL/Accelerate for faster BLAS operations
//! - **CUDA** support for NVIDIA GPU acceleration
//! - **Metal** support for Apple Silicon
//! - **Streaming decode** with per-layer KV caches and a burst protocol that
//!   interleaves backbone and depth-decoder steps
//! - **Classifier-free guidance** in one batch-doubled pass or two passes
//! - **Delay pattern** codec that staggers codebooks along the time axis
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use multistream_lm::{auto_device, GenerateParams, LmModel, Modality};
//!
//! let device = auto_device()?;
//! let model = LmModel::load(
//!     "config.json",
//!     &[std::path::PathBuf::from("model.safetensors")],
//!     multistream_lm::compute_dtype_for_device(&device),
//!     &device,
//! )?;
//!
//! let params = GenerateParams {
//!     max_gen_len: 512,
//!     ..Default::default()
//! };
//! let grid = model.generate(None, &[], Some(1), &params, None)?;
//! // [1, K, 512] i64, ready for a codec
//! let codes = grid.to_tensor(&model.config().stream_cardinalities(), &device)?;
//! ```
//!
//! ## Architecture
//!
//! A decode step moves through three stages:
//!
//! 1. **Backbone**: one transformer step over the summed embeddings of the
//!    previous time step's tokens (all streams collapsed into one position).
//!    Produces text logits and a shared latent.
//!
//! 2. **Audio readout**: either a stack of per-codebook linear heads on the
//!    shared latent (`Direct`), or a small autoregressive transformer over
//!    the codebook axis (`Depth`) that conditions each codebook on the
//!    tokens already decoded at this time step.
//!
//! 3. **Delay bookkeeping**: streams are staggered by per-codebook delays,
//!    so a token decoded at step `t` for codebook `k` lands at time
//!    `t - delay[k]` in the output. [`generation::delay`] holds the codec.
//!
//! Tokens stay symbolic ([`Token`]) until the tensor boundary: the start
//! marker, the zero placeholder, and not-yet-generated cells all have
//! reserved encodings that never appear in model output.

pub mod conditions;
pub mod generation;
pub mod models;
pub mod profiling;
pub mod tokens;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Re-exports for convenience
pub use conditions::{
    build_cfg_conditions, AttributeValue, CfgConditions, ConditionAttributes, ConditionProvider,
    ConditionTensors,
};
pub use generation::{GenerateParams, SamplingContext, SamplingPolicy, StreamingState};
pub use models::{DepthDecoderConfig, LmConfig, LmModel, TransformerConfig};
pub use tokens::{Modality, Token, TokenGrid};

/// Return the recommended compute dtype for the given device.
///
/// Returns `BF16` for CUDA/Metal (lower memory, faster attention) and `F32` for CPU.
pub fn compute_dtype_for_device(device: &Device) -> DType {
    if device.is_cuda() || device.is_metal() {
        DType::BF16
    } else {
        DType::F32
    }
}

/// Force the GPU to complete all pending work before returning.
///
/// On CUDA/Metal, GPU operations are asynchronous — `Instant::now()` would
/// measure submission time, not completion time. This helper forces a sync
/// by creating a tiny tensor and reading it back to the CPU.
///
/// On CPU this is a no-op.
pub fn sync_device(device: &Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        _ => {
            // Force a GPU→CPU sync by reading a scalar back
            let _: Vec<f32> = Tensor::zeros(1, DType::F32, device)?.to_vec1()?;
            Ok(())
        }
    }
}

/// Select the best available compute device for inference.
///
/// Checks for available hardware in order: CUDA → Metal → CPU.
/// Falls back to CPU if no GPU acceleration is available.
///
/// # Feature Flags
///
/// - `cuda`: Enables NVIDIA GPU support
/// - `metal`: Enables Apple Silicon GPU support
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats:
/// - `"auto"` — select best available via [`auto_device`]
/// - `"cpu"` — force CPU
/// - `"cuda"` or `"cuda:0"` — CUDA device 0
/// - `"cuda:N"` — CUDA device N
/// - `"metal"` — Apple Silicon GPU
///
/// # Errors
///
/// Returns an error if the device string is unrecognized, the requested
/// backend wasn't compiled in, or hardware initialization fails.
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = if s == "cuda" {
                    0
                } else if let Some(idx) = s.strip_prefix("cuda:") {
                    idx.parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?
                } else {
                    0
                };
                Device::cuda_if_available(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA support not compiled in. Rebuild with: cargo build --features cuda")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!(
                "Metal support not compiled in. Rebuild with: cargo build --features metal"
            )
        }
        other => {
            anyhow::bail!("unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal")
        }
    }
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
