//! Neural network models of the decoding engine.
//!
//! This module contains:
//! - `transformer`: Shared building blocks (RoPE, Attention, CrossAttention, MLP, DecoderLayer)
//! - `lm`: The multi-stream backbone with its scoring and streaming surfaces
//! - `depth_decoder`: The per-step transformer over the codebook axis
//! - `kv_cache`: Per-layer key/value caches
//! - `config`: Model configuration

pub mod config;
pub mod depth_decoder;
pub mod kv_cache;
pub mod lm;
pub mod transformer;

pub use config::{DepthDecoderConfig, LmConfig, TransformerConfig};
pub use depth_decoder::DepthDecoder;
pub use kv_cache::{KVCache, LayerCache};
pub use lm::{LmModel, ScoreOutput, StepLogits};
pub use transformer::{RotaryEmbedding, ZeroIdxEmbedding};
