//! Generation: sampling strategies, streaming session state, and the
//! top-level decoding loop.
//!
//! This module provides:
//! - The delay-pattern codec ([`delay`]), in grid and logit-tensor form
//! - Sampling strategies (greedy, temperature, top-k, top-p) behind
//!   [`SamplingPolicy`], plus guidance combination and repetition penalty
//! - Per-session RNG via [`SamplingContext`] for reproducible generation
//! - [`StreamingState`], the per-session cache bundle for incremental decode
//! - [`GenerateParams`] and the generation loop on
//!   [`LmModel`](crate::models::LmModel)

pub mod delay;
mod generate;
mod sampling;
pub mod streaming;

pub use delay::{delay_grid, undelay_grid, undelay_logits, ValidityMask};
pub use generate::GenerateParams;
pub use sampling::{
    apply_guidance, greedy_sample, penalize_logits, sample_tokens, update_counts,
    SamplingContext, SamplingPolicy,
};
pub use streaming::StreamingState;
