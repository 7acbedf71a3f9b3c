//! Token sampling strategies for autoregressive generation
//!
//! Supports both deterministic (seeded) and non-deterministic random sampling.
//! Create a [`SamplingContext`] with an optional seed for reproducible outputs.
//! Also hosts the logit transforms the generation loop applies before
//! sampling: classifier-free guidance and the EMA repetition penalty.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor, D};

/// RNG and sampling state for a single generation session.
///
/// Encapsulates all randomness so that multiple sessions can run
/// concurrently without interfering with each other.
///
/// # Determinism
///
/// When created with a seed, the same seed produces identical output
/// across runs and threads. Without a seed, uses system entropy.
pub struct SamplingContext {
    /// PCG state (only used when seeded)
    state: u64,
    /// Whether we're in seeded mode
    seeded: bool,
    /// Counter for unseeded fallback
    counter: u64,
}

impl SamplingContext {
    /// Create a new sampling context with an optional seed.
    ///
    /// When `seed` is `Some`, all sampling is deterministic and reproducible.
    /// When `None`, uses system time + counter for randomness.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => {
                // Mix seed with PCG increment to avoid degenerate states
                let state = s
                    .wrapping_mul(2685821657736338717)
                    .wrapping_add(1442695040888963407);
                Self {
                    state,
                    seeded: true,
                    counter: 0,
                }
            }
            None => Self {
                state: 0,
                seeded: false,
                counter: 0,
            },
        }
    }

    /// Reset the RNG to its initial seeded state.
    ///
    /// Only meaningful for seeded contexts. For unseeded contexts, this is a no-op.
    pub fn reset(&mut self, seed: u64) {
        let state = seed
            .wrapping_mul(2685821657736338717)
            .wrapping_add(1442695040888963407);
        self.state = state;
        self.seeded = true;
    }

    /// Generate a random f32 in [0, 1).
    fn rand_f32(&mut self) -> f32 {
        if !self.seeded {
            use std::time::{SystemTime, UNIX_EPOCH};

            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64;
            let count = self.counter;
            self.counter += 1;

            // LCG with seed and counter
            let state = seed
                .wrapping_add(count)
                .wrapping_mul(1103515245)
                .wrapping_add(12345);
            return (state as f32) / (u64::MAX as f32);
        }

        // PCG XSH RR 64/32
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);

        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        let output = xorshifted.rotate_right(rot);

        (output as f32) / (u32::MAX as f32)
    }
}

/// How next tokens are picked from logits.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingPolicy {
    /// Argmax.
    Greedy,
    /// Temperature sampling over the full distribution.
    Categorical { temperature: f64 },
    /// Temperature sampling restricted to the k most likely tokens.
    TopK { k: usize, temperature: f64 },
    /// Temperature sampling restricted to the smallest set of tokens whose
    /// cumulative probability reaches `p`.
    TopP { p: f64, temperature: f64 },
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::TopK {
            k: 250,
            temperature: 1.0,
        }
    }
}

impl SamplingPolicy {
    /// Build from optional flags; nucleus sampling takes precedence over
    /// top-k when both are set.
    pub fn from_flags(top_k: Option<usize>, top_p: Option<f64>, temperature: f64) -> Self {
        match (top_p, top_k) {
            (Some(p), _) if p > 0.0 && p < 1.0 => SamplingPolicy::TopP { p, temperature },
            (_, Some(k)) if k > 0 => SamplingPolicy::TopK { k, temperature },
            _ => SamplingPolicy::Categorical { temperature },
        }
    }

    fn temperature(&self) -> Option<f64> {
        match self {
            SamplingPolicy::Greedy => None,
            SamplingPolicy::Categorical { temperature }
            | SamplingPolicy::TopK { temperature, .. }
            | SamplingPolicy::TopP { temperature, .. } => Some(*temperature),
        }
    }
}

/// Sample one token per distribution.
///
/// `logits` can have any leading shape as long as the final axis is the
/// vocabulary; the result is `u32` indices with that final axis dropped.
pub fn sample_tokens(
    logits: &Tensor,
    policy: &SamplingPolicy,
    ctx: &mut SamplingContext,
) -> Result<Tensor> {
    let dims = logits.dims().to_vec();
    let vocab = dims[dims.len() - 1];
    let flat = logits.reshape(((), vocab))?.to_dtype(DType::F32)?;

    let temperature = match policy.temperature() {
        Some(t) => t,
        None => {
            let picked = greedy_sample(&flat)?;
            return Ok(picked.reshape(&dims[..dims.len() - 1])?);
        }
    };

    // For simplicity, if temperature is very low, use greedy
    if temperature < 0.01 {
        let picked = greedy_sample(&flat)?;
        return Ok(picked.reshape(&dims[..dims.len() - 1])?);
    }

    let scaled = if temperature != 1.0 {
        (flat / temperature)?
    } else {
        flat
    };

    let filtered = match policy {
        SamplingPolicy::TopK { k, .. } if *k > 0 => top_k_filter(&scaled, *k)?,
        SamplingPolicy::TopP { p, .. } if *p > 0.0 && *p < 1.0 => top_p_filter(&scaled, *p)?,
        _ => scaled,
    };

    // Convert to probabilities and sample from the distribution
    let probs = candle_nn::ops::softmax_last_dim(&filtered)?;
    let picked = multinomial_sample(&probs, ctx)?;
    Ok(picked.reshape(&dims[..dims.len() - 1])?)
}

/// Apply top-k filtering: keep only the top k logits, set rest to -inf
///
/// Dispatches between CPU-native Rust sort and GPU tensor sort.
fn top_k_filter(logits: &Tensor, k: usize) -> Result<Tensor> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_k").entered();
    let (batch, vocab) = logits.dims2()?;
    let k = k.min(vocab);

    if logits.device().is_cpu() {
        // CPU path: native Rust partial sort is faster than candle sort_last_dim
        let mut result_data = Vec::with_capacity(batch * vocab);
        for b in 0..batch {
            let row: Vec<f32> = logits.i(b)?.to_vec1()?;
            let mut sorted = row.clone();
            sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let threshold = sorted[k - 1];
            result_data.extend(
                row.iter()
                    .map(|&v| if v >= threshold { v } else { f32::NEG_INFINITY }),
            );
        }
        Ok(Tensor::new(result_data.as_slice(), logits.device())?.reshape((batch, vocab))?)
    } else {
        // GPU path: sort on device to avoid GPU→CPU transfer
        let (sorted, _) = logits.sort_last_dim(false)?;
        let threshold = sorted.narrow(1, k - 1, 1)?;
        let mask = logits.ge(&threshold.broadcast_as(logits.shape())?)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(mask.where_cond(logits, &neg_inf)?)
    }
}

/// Apply top-p (nucleus) filtering: keep smallest set of tokens whose cumulative probability >= top_p
///
/// Dispatches between CPU-native Rust sort and GPU tensor ops.
fn top_p_filter(logits: &Tensor, p: f64) -> Result<Tensor> {
    #[cfg(feature = "profiling")]
    let _span = tracing::info_span!("top_p").entered();

    if logits.device().is_cpu() {
        // CPU path: native Rust sort + cumsum (avoids candle sort_last_dim overhead)
        let (batch, vocab) = logits.dims2()?;
        let mut result_data = Vec::with_capacity(batch * vocab);

        for b in 0..batch {
            let row: Vec<f32> = logits.i(b)?.to_vec1()?;
            let mut indices: Vec<usize> = (0..vocab).collect();
            indices.sort_unstable_by(|&a, &b| {
                row[b]
                    .partial_cmp(&row[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            // Softmax over sorted values
            let max_val = row[indices[0]];
            let mut exp_sorted: Vec<f32> =
                indices.iter().map(|&i| (row[i] - max_val).exp()).collect();
            let sum: f32 = exp_sorted.iter().sum();
            for v in &mut exp_sorted {
                *v /= sum;
            }

            // Cumulative probability cutoff
            let mut cumsum = 0.0f32;
            let mut cutoff_idx = vocab;
            for (i, &prob) in exp_sorted.iter().enumerate() {
                cumsum += prob;
                if cumsum > p as f32 {
                    cutoff_idx = i + 1;
                    break;
                }
            }

            let mut filtered = vec![f32::NEG_INFINITY; vocab];
            for &idx in &indices[..cutoff_idx] {
                filtered[idx] = row[idx];
            }
            result_data.extend(filtered);
        }

        Ok(Tensor::new(result_data.as_slice(), logits.device())?.reshape((batch, vocab))?)
    } else {
        // GPU path: sort + cumsum on device
        let (sorted_logits, _) = logits.sort_last_dim(false)?;
        let sorted_probs = candle_nn::ops::softmax_last_dim(&sorted_logits)?;
        let cumulative_probs = sorted_probs.cumsum(1)?;

        let shifted = cumulative_probs.narrow(1, 0, cumulative_probs.dim(1)? - 1)?;
        let zeros = Tensor::zeros((logits.dim(0)?, 1), DType::F32, logits.device())?;
        let shifted_cumsum = Tensor::cat(&[&zeros, &shifted], 1)?;

        let threshold_val =
            Tensor::new(&[p as f32], logits.device())?.broadcast_as(shifted_cumsum.shape())?;
        let remove_mask = shifted_cumsum.ge(&threshold_val)?;

        let pos_inf =
            Tensor::new(&[f32::INFINITY], logits.device())?.broadcast_as(sorted_logits.shape())?;
        let kept_logits = remove_mask.where_cond(&pos_inf, &sorted_logits)?;
        let min_kept = kept_logits.min(D::Minus1)?.unsqueeze(1)?;

        let keep_original = logits.ge(&min_kept.broadcast_as(logits.shape())?)?;
        let neg_inf =
            Tensor::new(&[f32::NEG_INFINITY], logits.device())?.broadcast_as(logits.shape())?;
        Ok(keep_original.where_cond(logits, &neg_inf)?)
    }
}

/// Sample from probability distribution using multinomial sampling
fn multinomial_sample(probs: &Tensor, ctx: &mut SamplingContext) -> Result<Tensor> {
    let (batch, vocab) = probs.dims2()?;

    // Cumulative distribution for sampling
    let cumsum = probs.cumsum(1)?;

    // Generate uniform random values
    let uniform: Vec<f32> = (0..batch).map(|_| ctx.rand_f32()).collect();
    let uniform = Tensor::new(uniform.as_slice(), probs.device())?.unsqueeze(1)?;

    // Find first index where cumsum >= uniform
    let mask = cumsum.ge(&uniform.broadcast_as(cumsum.shape())?)?;

    // Convert mask to f32 for operations
    let mask_f32 = mask.to_dtype(DType::F32)?;

    // Use a trick: multiply by position and find first nonzero
    let positions: Vec<f32> = (0..vocab).map(|i| i as f32 + 1.0).collect();
    let positions = Tensor::new(positions.as_slice(), probs.device())?
        .unsqueeze(0)?
        .broadcast_as(mask_f32.shape())?;

    // Where mask is true, use position; else use large value
    let large =
        Tensor::new(&[vocab as f32 + 1.0], probs.device())?.broadcast_as(mask_f32.shape())?;
    let masked_positions = mask.where_cond(&positions, &large)?;

    // Argmin gives first True position
    Ok(masked_positions.argmin(D::Minus1)?)
}

/// Greedy sampling (argmax)
pub fn greedy_sample(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax(D::Minus1)?)
}

/// Combine the conditional and unconditional logits of classifier-free
/// guidance: `uncond + (cond - uncond) * coef`.
pub fn apply_guidance(cond: &Tensor, uncond: &Tensor, cfg_coef: f64) -> Result<Tensor> {
    if cfg_coef == 1.0 {
        return Ok(cond.clone());
    }
    Ok((uncond + ((cond - uncond)? * cfg_coef)?)?)
}

/// Discourage recently emitted tokens: log-probabilities minus `coef` times
/// the per-token EMA counts (`[batch, vocab]`, see [`update_counts`]).
pub fn penalize_logits(logits: &Tensor, counts: &Tensor, coef: f64) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    Ok((log_probs - (counts * coef)?)?)
}

/// Fold just-sampled tokens (`u32 [batch]`) into the EMA counts:
/// `counts * (1 - alpha) + one_hot(tokens) * alpha`.
///
/// `alpha` is the reciprocal of the averaging window, so a token sampled at
/// every step converges its count towards 1.
pub fn update_counts(counts: &Tensor, tokens: &Tensor, alpha: f64) -> Result<Tensor> {
    let (_batch, vocab) = counts.dims2()?;
    let one_hot = candle_nn::encoding::one_hot(
        tokens.to_dtype(DType::I64)?,
        vocab,
        alpha as f32,
        0f32,
    )?;
    Ok(((counts * (1.0 - alpha))? + one_hot)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_default_policy() {
        assert_eq!(
            SamplingPolicy::default(),
            SamplingPolicy::TopK {
                k: 250,
                temperature: 1.0
            }
        );
    }

    #[test]
    fn test_policy_from_flags_precedence() {
        assert_eq!(
            SamplingPolicy::from_flags(Some(50), Some(0.9), 0.8),
            SamplingPolicy::TopP {
                p: 0.9,
                temperature: 0.8
            }
        );
        assert_eq!(
            SamplingPolicy::from_flags(Some(50), None, 0.8),
            SamplingPolicy::TopK {
                k: 50,
                temperature: 0.8
            }
        );
        assert_eq!(
            SamplingPolicy::from_flags(None, None, 0.8),
            SamplingPolicy::Categorical { temperature: 0.8 }
        );
    }

    #[test]
    fn test_cumsum() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[0.1f32, 0.2, 0.3, 0.4]], &device).unwrap();
        let cumsum = x.cumsum(1).unwrap();
        let result: Vec<f32> = cumsum.flatten_all().unwrap().to_vec1().unwrap();
        assert!((result[0] - 0.1).abs() < 1e-5);
        assert!((result[1] - 0.3).abs() < 1e-5);
        assert!((result[2] - 0.6).abs() < 1e-5);
        assert!((result[3] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_greedy_sample() {
        let device = Device::Cpu;
        // Logits where position 2 has highest value
        let logits = Tensor::new(&[[1.0f32, 2.0, 5.0, 1.0]], &device).unwrap();
        let result = greedy_sample(&logits).unwrap();
        let idx: Vec<u32> = result.to_vec1().unwrap();
        assert_eq!(idx[0], 2); // Index of max
    }

    #[test]
    fn test_greedy_sample_batch() {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[1.0f32, 5.0, 2.0], [3.0, 1.0, 2.0], [1.0, 2.0, 10.0]],
            &device,
        )
        .unwrap();
        let result = greedy_sample(&logits).unwrap();
        let idx: Vec<u32> = result.to_vec1().unwrap();
        assert_eq!(idx[0], 1); // Max at position 1
        assert_eq!(idx[1], 0); // Max at position 0
        assert_eq!(idx[2], 2); // Max at position 2
    }

    #[test]
    fn test_sample_tokens_keeps_leading_shape() {
        let device = Device::Cpu;
        // [batch=2, codebooks=3, vocab=4], max always at index 1
        let row = [1.0f32, 9.0, 1.0, 1.0];
        let data: Vec<f32> = row.iter().copied().cycle().take(24).collect();
        let logits = Tensor::from_vec(data, (2, 3, 4), &device).unwrap();
        let mut ctx = SamplingContext::new(Some(42));
        let result = sample_tokens(&logits, &SamplingPolicy::Greedy, &mut ctx).unwrap();
        assert_eq!(result.dims(), &[2, 3]);
        let picked: Vec<Vec<u32>> = result.to_vec2().unwrap();
        assert!(picked.iter().flatten().all(|&t| t == 1));
    }

    #[test]
    fn test_sample_tokens_very_low_temperature() {
        let device = Device::Cpu;
        // With very low temperature, should act like greedy
        let logits = Tensor::new(&[[1.0f32, 10.0, 2.0, 1.0]], &device).unwrap();
        let policy = SamplingPolicy::Categorical { temperature: 0.001 };
        let mut ctx = SamplingContext::new(Some(42));
        let result = sample_tokens(&logits, &policy, &mut ctx).unwrap();
        let idx: Vec<u32> = result.to_vec1().unwrap();
        assert_eq!(idx[0], 1); // Should pick the highest
    }

    #[test]
    fn test_sample_tokens_normal_temperature() {
        let device = Device::Cpu;
        // With normal temperature, sampling should work
        let logits = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0]], &device).unwrap();
        let mut ctx = SamplingContext::new(None);
        let result = sample_tokens(&logits, &SamplingPolicy::default(), &mut ctx).unwrap();
        let idx: Vec<u32> = result.to_vec1().unwrap();
        // Should return a valid index
        assert!(idx[0] < 4);
    }

    #[test]
    fn test_sample_tokens_with_batch() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[10.0f32, 1.0, 1.0], [1.0, 10.0, 1.0]], &device).unwrap();
        let policy = SamplingPolicy::TopK {
            k: 1,
            temperature: 1.0,
        };
        let mut ctx = SamplingContext::new(Some(42));
        let result = sample_tokens(&logits, &policy, &mut ctx).unwrap();
        let idx: Vec<u32> = result.to_vec1().unwrap();
        assert_eq!(idx[0], 0);
        assert_eq!(idx[1], 1);
    }

    #[test]
    fn test_rand_f32_range() {
        let mut ctx = SamplingContext::new(None);
        for _ in 0..100 {
            let r = ctx.rand_f32();
            assert!(r >= 0.0);
            assert!(r < 1.0);
        }
    }

    #[test]
    fn test_multinomial_sample_deterministic_probs() {
        let device = Device::Cpu;
        // Probability of 1.0 on one token
        let probs = Tensor::new(&[[0.0f32, 1.0, 0.0, 0.0]], &device).unwrap();
        let mut ctx = SamplingContext::new(Some(42));
        let result = multinomial_sample(&probs, &mut ctx).unwrap();
        let idx: Vec<u32> = result.to_vec1().unwrap();
        assert_eq!(idx[0], 1); // Should always pick index 1
    }

    #[test]
    fn test_seeded_deterministic() {
        // With the same seed, should get the same random values
        let mut ctx1 = SamplingContext::new(Some(12345));
        let values1: Vec<f32> = (0..10).map(|_| ctx1.rand_f32()).collect();

        let mut ctx2 = SamplingContext::new(Some(12345));
        let values2: Vec<f32> = (0..10).map(|_| ctx2.rand_f32()).collect();

        for (a, b) in values1.iter().zip(values2.iter()) {
            assert!((a - b).abs() < 1e-9, "Seeded values should be identical");
        }
    }

    #[test]
    fn test_different_seeds_different_values() {
        let mut ctx1 = SamplingContext::new(Some(12345));
        let values1: Vec<f32> = (0..10).map(|_| ctx1.rand_f32()).collect();

        let mut ctx2 = SamplingContext::new(Some(67890));
        let values2: Vec<f32> = (0..10).map(|_| ctx2.rand_f32()).collect();

        let same_count = values1
            .iter()
            .zip(values2.iter())
            .filter(|(a, b)| (*a - *b).abs() < 1e-9)
            .count();
        assert!(
            same_count < 10,
            "Different seeds should produce different values"
        );
    }

    #[test]
    fn test_reset() {
        let mut ctx = SamplingContext::new(Some(42));
        let _first = ctx.rand_f32();
        let second = ctx.rand_f32();

        ctx.reset(42);
        let after_reset_first = ctx.rand_f32();
        let after_reset_second = ctx.rand_f32();

        let mut fresh = SamplingContext::new(Some(42));
        let fresh_first = fresh.rand_f32();
        let fresh_second = fresh.rand_f32();

        assert!((after_reset_first - fresh_first).abs() < 1e-9);
        assert!((after_reset_second - fresh_second).abs() < 1e-9);
        assert!((after_reset_second - second).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_sampling_deterministic() {
        let device = Device::Cpu;
        // Uniform-ish logits so sampling isn't just greedy
        let logits = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0, 1.0]], &device).unwrap();
        let policy = SamplingPolicy::Categorical { temperature: 1.0 };

        let mut ctx1 = SamplingContext::new(Some(99999));
        let mut results1 = Vec::new();
        for _ in 0..5 {
            let result = sample_tokens(&logits, &policy, &mut ctx1).unwrap();
            results1.push(result.flatten_all().unwrap().to_vec1::<u32>().unwrap()[0]);
        }

        let mut ctx2 = SamplingContext::new(Some(99999));
        let mut results2 = Vec::new();
        for _ in 0..5 {
            let result = sample_tokens(&logits, &policy, &mut ctx2).unwrap();
            results2.push(result.flatten_all().unwrap().to_vec1::<u32>().unwrap()[0]);
        }

        assert_eq!(
            results1, results2,
            "Seeded sampling should be deterministic"
        );
    }

    #[test]
    fn test_top_k_filter_keeps_top_values() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 5.0, 3.0, 2.0, 4.0]], &device).unwrap();
        let filtered = top_k_filter(&logits, 3).unwrap();
        let vals: Vec<f32> = filtered.flatten_all().unwrap().to_vec1().unwrap();
        // Top-3 are indices 1(5.0), 4(4.0), 2(3.0); rest should be -inf
        assert!((vals[1] - 5.0).abs() < 1e-5);
        assert!((vals[4] - 4.0).abs() < 1e-5);
        assert!((vals[2] - 3.0).abs() < 1e-5);
        assert!(vals[0].is_infinite() && vals[0] < 0.0);
        assert!(vals[3].is_infinite() && vals[3] < 0.0);
    }

    #[test]
    fn test_top_k_filter_k_larger_than_vocab() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 2.0, 3.0]], &device).unwrap();
        let filtered = top_k_filter(&logits, 100).unwrap();
        let vals: Vec<f32> = filtered.flatten_all().unwrap().to_vec1().unwrap();
        // All values should be preserved
        assert!((vals[0] - 1.0).abs() < 1e-5);
        assert!((vals[1] - 2.0).abs() < 1e-5);
        assert!((vals[2] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_top_p_filter_nucleus() {
        let device = Device::Cpu;
        // One dominant logit should survive top-p filtering
        let logits = Tensor::new(&[[10.0f32, 0.0, 0.0, 0.0]], &device).unwrap();
        let filtered = top_p_filter(&logits, 0.9).unwrap();
        let vals: Vec<f32> = filtered.flatten_all().unwrap().to_vec1().unwrap();
        // The dominant token should be kept
        assert!((vals[0] - 10.0).abs() < 1e-5);
    }

    #[test]
    fn test_top_p_filter_uniform_keeps_enough() {
        let device = Device::Cpu;
        // Uniform logits — top-p=0.5 should keep roughly half
        let logits = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0]], &device).unwrap();
        let filtered = top_p_filter(&logits, 0.5).unwrap();
        let vals: Vec<f32> = filtered.flatten_all().unwrap().to_vec1().unwrap();
        let kept = vals.iter().filter(|v| !v.is_infinite()).count();
        // Should keep at least 2 and not all 4
        assert!(kept >= 2);
        assert!(kept <= 4);
    }

    #[test]
    fn test_apply_guidance_identity_at_one() {
        let device = Device::Cpu;
        let cond = Tensor::new(&[[1.0f32, 2.0, 3.0]], &device).unwrap();
        let uncond = Tensor::new(&[[0.0f32, 0.0, 0.0]], &device).unwrap();
        let out = apply_guidance(&cond, &uncond, 1.0).unwrap();
        let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_apply_guidance_extrapolates() {
        let device = Device::Cpu;
        let cond = Tensor::new(&[[1.0f32, 0.0]], &device).unwrap();
        let uncond = Tensor::new(&[[0.0f32, 1.0]], &device).unwrap();
        let out = apply_guidance(&cond, &uncond, 3.0).unwrap();
        let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        // uncond + (cond - uncond) * 3
        assert!((vals[0] - 3.0).abs() < 1e-5);
        assert!((vals[1] - (-2.0)).abs() < 1e-5);
    }

    #[test]
    fn test_penalize_logits_prefers_unseen_tokens() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0]], &device).unwrap();
        let counts = Tensor::new(&[[1.0f32, 0.0, 0.0, 0.0]], &device).unwrap();
        let penalized = penalize_logits(&logits, &counts, 2.0).unwrap();
        let picked = greedy_sample(&penalized).unwrap();
        let idx: Vec<u32> = picked.to_vec1().unwrap();
        assert_ne!(idx[0], 0);
    }

    #[test]
    fn test_penalize_logits_monotonic_in_coef() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 1.0, 0.0]], &device).unwrap();
        let counts = Tensor::new(&[[0.5f32, 0.0, 0.0]], &device).unwrap();
        let mut last = f32::INFINITY;
        for coef in [0.0, 1.0, 2.0, 4.0] {
            let penalized = penalize_logits(&logits, &counts, coef).unwrap();
            let repeated: f32 = penalized.i((0, 0)).unwrap().to_scalar().unwrap();
            assert!(repeated < last, "coef {coef} did not lower the score");
            last = repeated;
        }
    }

    #[test]
    fn test_penalize_logits_zero_counts_keep_order() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 5.0, 2.0]], &device).unwrap();
        let counts = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        let penalized = penalize_logits(&logits, &counts, 2.0).unwrap();
        let picked = greedy_sample(&penalized).unwrap();
        let idx: Vec<u32> = picked.to_vec1().unwrap();
        assert_eq!(idx[0], 1);
    }

    #[test]
    fn test_update_counts_ema() {
        let device = Device::Cpu;
        let counts = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let token = Tensor::new(&[2u32], &device).unwrap();

        let counts = update_counts(&counts, &token, 0.25).unwrap();
        let vals: Vec<f32> = counts.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![0.0, 0.0, 0.25, 0.0]);

        // repeating the same token compounds: 0.25 * 0.75 + 0.25
        let counts = update_counts(&counts, &token, 0.25).unwrap();
        let vals: Vec<f32> = counts.flatten_all().unwrap().to_vec1().unwrap();
        assert!((vals[2] - 0.4375).abs() < 1e-6);

        // a different token decays the old one
        let other = Tensor::new(&[0u32], &device).unwrap();
        let counts = update_counts(&counts, &other, 0.25).unwrap();
        let vals: Vec<f32> = counts.flatten_all().unwrap().to_vec1().unwrap();
        assert!((vals[0] - 0.25).abs() < 1e-6);
        assert!((vals[2] - 0.328125).abs() < 1e-6);
    }
}
