//! Shared transformer building blocks.
//!
//! Contains `RotaryEmbedding`, `Attention`, `CrossAttention`, `MLP`,
//! `DecoderLayer` and the sentinel-aware `ZeroIdxEmbedding` — used by both
//! the backbone assembled in [`super::lm`] and the per-step depth decoder in
//! [`super::depth_decoder`].

use anyhow::{bail, Result};
use candle_core::{Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

#[cfg(feature = "flash-attn")]
use candle_flash_attn::flash_attn;

use super::config::TransformerConfig;
use super::kv_cache::{KVCache, LayerCache};
use crate::tokens::Token;

/// Create a causal attention mask.
///
/// Returns a `[1, 1, seq_len, offset + seq_len]` tensor where position `(i, j)`
/// is `0.0` if `j <= offset + i` (allowed) and `NEG_INFINITY` (masked).
pub fn create_causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total_len = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j <= offset + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();

    Ok(Tensor::new(mask.as_slice(), device)?.reshape((1, 1, seq_len, total_len))?)
}

/// Apply RoPE rotation to a tensor.
///
/// `x` has shape `[batch, heads, seq_len, head_dim]`.
/// `cos` and `sin` have shape `[seq_len, head_dim/2]`.
fn apply_rope_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (_b, _h, _seq, d) = x.dims4()?;
    let x1 = x.narrow(D::Minus1, 0, d / 2)?;
    let x2 = x.narrow(D::Minus1, d / 2, d / 2)?;

    // Broadcast cos/sin from [seq_len, half_dim] to [1, 1, seq_len, half_dim]
    let cos = cos
        .unsqueeze(0)?
        .unsqueeze(0)?
        .to_dtype(x.dtype())?
        .broadcast_as(x1.shape())?;
    let sin = sin
        .unsqueeze(0)?
        .unsqueeze(0)?
        .to_dtype(x.dtype())?
        .broadcast_as(x1.shape())?;

    // Standard RoPE: [x1*cos - x2*sin, x2*cos + x1*sin]
    let rotated = Tensor::cat(
        &[
            &(x1.mul(&cos)? - x2.mul(&sin)?)?,
            &(x2.mul(&cos)? + x1.mul(&sin)?)?,
        ],
        D::Minus1,
    )?;

    Ok(rotated)
}

/// Rotary position embedding (standard RoPE)
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / (theta as f32).powf(i as f32 / dim as f32))
            .collect();

        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        let cos = freqs.cos()?;
        let sin = freqs.sin()?;

        Ok(Self { cos, sin })
    }

    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.i(offset..offset + seq_len)?;
        let sin = self.sin.i(offset..offset + seq_len)?;

        let q_rot = apply_rope_rotation(q, &cos, &sin)?;
        let k_rot = apply_rope_rotation(k, &cos, &sin)?;

        Ok((q_rot, k_rot))
    }
}

/// Expand grouped KV heads to match the query head count.
fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }

    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?;
    Ok(x)
}

/// Multi-head self-attention with grouped-query attention and QK
/// normalization.
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        let num_heads = config.num_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();

        let q_proj = linear_no_bias(dim, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(dim, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(dim, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, dim, vb.pp("o_proj"))?;

        // QK normalization: RMSNorm applied per-head after projection
        let q_norm = rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm = rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        attention_mask: Option<&Tensor>,
        kv_cache: Option<&mut KVCache>,
        offset: usize,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        // Project Q, K, V
        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // Reshape to [batch, seq, heads, head_dim] for QK norm
        let q = q.reshape((batch, seq_len, self.num_heads, self.head_dim))?;
        let k = k.reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;

        // Apply QK normalization (per-head RMSNorm)
        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;

        // Transpose to [batch, heads, seq, head_dim]
        let q = q.transpose(1, 2)?;
        let k = k.transpose(1, 2)?;
        let v = v.transpose(1, 2)?;

        // Apply rotary embeddings
        let (q, k) = rope.apply(&q, &k, offset)?;

        // Update KV cache
        let (k, v) = if let Some(cache) = kv_cache {
            cache.update(&k, &v)?
        } else {
            (k, v)
        };

        // ---- Attention computation ----
        // Priority: flash-attn (CUDA) > Metal SDPA > manual matmul fallback

        #[cfg(feature = "flash-attn")]
        let use_flash = q.device().is_cuda();
        #[cfg(not(feature = "flash-attn"))]
        let use_flash = false;

        let attn_output = if use_flash {
            #[cfg(feature = "flash-attn")]
            {
                // Flash Attention 2: handles GQA natively (no repeat_kv needed),
                // uses causal=true instead of an explicit attention mask.
                // Requires half-precision — cast f32→bf16 for the kernel, cast back after.
                let _ = attention_mask;
                let input_dtype = q.dtype();
                // flash_attn expects [B, S, H, D] — transpose back from [B, H, S, D]
                let q = q
                    .transpose(1, 2)?
                    .to_dtype(candle_core::DType::BF16)?
                    .contiguous()?;
                let k = k
                    .transpose(1, 2)?
                    .to_dtype(candle_core::DType::BF16)?
                    .contiguous()?;
                let v = v
                    .transpose(1, 2)?
                    .to_dtype(candle_core::DType::BF16)?
                    .contiguous()?;
                let softmax_scale = self.scale as f32;
                let attn_output = flash_attn(&q, &k, &v, softmax_scale, /* causal */ true)?;
                // [B, S_q, H_q, D] → cast back → [B, S_q, hidden]
                attn_output.to_dtype(input_dtype)?.reshape((
                    batch,
                    seq_len,
                    self.num_heads * self.head_dim,
                ))?
            }
            #[cfg(not(feature = "flash-attn"))]
            unreachable!()
        } else if q.device().is_metal() && attention_mask.is_none() {
            // Metal SDPA for decode steps (seq_len=1, no mask needed).
            // Fused tiled kernel with native GQA; 2-pass for k_seq >= 1024.
            // Layout: [B, H, S, D] — already in this form after transpose.
            let q = q.contiguous()?;
            let k = k.contiguous()?;
            let v = v.contiguous()?;
            let attn_output = candle_nn::ops::sdpa(
                &q,
                &k,
                &v,
                /* mask */ None,
                /* causal */ true,
                self.scale as f32,
                /* softcapping */ 1.0,
            )?;
            attn_output.transpose(1, 2)?.reshape((
                batch,
                seq_len,
                self.num_heads * self.head_dim,
            ))?
        } else {
            // CPU/CUDA-without-flash fallback: manual scaled dot-product attention
            let k = repeat_kv(&k, self.num_heads / self.num_kv_heads)?;
            let v = repeat_kv(&v, self.num_heads / self.num_kv_heads)?;
            let q = q.contiguous()?;
            let k = k.contiguous()?;
            let v = v.contiguous()?;
            let attn_weights =
                (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
            let attn_weights = if let Some(mask) = attention_mask {
                let mask = mask.to_dtype(attn_weights.dtype())?;
                attn_weights.broadcast_add(&mask)?
            } else {
                attn_weights
            };
            let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
            let attn_output = attn_weights.matmul(&v)?;
            attn_output.transpose(1, 2)?.reshape((
                batch,
                seq_len,
                self.num_heads * self.head_dim,
            ))?
        };

        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// Cross-attention over a fused conditioning source.
///
/// Keys and values are projected from the source once per streaming session
/// and cached; the source never changes mid-session. No positional encoding
/// and no causal structure apply across the source axis.
pub struct CrossAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CrossAttention {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        let num_heads = config.num_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();

        Ok(Self {
            q_proj: linear_no_bias(dim, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(dim, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(dim, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, dim, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn project_source(&self, source: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, src_len, _) = source.dims3()?;
        let k = self
            .k_proj
            .forward(source)?
            .reshape((batch, src_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(source)?
            .reshape((batch, src_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        Ok((k, v))
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        source: &Tensor,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self
            .q_proj
            .forward(hidden_states)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (k, v) = match kv_cache {
            Some(cache) => {
                if cache.is_empty() {
                    let (k, v) = self.project_source(source)?;
                    cache.update(&k, &v)?
                } else {
                    match cache.kv() {
                        Some((k, v)) => (k.clone(), v.clone()),
                        None => bail!("internal error: cross-attention cache not populated"),
                    }
                }
            }
            None => self.project_source(source)?,
        };

        let k = repeat_kv(&k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(&v, self.num_heads / self.num_kv_heads)?;
        let q = q.contiguous()?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;
        let attn_weights =
            (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;
        let attn_output =
            attn_output
                .transpose(1, 2)?
                .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// MLP block with SwiGLU activation
pub struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        let intermediate_size = config.intermediate_size;

        Ok(Self {
            gate_proj: linear_no_bias(dim, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(dim, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, dim, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?;
        let gate = candle_nn::ops::silu(&gate)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Transformer decoder layer with optional cross-attention.
pub struct DecoderLayer {
    self_attn: Attention,
    cross_attn: Option<CrossAttention>,
    mlp: MLP,
    input_layernorm: RmsNorm,
    cross_attention_layernorm: Option<RmsNorm>,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let (cross_attn, cross_attention_layernorm) = if config.cross_attention {
            (
                Some(CrossAttention::new(config, vb.pp("cross_attn"))?),
                Some(rms_norm(
                    config.dim,
                    config.rms_norm_eps,
                    vb.pp("cross_attention_layernorm"),
                )?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            cross_attn,
            mlp: MLP::new(config, vb.pp("mlp"))?,
            input_layernorm: rms_norm(config.dim, config.rms_norm_eps, vb.pp("input_layernorm"))?,
            cross_attention_layernorm,
            post_attention_layernorm: rms_norm(
                config.dim,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        attention_mask: Option<&Tensor>,
        cross_source: Option<&Tensor>,
        cache: Option<&mut LayerCache>,
        offset: usize,
    ) -> Result<Tensor> {
        let (self_cache, cross_cache) = match cache {
            Some(c) => (Some(&mut c.self_kv), Some(&mut c.cross_kv)),
            None => (None, None),
        };

        // Self-attention with residual
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn_out = self
            .self_attn
            .forward(&normed, rope, attention_mask, self_cache, offset)?;
        let mut hidden_states = (hidden_states + attn_out)?;

        match (&self.cross_attn, cross_source) {
            (Some(cross), Some(source)) => {
                let normed = match &self.cross_attention_layernorm {
                    Some(norm) => norm.forward(&hidden_states)?,
                    None => bail!("internal error: cross-attention without its layer norm"),
                };
                let cross_out = cross.forward(&normed, source, cross_cache)?;
                hidden_states = (hidden_states + cross_out)?;
            }
            (None, None) => {}
            (Some(_), None) => {
                bail!("layer has cross-attention but no conditioning source was provided")
            }
            (None, Some(_)) => {
                bail!("conditioning source provided but the layer has no cross-attention")
            }
        }

        // MLP with residual
        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_out = self.mlp.forward(&normed)?;
        Ok((hidden_states + mlp_out)?)
    }
}

/// Embedding table that maps the zero-token sentinel to an all-zero vector.
///
/// Every stream's embedding uses this so that a stream filled with
/// [`Token::Zero`] contributes nothing to the summed step embedding.
pub struct ZeroIdxEmbedding {
    inner: Embedding,
}

impl ZeroIdxEmbedding {
    pub fn new(vocab_size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: embedding(vocab_size, dim, vb)?,
        })
    }

    /// Look up `ids` (i64), mapping [`Token::ZERO_ID`] entries to zeros.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let is_zero = ids.eq(Token::ZERO_ID)?;
        let safe = is_zero.where_cond(&ids.zeros_like()?, ids)?;
        let embedded = self.inner.forward(&safe)?;
        let mask = is_zero
            .unsqueeze(D::Minus1)?
            .broadcast_as(embedded.shape())?;
        Ok(mask.where_cond(&embedded.zeros_like()?, &embedded)?)
    }
}
