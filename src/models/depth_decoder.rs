//! Depth decoder: a small transformer over the codebook axis.
//!
//! For each temporal step the backbone produces one shared latent; the depth
//! decoder consumes that latent and emits one audio token per codebook, each
//! codebook conditioned on the token chosen for the previous one. Its
//! "sequence" axis is the codebook index, so positions and KV caches run
//! from `0` to `num_codebooks - 1` and reset at the end of every step.

use anyhow::{ensure, bail, Context, Result};
use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{linear, linear_no_bias, rms_norm, Linear, RmsNorm, VarBuilder};

use super::config::LmConfig;
use super::kv_cache::LayerCache;
use super::transformer::{create_causal_mask, DecoderLayer, RotaryEmbedding, ZeroIdxEmbedding};
use crate::tokens::Modality;

pub struct DepthDecoder {
    /// Latent projections, one shared or one per codebook.
    input_projs: Vec<Linear>,
    /// Conditioning table for codebook 0 when a text stream is modeled.
    text_emb: Option<ZeroIdxEmbedding>,
    /// Conditioning tables for codebooks `1..`, indexed by `codebook - 1`.
    token_embs: Vec<ZeroIdxEmbedding>,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rope: RotaryEmbedding,
    /// Output heads, one per codebook, over the audio cardinality.
    heads: Vec<Linear>,
    num_codebooks: usize,
    cardinality: usize,
    audio_offset: usize,
}

impl DepthDecoder {
    pub fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        let depth_cfg = config
            .depth_decoder
            .as_ref()
            .context("model config has no depth decoder section")?;
        let num_codebooks = config.num_audio_codebooks;
        let transformer_cfg = depth_cfg.transformer(num_codebooks);

        let num_projs = if depth_cfg.per_codebook_input {
            num_codebooks
        } else {
            1
        };
        let mut input_projs = Vec::with_capacity(num_projs);
        for k in 0..num_projs {
            input_projs.push(linear_no_bias(
                config.backbone.dim,
                depth_cfg.dim,
                vb.pp(format!("in_proj.{k}")),
            )?);
        }

        let text_emb = match config.text_vocab_size() {
            Some(vocab) => Some(ZeroIdxEmbedding::new(vocab, depth_cfg.dim, vb.pp("text_emb"))?),
            None => None,
        };
        let mut token_embs = Vec::with_capacity(num_codebooks.saturating_sub(1));
        for k in 0..num_codebooks.saturating_sub(1) {
            token_embs.push(ZeroIdxEmbedding::new(
                config.audio_vocab_size(),
                depth_cfg.dim,
                vb.pp(format!("token_embs.{k}")),
            )?);
        }

        let mut layers = Vec::with_capacity(transformer_cfg.num_layers);
        for i in 0..transformer_cfg.num_layers {
            layers.push(DecoderLayer::new(
                &transformer_cfg,
                vb.pp(format!("layers.{i}")),
            )?);
        }

        let mut heads = Vec::with_capacity(num_codebooks);
        for k in 0..num_codebooks {
            let head_vb = vb.pp(format!("heads.{k}"));
            let head = if config.bias_proj {
                linear(depth_cfg.dim, config.audio_cardinality, head_vb)?
            } else {
                linear_no_bias(depth_cfg.dim, config.audio_cardinality, head_vb)?
            };
            heads.push(head);
        }

        Ok(Self {
            input_projs,
            text_emb,
            token_embs,
            norm: rms_norm(depth_cfg.dim, depth_cfg.rms_norm_eps, vb.pp("norm"))?,
            rope: RotaryEmbedding::new(
                transformer_cfg.head_dim(),
                transformer_cfg.max_seq_len,
                transformer_cfg.rope_theta,
                vb.device(),
            )?,
            layers,
            heads,
            num_codebooks,
            cardinality: config.audio_cardinality,
            audio_offset: config.audio_offset(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn input_proj(&self, codebook: usize) -> &Linear {
        if self.input_projs.len() == 1 {
            &self.input_projs[0]
        } else {
            &self.input_projs[codebook]
        }
    }

    /// Conditioning embedding for one codebook position during scoring.
    ///
    /// `delayed_codes` is `[batch, streams, steps + 1]` including the initial
    /// column; the latent at step `s` predicts column `s + 1`, so conditioning
    /// tokens are read from columns `1..`.
    fn training_conditioning(
        &self,
        delayed_codes: &Tensor,
        codebook: usize,
        modality: Modality,
    ) -> Result<Option<Tensor>> {
        let steps = delayed_codes.dim(2)? - 1;
        if codebook == 0 {
            match (&self.text_emb, modality.generates_text()) {
                (Some(emb), true) => {
                    let ids = delayed_codes.i((.., 0))?.narrow(1, 1, steps)?;
                    Ok(Some(emb.forward(&ids)?))
                }
                _ => Ok(None),
            }
        } else {
            let stream = codebook - 1 + self.audio_offset;
            let ids = delayed_codes.i((.., stream))?.narrow(1, 1, steps)?;
            Ok(Some(self.token_embs[codebook - 1].forward(&ids)?))
        }
    }

    /// Teacher-forced pass over every codebook position at once.
    ///
    /// `latents` is `[batch, steps, backbone_dim]`, `delayed_codes` is
    /// `[batch, streams, steps + 1]` (i64, delayed, with the initial column).
    /// Returns logits `[batch, num_codebooks, steps, cardinality]`.
    pub fn forward_training(
        &self,
        latents: &Tensor,
        delayed_codes: &Tensor,
        modality: Modality,
    ) -> Result<Tensor> {
        let (batch, steps, _) = latents.dims3()?;
        ensure!(
            delayed_codes.dim(2)? == steps + 1,
            "delayed codes have {} columns for {} latent steps",
            delayed_codes.dim(2)?,
            steps
        );

        // Build the [batch, steps, codebooks, dim] input grid, then fold the
        // temporal axis into the batch so attention runs over codebooks only.
        let mut per_codebook = Vec::with_capacity(self.num_codebooks);
        for k in 0..self.num_codebooks {
            let mut x = self.input_proj(k).forward(latents)?;
            if let Some(cond) = self.training_conditioning(delayed_codes, k, modality)? {
                x = (x + cond)?;
            }
            per_codebook.push(x);
        }
        let stacked = Tensor::stack(&per_codebook, 2)?;
        let mut hidden = stacked.reshape((batch * steps, self.num_codebooks, ()))?;

        let mask = create_causal_mask(self.num_codebooks, 0, latents.device())?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rope, Some(&mask), None, None, 0)?;
        }
        let normed = self.norm.forward(&hidden)?;

        let mut logits = Vec::with_capacity(self.num_codebooks);
        for (k, head) in self.heads.iter().enumerate() {
            let h = normed.narrow(1, k, 1)?;
            let l = head.forward(&h)?;
            logits.push(l.reshape((batch, steps, self.cardinality))?);
        }
        Ok(Tensor::stack(&logits, 1)?)
    }

    /// One codebook position of a decode burst.
    ///
    /// `latent` is the backbone output for the current step, `[batch, 1,
    /// backbone_dim]`. `prev_token` carries the token that conditions this
    /// position: the step's text token for codebook 0 (when text was
    /// generated), or the previous codebook's token for positions `1..`.
    /// Returns logits `[batch, cardinality]`.
    pub fn step(
        &self,
        latent: &Tensor,
        prev_token: Option<&Tensor>,
        codebook: usize,
        caches: &mut [LayerCache],
    ) -> Result<Tensor> {
        ensure!(
            codebook < self.num_codebooks,
            "codebook {codebook} out of range for {} codebooks",
            self.num_codebooks
        );
        ensure!(
            caches.len() == self.layers.len(),
            "expected {} layer caches, got {}",
            self.layers.len(),
            caches.len()
        );
        let (_batch, steps, _) = latent.dims3()?;
        ensure!(steps == 1, "decode bursts take one latent at a time");

        let mut x = self.input_proj(codebook).forward(latent)?;
        let cond = match (codebook, prev_token) {
            (0, None) => None,
            (0, Some(token)) => match &self.text_emb {
                Some(emb) => Some(emb.forward(token)?),
                None => bail!("internal error: text conditioning without a text stream"),
            },
            (k, Some(token)) => Some(self.token_embs[k - 1].forward(token)?),
            (k, None) => bail!("internal error: codebook {k} needs the previous token"),
        };
        if let Some(cond) = cond {
            x = (x + cond)?;
        }

        // Position within the burst is the codebook index; single-token
        // queries over the cached prefix need no mask.
        let mut hidden = x;
        for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
            hidden = layer.forward(&hidden, &self.rope, None, None, Some(cache), codebook)?;
        }
        let normed = self.norm.forward(&hidden)?;
        let logits = self.heads[codebook].forward(&normed)?;
        Ok(logits.squeeze(1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::{DepthDecoderConfig, TransformerConfig};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> LmConfig {
        LmConfig {
            num_audio_codebooks: 3,
            audio_cardinality: 24,
            text_cardinality: Some(16),
            backbone: TransformerConfig {
                dim: 32,
                num_heads: 2,
                intermediate_size: 64,
                num_layers: 1,
                max_seq_len: 64,
                ..Default::default()
            },
            depth_decoder: Some(DepthDecoderConfig {
                dim: 16,
                num_heads: 2,
                intermediate_size: 32,
                num_layers: 2,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build(config: &LmConfig) -> DepthDecoder {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        DepthDecoder::new(config, vb).unwrap()
    }

    #[test]
    fn test_forward_training_shapes() {
        let config = small_config();
        let decoder = build(&config);
        let device = Device::Cpu;

        // 2 samples, 3 steps; streams = text + 3 audio codebooks
        let latents = Tensor::randn(0.0f32, 1.0, (2, 3, 32), &device).unwrap();
        let delayed = Tensor::zeros((2, 4, 4), DType::I64, &device).unwrap();

        let logits = decoder
            .forward_training(&latents, &delayed, Modality::Both)
            .unwrap();
        assert_eq!(logits.dims(), &[2, 3, 3, 24]);
    }

    #[test]
    fn test_forward_training_checks_column_count() {
        let config = small_config();
        let decoder = build(&config);
        let device = Device::Cpu;

        let latents = Tensor::randn(0.0f32, 1.0, (2, 3, 32), &device).unwrap();
        // missing the initial column
        let delayed = Tensor::zeros((2, 4, 3), DType::I64, &device).unwrap();
        assert!(decoder
            .forward_training(&latents, &delayed, Modality::Both)
            .is_err());
    }

    #[test]
    fn test_step_walks_the_codebooks() {
        let config = small_config();
        let decoder = build(&config);
        let device = Device::Cpu;

        let mut caches: Vec<LayerCache> =
            (0..decoder.num_layers()).map(|_| LayerCache::new()).collect();
        let latent = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &device).unwrap();

        // codebook 0 conditioned on the step's text token
        let text_token = Tensor::from_vec(vec![5i64], (1, 1), &device).unwrap();
        let logits = decoder
            .step(&latent, Some(&text_token), 0, &mut caches)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 24]);
        assert_eq!(caches[0].self_kv.len(), 1);

        // remaining codebooks conditioned on the previous one's choice
        for k in 1..3 {
            let prev = Tensor::from_vec(vec![7i64], (1, 1), &device).unwrap();
            let logits = decoder.step(&latent, Some(&prev), k, &mut caches).unwrap();
            assert_eq!(logits.dims(), &[1, 24]);
            assert_eq!(caches[0].self_kv.len(), k + 1);
        }
    }

    #[test]
    fn test_step_without_text_conditioning() {
        let config = small_config();
        let decoder = build(&config);
        let device = Device::Cpu;

        let mut caches: Vec<LayerCache> =
            (0..decoder.num_layers()).map(|_| LayerCache::new()).collect();
        let latent = Tensor::randn(0.0f32, 1.0, (2, 1, 32), &device).unwrap();

        // audio-only generation leaves codebook 0 unconditioned
        let logits = decoder.step(&latent, None, 0, &mut caches).unwrap();
        assert_eq!(logits.dims(), &[2, 24]);
    }

    #[test]
    fn test_step_requires_previous_token_past_codebook_zero() {
        let config = small_config();
        let decoder = build(&config);
        let device = Device::Cpu;

        let mut caches: Vec<LayerCache> =
            (0..decoder.num_layers()).map(|_| LayerCache::new()).collect();
        let latent = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &device).unwrap();
        assert!(decoder.step(&latent, None, 1, &mut caches).is_err());
    }

    #[test]
    fn test_step_rejects_out_of_range_codebook() {
        let config = small_config();
        let decoder = build(&config);
        let device = Device::Cpu;

        let mut caches: Vec<LayerCache> =
            (0..decoder.num_layers()).map(|_| LayerCache::new()).collect();
        let latent = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &device).unwrap();
        let prev = Tensor::from_vec(vec![0i64], (1, 1), &device).unwrap();
        assert!(decoder.step(&latent, Some(&prev), 3, &mut caches).is_err());
    }

    #[test]
    fn test_per_codebook_projections() {
        let config = LmConfig {
            depth_decoder: Some(DepthDecoderConfig {
                dim: 16,
                num_heads: 2,
                intermediate_size: 32,
                num_layers: 1,
                per_codebook_input: true,
                ..Default::default()
            }),
            ..small_config()
        };
        let decoder = build(&config);
        assert_eq!(decoder.input_projs.len(), 3);

        let device = Device::Cpu;
        let latents = Tensor::randn(0.0f32, 1.0, (1, 2, 32), &device).unwrap();
        let delayed = Tensor::zeros((1, 4, 3), DType::I64, &device).unwrap();
        let logits = decoder
            .forward_training(&latents, &delayed, Modality::Audio)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 3, 2, 24]);
    }
}
