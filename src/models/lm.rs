//! The multi-stream language model.
//!
//! One backbone transformer reads all codebook streams summed into a single
//! embedding per step and produces a shared latent. Audio logits come either
//! from per-codebook linear heads applied directly to that latent, or from a
//! [`DepthDecoder`] that autoregresses across the codebook axis inside each
//! step. Text logits, when a text stream is modeled, always come from a
//! single linear head.
//!
//! Two decode surfaces are exposed: [`LmModel::score`] evaluates logits for
//! complete token grids in one pass (no caches), and [`LmModel::step`]
//! advances incremental decoding one call at a time against a
//! [`StreamingState`].

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{linear, linear_no_bias, rms_norm, Linear, RmsNorm, VarBuilder};
use tracing::{info, warn};

use super::config::LmConfig;
use super::depth_decoder::DepthDecoder;
use super::kv_cache::LayerCache;
use super::transformer::{create_causal_mask, DecoderLayer, RotaryEmbedding, ZeroIdxEmbedding};
use crate::conditions::{ConditionFuser, ConditionProvider, ConditionTensors};
use crate::generation::delay::{delay_grid, undelay_logits};
use crate::generation::streaming::StreamingState;
use crate::tokens::{Modality, Token, TokenGrid};

fn output_head(dim: usize, out: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    if bias {
        Ok(linear(dim, out, vb)?)
    } else {
        Ok(linear_no_bias(dim, out, vb)?)
    }
}

/// How audio logits are produced from the backbone latent.
enum AudioReadout {
    /// One linear head per codebook, all reading the same latent.
    Direct { heads: Vec<Linear> },
    /// A second transformer autoregressing across the codebook axis.
    Depth(DepthDecoder),
}

/// Last-position logits from one [`LmModel::step`] call.
///
/// `text` is `[batch, text_head_size]`. `audio` is `[batch, codebooks,
/// cardinality]` for the direct readout and `[batch, cardinality]` (one
/// codebook per call) for the depth readout.
#[derive(Debug)]
pub struct StepLogits {
    pub audio: Option<Tensor>,
    pub text: Option<Tensor>,
}

/// Per-stream logits and validity masks for a scored batch.
///
/// Logits are reported on the logical (undelayed) time axis; positions a
/// stream's delay pushed past the end of the batch are filled with NaN and
/// flagged invalid. Positions whose target token is [`Token::Zero`] are also
/// flagged invalid, so masks can be used directly as loss weights.
#[derive(Debug)]
pub struct ScoreOutput {
    /// `[batch, audio_codebooks, steps, cardinality]`
    pub audio_logits: Tensor,
    /// `[batch, audio_codebooks, steps]`, u8
    pub audio_mask: Tensor,
    /// `[batch, 1, steps, text_head_size]`
    pub text_logits: Option<Tensor>,
    /// `[batch, 1, steps]`, u8
    pub text_mask: Option<Tensor>,
}

pub struct LmModel {
    audio_embs: Vec<ZeroIdxEmbedding>,
    text_emb: Option<ZeroIdxEmbedding>,
    layers: Vec<DecoderLayer>,
    out_norm: RmsNorm,
    rope: RotaryEmbedding,
    text_head: Option<Linear>,
    audio_readout: AudioReadout,
    fuser: ConditionFuser,
    condition_provider: Option<Box<dyn ConditionProvider>>,
    config: LmConfig,
    device: Device,
    dtype: DType,
}

impl LmModel {
    pub fn new(config: LmConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if !config.delays.is_empty() && config.delays.len() < config.num_codebooks() {
            info!(
                supplied = config.delays.len(),
                streams = config.num_codebooks(),
                "extending the delay list by repeating its last value"
            );
        }
        if config.repeat_penalty_coef > 0.0 && config.depth_decoder.is_none() {
            warn!("repetition penalty is configured but has no effect without a depth decoder");
        }
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let mut audio_embs = Vec::with_capacity(config.num_audio_codebooks);
        for q in 0..config.num_audio_codebooks {
            audio_embs.push(ZeroIdxEmbedding::new(
                config.audio_vocab_size(),
                config.backbone.dim,
                vb.pp(format!("audio_emb.{q}")),
            )?);
        }
        let text_emb = match config.text_vocab_size() {
            Some(vocab) => Some(ZeroIdxEmbedding::new(
                vocab,
                config.backbone.dim,
                vb.pp("text_emb"),
            )?),
            None => None,
        };

        let backbone_vb = vb.pp("backbone");
        let mut layers = Vec::with_capacity(config.backbone.num_layers);
        for i in 0..config.backbone.num_layers {
            layers.push(DecoderLayer::new(
                &config.backbone,
                backbone_vb.pp(format!("layers.{i}")),
            )?);
        }
        let out_norm = rms_norm(
            config.backbone.dim,
            config.backbone.rms_norm_eps,
            backbone_vb.pp("norm"),
        )?;
        let rope = RotaryEmbedding::new(
            config.backbone.head_dim(),
            config.backbone.max_seq_len,
            config.backbone.rope_theta,
            vb.device(),
        )?;

        let text_head = match config.text_head_size() {
            Some(out) => Some(output_head(
                config.backbone.dim,
                out,
                config.bias_proj,
                vb.pp("text_head"),
            )?),
            None => None,
        };
        let audio_readout = if config.depth_decoder.is_some() {
            AudioReadout::Depth(DepthDecoder::new(&config, vb.pp("depth_decoder"))?)
        } else {
            let mut heads = Vec::with_capacity(config.num_audio_codebooks);
            for q in 0..config.num_audio_codebooks {
                heads.push(output_head(
                    config.backbone.dim,
                    config.audio_cardinality,
                    config.bias_proj,
                    vb.pp(format!("audio_heads.{q}")),
                )?);
            }
            AudioReadout::Direct { heads }
        };

        let fuser = ConditionFuser::new(config.fuser.clone());

        Ok(Self {
            audio_embs,
            text_emb,
            layers,
            out_norm,
            rope,
            text_head,
            audio_readout,
            fuser,
            condition_provider: None,
            config,
            device,
            dtype,
        })
    }

    /// Load a model from a JSON config and safetensors weight shards.
    pub fn load<P: AsRef<Path>>(
        config_path: P,
        weight_files: &[std::path::PathBuf],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let config = LmConfig::from_file(config_path)?;
        info!(files = weight_files.len(), ?dtype, "loading model weights");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_files, dtype, device)? };
        Self::new(config, vb)
    }

    /// Attach the encoder used to turn condition attributes into tensors.
    pub fn with_condition_provider(mut self, provider: Box<dyn ConditionProvider>) -> Self {
        self.condition_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn condition_provider(&self) -> Option<&dyn ConditionProvider> {
        self.condition_provider.as_deref()
    }

    pub fn uses_depth_decoder(&self) -> bool {
        matches!(self.audio_readout, AudioReadout::Depth(_))
    }

    /// Fresh caches sized for this model's backbone and depth decoder.
    pub fn streaming_state(&self) -> StreamingState {
        let depth_layers = match &self.audio_readout {
            AudioReadout::Depth(depth) => depth.num_layers(),
            AudioReadout::Direct { .. } => 0,
        };
        StreamingState::new(self.layers.len(), depth_layers)
    }

    /// First column fed to the model, one token per stream.
    ///
    /// Streams of a generated modality start from [`Token::Start`], the rest
    /// from [`Token::Zero`] — unless `same_initial` forces the start marker
    /// everywhere.
    pub fn initial_tokens(&self, modality: Modality) -> Vec<Token> {
        let mut initial = Vec::with_capacity(self.config.num_codebooks());
        if self.config.has_text() {
            initial.push(if self.config.same_initial || modality.generates_text() {
                Token::Start
            } else {
                Token::Zero
            });
        }
        let audio = if self.config.same_initial || modality.generates_audio() {
            Token::Start
        } else {
            Token::Zero
        };
        initial.extend(std::iter::repeat(audio).take(self.config.num_audio_codebooks));
        initial
    }

    pub(crate) fn check_modality(&self, modality: Modality) -> Result<()> {
        if modality.generates_text() && !self.config.has_text() {
            bail!("text generation requested but the model has no text stream");
        }
        Ok(())
    }

    /// Sum the embeddings of every stream belonging to a generated modality.
    fn embed_input(&self, codes: &Tensor, modality: Modality) -> Result<Tensor> {
        let mut sum: Option<Tensor> = None;
        if modality.generates_text() {
            if let Some(emb) = &self.text_emb {
                sum = Some(emb.forward(&codes.i((.., 0))?)?);
            }
        }
        if modality.generates_audio() {
            let offset = self.config.audio_offset();
            for (q, emb) in self.audio_embs.iter().enumerate() {
                let e = emb.forward(&codes.i((.., offset + q))?)?;
                sum = match sum {
                    Some(s) => Some((s + e)?),
                    None => Some(e),
                };
            }
        }
        sum.context("internal error: no streams to embed")
    }

    /// Run the backbone over `codes` (`[batch, streams, steps]`, i64).
    ///
    /// Returns the normed latents for the `steps` input positions (any
    /// prepended conditioning prefix already stripped) and the number of
    /// positions actually consumed, which the caller adds to its offset.
    fn run_backbone(
        &self,
        codes: &Tensor,
        conditions: Option<&ConditionTensors>,
        modality: Modality,
        caches: Option<&mut [LayerCache]>,
        offset: usize,
    ) -> Result<(Tensor, usize)> {
        let (_batch, _streams, steps) = codes.dims3()?;
        let embedded = self.embed_input(codes, modality)?;

        // Conditioning: sum/prepend fold into the input here; cross-routed
        // tensors are attended to inside each layer.
        let first = offset == 0;
        let (mut hidden, cross_source) = self.fuser.fuse(&embedded, conditions, first)?;
        let total = hidden.dim(1)?;

        let mask = if total > 1 {
            Some(create_causal_mask(total, offset, &self.device)?)
        } else {
            None
        };

        match caches {
            Some(caches) => {
                ensure!(
                    caches.len() == self.layers.len(),
                    "expected {} layer caches, got {}",
                    self.layers.len(),
                    caches.len()
                );
                for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
                    hidden = layer.forward(
                        &hidden,
                        &self.rope,
                        mask.as_ref(),
                        cross_source.as_ref(),
                        Some(cache),
                        offset,
                    )?;
                }
            }
            None => {
                for layer in &self.layers {
                    hidden = layer.forward(
                        &hidden,
                        &self.rope,
                        mask.as_ref(),
                        cross_source.as_ref(),
                        None,
                        offset,
                    )?;
                }
            }
        }

        let normed = self.out_norm.forward(&hidden)?;
        Ok((normed.narrow(1, total - steps, steps)?, total))
    }

    /// Score complete token grids in one teacher-forced pass.
    ///
    /// `codes` holds the logical (undelayed) tokens for every stream; the
    /// delay pattern, initial column and per-stream shifts are applied
    /// internally, and the returned logits sit back on the logical axis.
    pub fn score(
        &self,
        codes: &TokenGrid,
        conditions: Option<&ConditionTensors>,
        modality: Modality,
    ) -> Result<ScoreOutput> {
        self.check_modality(modality)?;
        ensure!(
            codes.codebooks() == self.config.num_codebooks(),
            "grid has {} streams, model expects {}",
            codes.codebooks(),
            self.config.num_codebooks()
        );
        ensure!(
            !codes.any(Token::is_ungenerated),
            "scoring requires fully populated token grids"
        );
        let steps = codes.steps();
        ensure!(steps > 0, "nothing to score");

        let delays = self.config.stream_delays()?;
        let initial = self.initial_tokens(modality);
        let cards = self.config.stream_cardinalities();

        let delayed = delay_grid(codes, &delays, &initial)?;
        let delayed_full = delayed.prepend_column(&initial)?;
        let input = delayed_full.slice_steps(0, steps)?;
        let input_tensor = input.to_tensor(&cards, &self.device)?;

        let (latents, _) = self.run_backbone(&input_tensor, conditions, modality, None, 0)?;

        let audio_offset = self.config.audio_offset();
        let delayed_logits = match &self.audio_readout {
            AudioReadout::Direct { heads } => {
                let mut per_head = Vec::with_capacity(heads.len());
                for head in heads {
                    per_head.push(head.forward(&latents)?);
                }
                Tensor::stack(&per_head, 1)?
            }
            AudioReadout::Depth(depth) => {
                let targets = delayed_full.to_tensor(&cards, &self.device)?;
                depth.forward_training(&latents, &targets, modality)?
            }
        };

        // Back to the logical time axis; drop positions the delays pushed off
        // the end, then positions whose target carries no value.
        let nonzero = codes.to_tensor(&cards, &self.device)?.ne(Token::ZERO_ID)?;
        let (audio_logits, audio_valid) =
            undelay_logits(&delayed_logits, &delays[audio_offset..], f32::NAN)?;
        let audio_mask =
            (audio_valid * nonzero.narrow(1, audio_offset, self.config.num_audio_codebooks)?)?;

        let (text_logits, text_mask) = match (&self.text_head, modality.generates_text()) {
            (Some(head), true) => {
                let logits = head.forward(&latents)?.unsqueeze(1)?;
                let (logits, valid) = undelay_logits(&logits, &delays[..1], f32::NAN)?;
                let mask = (valid * nonzero.narrow(1, 0, 1)?)?;
                (Some(logits), Some(mask))
            }
            _ => (None, None),
        };

        Ok(ScoreOutput {
            audio_logits,
            audio_mask,
            text_logits,
            text_mask,
        })
    }

    fn advance_burst(&self, state: &mut StreamingState, codebook: usize) {
        if codebook + 1 >= self.config.num_audio_codebooks {
            state.end_burst();
        } else {
            state.active_codebook = Some(codebook + 1);
        }
    }

    /// Advance incremental decoding by one call.
    ///
    /// Outside a burst, `input` is `[batch, streams, steps]` (the full prompt
    /// prefix on the first call, a single column after) and the returned
    /// logits cover the last position. With a depth decoder, a step that
    /// generates audio becomes a burst: each subsequent call takes the single
    /// token just sampled, shaped `[batch, 1, 1]`, and yields the next
    /// codebook's logits until the burst ends.
    pub fn step(
        &self,
        input: &Tensor,
        conditions: Option<&ConditionTensors>,
        modality: Modality,
        state: &mut StreamingState,
    ) -> Result<StepLogits> {
        if let Some(codebook) = state.active_codebook {
            let (_batch, streams, steps) = input.dims3()?;
            ensure!(
                streams == 1 && steps == 1,
                "a decode burst takes the single token just sampled, got ({streams}, {steps})"
            );
            let latent = state
                .latent
                .clone()
                .context("internal error: decode burst without a cached latent")?;
            let depth = match &self.audio_readout {
                AudioReadout::Depth(depth) => depth,
                AudioReadout::Direct { .. } => {
                    bail!("internal error: decode burst without a depth decoder")
                }
            };
            let prev = input.squeeze(1)?;
            let logits = depth.step(&latent, Some(&prev), codebook, &mut state.depth)?;
            self.advance_burst(state, codebook);
            return Ok(StepLogits {
                audio: Some(logits),
                text: None,
            });
        }

        self.check_modality(modality)?;
        let (_batch, streams, _steps) = input.dims3()?;
        ensure!(
            streams == self.config.num_codebooks(),
            "input has {streams} streams, model expects {}",
            self.config.num_codebooks()
        );

        let (latents, consumed) = self.run_backbone(
            input,
            conditions,
            modality,
            Some(&mut state.backbone),
            state.backbone_offset,
        )?;
        state.backbone_offset += consumed;
        let last = latents.narrow(1, latents.dim(1)? - 1, 1)?;

        let text = match (&self.text_head, modality.generates_text()) {
            (Some(head), true) => Some(head.forward(&last)?.squeeze(1)?),
            _ => None,
        };

        let audio = if modality.generates_audio() {
            match &self.audio_readout {
                AudioReadout::Direct { heads } => {
                    let mut per_head = Vec::with_capacity(heads.len());
                    for head in heads {
                        per_head.push(head.forward(&last)?.squeeze(1)?);
                    }
                    Some(Tensor::stack(&per_head, 1)?)
                }
                AudioReadout::Depth(depth) => {
                    state.latent = Some(last.clone());
                    if modality.generates_text() {
                        // the burst's first codebook is conditioned on the
                        // step's text token, which the caller samples next
                        state.active_codebook = Some(0);
                        None
                    } else {
                        let logits = depth.step(&last, None, 0, &mut state.depth)?;
                        self.advance_burst(state, 0);
                        Some(logits)
                    }
                }
            }
        } else {
            None
        };

        Ok(StepLogits { audio, text })
    }
}
