//! The top-level generation loop.
//!
//! Drives [`LmModel::step`] over the delayed physical timeline: a buffer of
//! `max_gen_len + max_delay + 1` columns starts out undecided, the prompt is
//! replayed at each stream's delay offset, and every step samples the next
//! column, honoring caller-supplied values and delays that have not arrived
//! yet. At the end the delay pattern is undone and the logical grid returned.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::conditions::{build_cfg_conditions, CfgConditions, ConditionAttributes};
use crate::generation::delay::undelay_grid;
use crate::generation::sampling::{
    apply_guidance, penalize_logits, sample_tokens, update_counts, SamplingContext, SamplingPolicy,
};
use crate::generation::streaming::StreamingState;
use crate::models::lm::{LmModel, StepLogits};
use crate::tokens::{Modality, Token, TokenGrid};

/// Knobs for [`LmModel::generate`], with every default spelled out.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// Logical steps to produce per stream.
    pub max_gen_len: usize,
    /// How next tokens are picked from logits.
    pub policy: SamplingPolicy,
    /// Guidance coefficient; `None` falls back to the model config.
    pub cfg_coef: Option<f64>,
    /// Guidance arrangement; `None` falls back to the model config.
    pub two_step_cfg: Option<bool>,
    /// Which streams to generate.
    pub modality: Modality,
    /// Trailing prompt steps dropped before replay, to skip padding
    /// artifacts at the end of an encoded prompt. 1 is usually enough.
    pub strip: usize,
    /// Validate every value fed into the model. Slow; debugging aid.
    pub check: bool,
    /// Replay at least from this offset even when the prompt is longer, so
    /// replicas with different prompts execute identical step counts.
    pub min_start_offset: Option<usize>,
    /// Sampling seed; `None` draws from system entropy.
    pub seed: Option<u64>,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_gen_len: 256,
            policy: SamplingPolicy::default(),
            cfg_coef: None,
            two_step_cfg: None,
            modality: Modality::Audio,
            strip: 0,
            check: false,
            min_start_offset: None,
            seed: None,
        }
    }
}

/// Streaming state per guidance pass.
///
/// Two-pass guidance keeps a second, independently owned state so the
/// conditional and unconditional passes can never corrupt each other's
/// caches. The other arrangements only ever touch `cond`.
struct GuidanceStates {
    cond: StreamingState,
    uncond: Option<StreamingState>,
}

impl GuidanceStates {
    fn new(model: &LmModel, conditions: &CfgConditions) -> Self {
        let uncond = matches!(conditions, CfgConditions::TwoPass { .. })
            .then(|| model.streaming_state());
        Self {
            cond: model.streaming_state(),
            uncond,
        }
    }
}

/// Split batch-doubled logits back into (conditional, null) halves and
/// combine them.
fn split_guided(logits: &Tensor, batch: usize, cfg_coef: f64) -> Result<Tensor> {
    let cond = logits.narrow(0, 0, batch)?;
    let uncond = logits.narrow(0, batch, batch)?;
    apply_guidance(&cond, &uncond, cfg_coef)
}

/// Encode one resolved token per batch row as a `[batch, 1, 1]` burst input.
fn burst_input(tokens: &[Token], cardinality: usize, device: &Device) -> Result<Tensor> {
    let ids: Vec<i64> = tokens.iter().map(|t| t.to_id(cardinality)).collect();
    Ok(Tensor::from_vec(ids, (tokens.len(), 1, 1), device)?)
}

/// Apply the no-overwrite and delay-arrival rules to freshly produced
/// candidates for stream `k` at physical step `offset`: a caller-supplied
/// value always wins over a candidate, and a stream whose delay has not
/// arrived yet stays at its initial token.
fn resolve_stream(
    grid: &TokenGrid,
    candidates: Vec<Token>,
    k: usize,
    offset: usize,
    delay: usize,
    initial: Token,
) -> Vec<Token> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(b, candidate)| {
            if offset < delay {
                return initial;
            }
            let existing = grid.get(b, k, offset + 1);
            if existing.is_ungenerated() {
                candidate
            } else {
                existing
            }
        })
        .collect()
}

impl LmModel {
    /// Sample token sequences from the model, optionally continuing a prompt
    /// and/or steering with conditioning attributes.
    ///
    /// `prompt` is a logical `[batch, streams, steps]` grid; positions set to
    /// [`Token::Ungenerated`] are sampled while the rest are replayed as-is
    /// (partial teacher forcing). The batch size is taken from `num_samples`,
    /// the prompt, or the attribute list, which must agree where present.
    /// `callback` is invoked once per physical step with
    /// `(steps_done, steps_total)`.
    ///
    /// Returns a fully decided `[batch, streams, max_gen_len]` grid; streams
    /// of a modality that was not generated are filled with [`Token::Zero`].
    pub fn generate(
        &self,
        prompt: Option<&TokenGrid>,
        attributes: &[ConditionAttributes],
        num_samples: Option<usize>,
        params: &GenerateParams,
        callback: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<TokenGrid> {
        let mut resolved = num_samples;
        if let Some(grid) = prompt {
            match resolved {
                None => resolved = Some(grid.batch()),
                Some(n) => ensure!(
                    grid.batch() == n,
                    "prompt has batch size {} for {n} requested samples",
                    grid.batch()
                ),
            }
        }
        if !attributes.is_empty() {
            match resolved {
                None => resolved = Some(attributes.len()),
                Some(n) => ensure!(
                    attributes.len() == n,
                    "{} condition attribute sets for {n} requested samples",
                    attributes.len()
                ),
            }
        }
        let num_samples = resolved.unwrap_or(1);

        let cfg_coef = params.cfg_coef.unwrap_or(self.config().cfg_coef);
        let two_step = params.two_step_cfg.unwrap_or(self.config().two_step_cfg);
        let conditions = if attributes.is_empty() {
            CfgConditions::None
        } else {
            let provider = self
                .condition_provider()
                .context("conditioning attributes supplied but the model has no condition provider")?;
            build_cfg_conditions(provider, attributes, cfg_coef, two_step)?
        };

        self.generate_with_conditions(prompt, &conditions, num_samples, params, callback)
    }

    /// [`LmModel::generate`] with the condition tensors already arranged for
    /// guidance, for callers that reuse one arrangement across many calls.
    pub fn generate_with_conditions(
        &self,
        prompt: Option<&TokenGrid>,
        conditions: &CfgConditions,
        num_samples: usize,
        params: &GenerateParams,
        mut callback: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<TokenGrid> {
        let config = self.config();
        let modality = params.modality;
        self.check_modality(modality)?;
        ensure!(params.max_gen_len > 0, "max_gen_len must be positive");
        ensure!(num_samples > 0, "num_samples must be positive");

        let cfg_coef = params.cfg_coef.unwrap_or(config.cfg_coef);
        if matches!(conditions, CfgConditions::None | CfgConditions::Plain(_)) {
            ensure!(
                cfg_coef == 1.0,
                "guidance coefficient {cfg_coef} needs a conditional/null condition arrangement"
            );
        }
        conditions.check_batch(num_samples)?;

        let num_codebooks = config.num_codebooks();
        let cards = config.stream_cardinalities();
        let delays = config.stream_delays()?;
        let max_delay = delays.iter().copied().max().unwrap_or(0);
        let total = params.max_gen_len + max_delay;
        ensure!(
            total <= config.backbone.max_seq_len,
            "max_gen_len {} plus max delay {max_delay} exceeds the backbone's {}-position window",
            params.max_gen_len,
            config.backbone.max_seq_len
        );

        // Physical buffer: everything undecided except the initial column and
        // the prompt, replayed at each stream's own delay offset.
        let initial = self.initial_tokens(modality);
        let buffer_len = total + 1;
        let mut gen_sequence =
            TokenGrid::filled(num_samples, num_codebooks, buffer_len, Token::Ungenerated);
        for b in 0..num_samples {
            for k in 0..num_codebooks {
                gen_sequence.set(b, k, 0, initial[k]);
            }
        }

        let mut start_offset = 0;
        if let Some(prompt) = prompt {
            ensure!(
                prompt.batch() == num_samples,
                "prompt has batch size {} for {num_samples} samples",
                prompt.batch()
            );
            ensure!(
                prompt.codebooks() == num_codebooks,
                "prompt has {} streams, model expects {num_codebooks}",
                prompt.codebooks()
            );
            ensure!(
                prompt.steps() > params.strip,
                "prompt of {} steps is too short to strip {} steps from",
                prompt.steps(),
                params.strip
            );
            let prompt_len = prompt.steps() - params.strip;
            ensure!(
                prompt_len <= params.max_gen_len,
                "prompt of {prompt_len} steps exceeds max_gen_len {}",
                params.max_gen_len
            );
            for b in 0..num_samples {
                for (k, &delay) in delays.iter().enumerate() {
                    for t in 0..=delay {
                        gen_sequence.set(b, k, t, initial[k]);
                    }
                    for t in 0..prompt_len {
                        gen_sequence.set(b, k, delay + 1 + t, prompt.get(b, k, t));
                    }
                }
            }
            // A step's output lands in the next column, so replay begins one
            // step before the earliest undecided position.
            let first_undecided = gen_sequence
                .first_step_where(Token::is_ungenerated)
                .context("nothing to generate: the prompt decides every position")?;
            start_offset = first_undecided - 1;
            if let Some(min_start) = params.min_start_offset {
                start_offset = start_offset.min(min_start);
            }
            debug!(start_offset, prompt_len, "replaying prompt");
        }

        let mut states = GuidanceStates::new(self, conditions);
        let mut rng = SamplingContext::new(params.seed);

        debug!(start_offset, total, ?modality, "starting generation");
        for offset in start_offset..total {
            #[cfg(feature = "profiling")]
            let _span = tracing::info_span!("decode_step", offset).entered();

            // Full prefix on the first step, one new column after; the
            // streaming caches carry everything older.
            let window = if offset == start_offset {
                gen_sequence.slice_steps(0, offset + 1)?
            } else {
                gen_sequence.slice_steps(offset, 1)?
            };
            if params.check {
                self.check_feed(&window)?;
            }
            let input = window.to_tensor(&cards, self.device())?;
            let logits =
                self.step_with_guidance(&input, conditions, cfg_coef, modality, &mut states)?;

            let column = if self.uses_depth_decoder() && modality.generates_audio() {
                self.burst_column(
                    logits,
                    &gen_sequence,
                    offset,
                    conditions,
                    cfg_coef,
                    modality,
                    params,
                    &delays,
                    &initial,
                    &cards,
                    &mut states,
                    &mut rng,
                )?
            } else {
                self.direct_column(
                    logits,
                    &gen_sequence,
                    offset,
                    modality,
                    params,
                    &delays,
                    &initial,
                    &mut rng,
                )?
            };

            for (k, stream) in column.iter().enumerate() {
                for (b, &token) in stream.iter().enumerate() {
                    gen_sequence.set(b, k, offset + 1, token);
                }
            }
            if let Some(f) = callback.as_mut() {
                f(1 + offset - start_offset, total - start_offset);
            }
        }

        // Undo the delay pattern; the logical window must be fully decided.
        let body = gen_sequence.slice_steps(1, total)?;
        let (output, mask) = undelay_grid(&body, &delays, Token::Ungenerated)?;
        ensure!(
            mask.all_valid_until(params.max_gen_len),
            "internal error: delay bookkeeping left invalid positions in the output window"
        );
        let output = output.slice_steps(0, params.max_gen_len)?;
        ensure!(
            !output.any(Token::is_ungenerated),
            "internal error: generation left undecided positions"
        );
        self.validate_output(&output, modality)?;
        debug!(
            steps = params.max_gen_len,
            batch = num_samples,
            "generation complete"
        );
        Ok(output)
    }

    /// One [`LmModel::step`] call behind the guidance arrangement, returning
    /// already-combined logits.
    fn step_with_guidance(
        &self,
        input: &Tensor,
        conditions: &CfgConditions,
        cfg_coef: f64,
        modality: Modality,
        states: &mut GuidanceStates,
    ) -> Result<StepLogits> {
        match conditions {
            CfgConditions::None => self.step(input, None, modality, &mut states.cond),
            CfgConditions::Plain(tensors) => {
                self.step(input, Some(tensors), modality, &mut states.cond)
            }
            CfgConditions::OnePass(tensors) => {
                let batch = input.dim(0)?;
                let doubled = Tensor::cat(&[input, input], 0)?;
                let logits = self.step(&doubled, Some(tensors), modality, &mut states.cond)?;
                let audio = match &logits.audio {
                    Some(t) => Some(split_guided(t, batch, cfg_coef)?),
                    None => None,
                };
                let text = match &logits.text {
                    Some(t) => Some(split_guided(t, batch, cfg_coef)?),
                    None => None,
                };
                Ok(StepLogits { audio, text })
            }
            CfgConditions::TwoPass { conditional, null } => {
                let cond = self.step(input, Some(conditional), modality, &mut states.cond)?;
                let uncond_state = states.uncond.as_mut().context(
                    "internal error: two-pass guidance without its unconditional state",
                )?;
                let uncond = self.step(input, Some(null), modality, uncond_state)?;
                let audio = match (&cond.audio, &uncond.audio) {
                    (Some(c), Some(u)) => Some(apply_guidance(c, u, cfg_coef)?),
                    (None, None) => None,
                    _ => bail!("internal error: guidance passes disagree on audio logits"),
                };
                let text = match (&cond.text, &uncond.text) {
                    (Some(c), Some(u)) => Some(apply_guidance(c, u, cfg_coef)?),
                    (None, None) => None,
                    _ => bail!("internal error: guidance passes disagree on text logits"),
                };
                Ok(StepLogits { audio, text })
            }
        }
    }

    /// Decide one column with the depth decoder: the backbone call opened a
    /// burst, every further stream takes one sub-call conditioned on the
    /// previous stream's resolved token.
    #[allow(clippy::too_many_arguments)]
    fn burst_column(
        &self,
        first: StepLogits,
        gen_sequence: &TokenGrid,
        offset: usize,
        conditions: &CfgConditions,
        cfg_coef: f64,
        modality: Modality,
        params: &GenerateParams,
        delays: &[usize],
        initial: &[Token],
        cards: &[usize],
        states: &mut GuidanceStates,
        rng: &mut SamplingContext,
    ) -> Result<Vec<Vec<Token>>> {
        let config = self.config();
        let num_codebooks = config.num_codebooks();
        let audio_offset = config.audio_offset();
        let batch = gen_sequence.batch();
        let penalty_coef = config.repeat_penalty_coef;
        let penalty_alpha = 1.0 / config.repeat_penalty_length;

        let mut pending_audio = first.audio;
        let pending_text = first.text;
        let mut column: Vec<Vec<Token>> = Vec::with_capacity(num_codebooks);
        // Resolved tokens of the stream decided last, conditioning the next
        // sub-call.
        let mut carry: Option<Vec<Token>> = None;

        for k in 0..num_codebooks {
            let skip = if k < audio_offset {
                !modality.generates_text()
            } else {
                !modality.generates_audio()
            };
            if skip {
                let resolved = resolve_stream(
                    gen_sequence,
                    vec![Token::Zero; batch],
                    k,
                    offset,
                    delays[k],
                    initial[k],
                );
                column.push(resolved);
                continue;
            }

            let picked = if k < audio_offset {
                let logits = pending_text
                    .as_ref()
                    .context("internal error: the backbone call produced no text logits")?;
                sample_tokens(logits, &params.policy, rng)?
            } else {
                let logits = match pending_audio.take() {
                    Some(logits) => logits,
                    None => {
                        let prev = carry
                            .as_ref()
                            .context("internal error: burst continuation without a previous token")?;
                        if params.check {
                            ensure!(
                                prev.iter().all(|t| !t.is_ungenerated()),
                                "internal error: an undecided token reached a burst sub-call"
                            );
                        }
                        let input = burst_input(prev, cards[k - 1], self.device())?;
                        let sub = self.step_with_guidance(
                            &input, conditions, cfg_coef, modality, states,
                        )?;
                        sub.audio
                            .context("internal error: burst continuation produced no audio logits")?
                    }
                };
                if k == audio_offset && penalty_coef > 0.0 {
                    // EMA-penalized sampling for the burst's first audio stream.
                    let counts = match states.cond.repetition_counts.take() {
                        Some(counts) => counts,
                        None => Tensor::zeros(
                            (batch, config.audio_cardinality),
                            DType::F32,
                            self.device(),
                        )?,
                    };
                    let penalized = penalize_logits(&logits, &counts, penalty_coef)?;
                    let picked = sample_tokens(&penalized, &params.policy, rng)?;
                    states.cond.repetition_counts =
                        Some(update_counts(&counts, &picked, penalty_alpha)?);
                    picked
                } else {
                    sample_tokens(&logits, &params.policy, rng)?
                }
            };

            let candidates: Vec<Token> = picked
                .to_vec1::<u32>()?
                .into_iter()
                .map(Token::Value)
                .collect();
            let resolved =
                resolve_stream(gen_sequence, candidates, k, offset, delays[k], initial[k]);
            carry = Some(resolved.clone());
            column.push(resolved);
        }

        Ok(column)
    }

    /// Decide one column from per-stream output heads, all reading the same
    /// backbone latent.
    #[allow(clippy::too_many_arguments)]
    fn direct_column(
        &self,
        logits: StepLogits,
        gen_sequence: &TokenGrid,
        offset: usize,
        modality: Modality,
        params: &GenerateParams,
        delays: &[usize],
        initial: &[Token],
        rng: &mut SamplingContext,
    ) -> Result<Vec<Vec<Token>>> {
        let config = self.config();
        let audio_offset = config.audio_offset();
        let batch = gen_sequence.batch();
        let mut column: Vec<Vec<Token>> = Vec::with_capacity(config.num_codebooks());

        if audio_offset == 1 {
            let candidates = if modality.generates_text() {
                let text = logits
                    .text
                    .as_ref()
                    .context("internal error: text logits missing from the step")?;
                sample_tokens(text, &params.policy, rng)?
                    .to_vec1::<u32>()?
                    .into_iter()
                    .map(Token::Value)
                    .collect()
            } else {
                vec![Token::Zero; batch]
            };
            column.push(resolve_stream(
                gen_sequence,
                candidates,
                0,
                offset,
                delays[0],
                initial[0],
            ));
        }

        if modality.generates_audio() {
            let audio = logits
                .audio
                .as_ref()
                .context("internal error: audio logits missing from the step")?;
            let picked = sample_tokens(audio, &params.policy, rng)?.to_vec2::<u32>()?;
            for q in 0..config.num_audio_codebooks {
                let k = audio_offset + q;
                let candidates = picked.iter().map(|row| Token::Value(row[q])).collect();
                column.push(resolve_stream(
                    gen_sequence,
                    candidates,
                    k,
                    offset,
                    delays[k],
                    initial[k],
                ));
            }
        } else {
            for q in 0..config.num_audio_codebooks {
                let k = audio_offset + q;
                column.push(resolve_stream(
                    gen_sequence,
                    vec![Token::Zero; batch],
                    k,
                    offset,
                    delays[k],
                    initial[k],
                ));
            }
        }

        Ok(column)
    }

    /// Reject model inputs that carry undecided or out-of-range values.
    fn check_feed(&self, window: &TokenGrid) -> Result<()> {
        ensure!(
            !window.any(Token::is_ungenerated),
            "internal error: an undecided position reached the model input"
        );
        let config = self.config();
        let audio_offset = config.audio_offset();
        for b in 0..window.batch() {
            for k in 0..window.codebooks() {
                // The text head may emit the appended padding row, whose id is
                // the cardinality itself; audio values stay strictly below.
                let bound = if k < audio_offset {
                    config.text_head_size().unwrap_or(0)
                } else {
                    config.audio_cardinality
                };
                for t in 0..window.steps() {
                    if let Some(v) = window.get(b, k, t).value() {
                        ensure!(
                            (v as usize) < bound,
                            "internal error: token {v} out of range for stream {k} (bound {bound})"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Final bounds check over the generated streams.
    fn validate_output(&self, output: &TokenGrid, modality: Modality) -> Result<()> {
        let config = self.config();
        let audio_offset = config.audio_offset();
        for b in 0..output.batch() {
            for k in 0..output.codebooks() {
                for t in 0..output.steps() {
                    let token = output.get(b, k, t);
                    if k >= audio_offset && modality.generates_audio() {
                        match token {
                            Token::Value(v) => ensure!(
                                (v as usize) < config.audio_cardinality,
                                "internal error: audio token {v} out of range"
                            ),
                            Token::Zero => {}
                            Token::Start | Token::Ungenerated => {
                                bail!("internal error: marker token survived in audio output")
                            }
                        }
                    }
                    if k < audio_offset && modality.generates_text() {
                        if let Some(card) = config.text_cardinality {
                            match token {
                                Token::Value(v) => ensure!(
                                    (v as usize) <= card,
                                    "internal error: text token {v} out of range"
                                ),
                                Token::Ungenerated => {
                                    bail!("internal error: marker token survived in text output")
                                }
                                Token::Zero | Token::Start => {}
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
