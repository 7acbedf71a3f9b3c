//! Model configuration.
//!
//! Everything that shapes the decoding engine is an explicit field here with
//! its default spelled out; nothing is read from process-global state. The
//! structs deserialize from the JSON config shipped next to the weights.

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::conditions::FuserConfig;

fn default_dim() -> usize {
    512
}

fn default_num_heads() -> usize {
    8
}

fn default_intermediate_size() -> usize {
    2048
}

fn default_num_layers() -> usize {
    8
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_seq_len() -> usize {
    4096
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

/// Shape of one transformer stack (backbone or depth decoder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Key/value heads for grouped-query attention; `None` means one per
    /// query head.
    #[serde(default)]
    pub num_kv_heads: Option<usize>,
    /// Per-head dimension; `None` derives it as `dim / num_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Give every layer a cross-attention block reading the fused
    /// conditioning source.
    #[serde(default)]
    pub cross_attention: bool,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            num_heads: default_num_heads(),
            num_kv_heads: None,
            head_dim: None,
            intermediate_size: default_intermediate_size(),
            num_layers: default_num_layers(),
            rope_theta: default_rope_theta(),
            max_seq_len: default_max_seq_len(),
            rms_norm_eps: default_rms_norm_eps(),
            cross_attention: false,
        }
    }
}

impl TransformerConfig {
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim.unwrap_or(self.dim / self.num_heads)
    }

    fn validate(&self, label: &str) -> Result<()> {
        ensure!(self.num_heads > 0, "{label}: num_heads must be positive");
        ensure!(self.num_layers > 0, "{label}: num_layers must be positive");
        ensure!(
            self.head_dim.is_some() || self.dim % self.num_heads == 0,
            "{label}: dim {} not divisible by {} heads and no explicit head_dim",
            self.dim,
            self.num_heads
        );
        ensure!(
            self.num_heads % self.num_kv_heads() == 0,
            "{label}: {} query heads not divisible by {} kv heads",
            self.num_heads,
            self.num_kv_heads()
        );
        Ok(())
    }
}

fn default_depth_dim() -> usize {
    256
}

fn default_depth_intermediate_size() -> usize {
    1024
}

fn default_depth_num_layers() -> usize {
    4
}

/// Configuration of the per-step depth decoder that refines the backbone's
/// shared latent into one token per audio codebook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthDecoderConfig {
    #[serde(default = "default_depth_dim")]
    pub dim: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default)]
    pub num_kv_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_depth_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_depth_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Project the shared latent with a distinct linear map per codebook
    /// instead of one shared projection.
    #[serde(default)]
    pub per_codebook_input: bool,
}

impl Default for DepthDecoderConfig {
    fn default() -> Self {
        Self {
            dim: default_depth_dim(),
            num_heads: default_num_heads(),
            num_kv_heads: None,
            head_dim: None,
            intermediate_size: default_depth_intermediate_size(),
            num_layers: default_depth_num_layers(),
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
            per_codebook_input: false,
        }
    }
}

impl DepthDecoderConfig {
    /// The transformer stack for this decoder. Its time axis is the codebook
    /// axis, so `num_codebooks` positions are all it will ever see.
    pub fn transformer(&self, num_codebooks: usize) -> TransformerConfig {
        TransformerConfig {
            dim: self.dim,
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            intermediate_size: self.intermediate_size,
            num_layers: self.num_layers,
            rope_theta: self.rope_theta,
            max_seq_len: num_codebooks.max(1),
            rms_norm_eps: self.rms_norm_eps,
            cross_attention: false,
        }
    }
}

fn default_num_audio_codebooks() -> usize {
    8
}

fn default_audio_cardinality() -> usize {
    2048
}

fn default_cfg_coef() -> f64 {
    1.0
}

fn default_repeat_penalty_length() -> f64 {
    4.0
}

/// Top-level configuration of the multi-stream model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmConfig {
    /// Number of audio residual codebooks.
    #[serde(default = "default_num_audio_codebooks")]
    pub num_audio_codebooks: usize,
    /// Audio vocabulary size per codebook; the start marker uses one extra
    /// embedding row beyond this.
    #[serde(default = "default_audio_cardinality")]
    pub audio_cardinality: usize,
    /// Text vocabulary size; `None` means the model has no text stream.
    #[serde(default)]
    pub text_cardinality: Option<usize>,
    /// Reuse this existing text id as padding instead of appending a row to
    /// the text output head.
    #[serde(default)]
    pub text_padding_id: Option<u32>,
    /// Per-codebook delays over the full stream axis (text first when
    /// modeled). A shorter list is extended by repeating its last value; an
    /// empty list means no delays.
    #[serde(default)]
    pub delays: Vec<usize>,
    /// Use the start marker as the initial token for every stream, even for
    /// a modality that is not being generated.
    #[serde(default)]
    pub same_initial: bool,
    /// Give output heads a bias term.
    #[serde(default)]
    pub bias_proj: bool,
    /// Default classifier-free guidance coefficient; 1.0 disables guidance.
    #[serde(default = "default_cfg_coef")]
    pub cfg_coef: f64,
    /// Run guidance as two separate passes with swapped streaming state
    /// instead of one batch-doubled pass.
    #[serde(default)]
    pub two_step_cfg: bool,
    /// Strength of the repetition penalty on the first audio codebook of a
    /// decode burst; 0.0 disables it. Only takes effect with a depth
    /// decoder, since direct heads decide all codebooks at once.
    #[serde(default)]
    pub repeat_penalty_coef: f64,
    /// Averaging window of the repetition-penalty EMA, in steps.
    #[serde(default = "default_repeat_penalty_length")]
    pub repeat_penalty_length: f64,
    #[serde(default)]
    pub backbone: TransformerConfig,
    #[serde(default)]
    pub depth_decoder: Option<DepthDecoderConfig>,
    #[serde(default)]
    pub fuser: FuserConfig,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            num_audio_codebooks: default_num_audio_codebooks(),
            audio_cardinality: default_audio_cardinality(),
            text_cardinality: None,
            text_padding_id: None,
            delays: Vec::new(),
            same_initial: false,
            bias_proj: false,
            cfg_coef: default_cfg_coef(),
            two_step_cfg: false,
            repeat_penalty_coef: 0.0,
            repeat_penalty_length: default_repeat_penalty_length(),
            backbone: TransformerConfig::default(),
            depth_decoder: None,
            fuser: FuserConfig::default(),
        }
    }
}

impl LmConfig {
    pub fn has_text(&self) -> bool {
        self.text_cardinality.is_some()
    }

    /// Index of the first audio codebook on the stream axis.
    pub fn audio_offset(&self) -> usize {
        usize::from(self.has_text())
    }

    /// Total number of streams: audio codebooks plus the text stream.
    pub fn num_codebooks(&self) -> usize {
        self.num_audio_codebooks + self.audio_offset()
    }

    /// Rows of each audio embedding table (vocabulary plus start marker).
    pub fn audio_vocab_size(&self) -> usize {
        self.audio_cardinality + 1
    }

    /// Rows of the text embedding table, when text is modeled.
    pub fn text_vocab_size(&self) -> Option<usize> {
        self.text_cardinality.map(|c| c + 1)
    }

    /// Output width of the text head: the padding row is only appended when
    /// no existing id doubles as padding.
    pub fn text_head_size(&self) -> Option<usize> {
        self.text_cardinality
            .map(|c| if self.text_padding_id.is_some() { c } else { c + 1 })
    }

    /// Vocabulary size per stream, text first when modeled. This is the
    /// cardinality used to encode [`crate::tokens::Token`]s for each stream.
    pub fn stream_cardinalities(&self) -> Vec<usize> {
        let mut cards = Vec::with_capacity(self.num_codebooks());
        if let Some(tc) = self.text_cardinality {
            cards.push(tc);
        }
        cards.extend(std::iter::repeat(self.audio_cardinality).take(self.num_audio_codebooks));
        cards
    }

    /// Delays over the full stream axis, extended to length
    /// [`Self::num_codebooks`] by repeating the last supplied value.
    pub fn stream_delays(&self) -> Result<Vec<usize>> {
        let k = self.num_codebooks();
        if self.delays.is_empty() {
            return Ok(vec![0; k]);
        }
        ensure!(
            self.delays.len() <= k,
            "{} delays for {} streams",
            self.delays.len(),
            k
        );
        let mut delays = self.delays.clone();
        let last = *delays.last().unwrap_or(&0);
        delays.resize(k, last);
        Ok(delays)
    }

    pub fn max_delay(&self) -> Result<usize> {
        Ok(self.stream_delays()?.into_iter().max().unwrap_or(0))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.num_audio_codebooks > 0,
            "at least one audio codebook is required"
        );
        ensure!(self.audio_cardinality > 0, "audio cardinality must be positive");
        if let (Some(pad), Some(card)) = (self.text_padding_id, self.text_cardinality) {
            ensure!(
                (pad as usize) < card,
                "text padding id {pad} outside the text vocabulary of {card}"
            );
        }
        self.stream_delays()?;
        self.backbone.validate("backbone")?;
        if let Some(depth) = &self.depth_decoder {
            depth
                .transformer(self.num_audio_codebooks)
                .validate("depth decoder")?;
        }
        self.fuser.validate()?;
        if !self.fuser.cross_attention.is_empty() && !self.backbone.cross_attention {
            bail!("fuser routes conditions to cross-attention but the backbone has none");
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}
