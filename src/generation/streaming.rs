//! Per-session decoding state.
//!
//! Everything incremental decoding accumulates lives in one owned value: the
//! backbone KV caches and position offset, the depth decoder's burst caches,
//! the latent pending inside a burst, and the repetition-penalty statistics.
//! A session is scoped by ownership — create a state, thread it through
//! [`crate::models::LmModel::step`] calls, drop it (or call
//! [`StreamingState::reset`]) to end the session. Nothing about a session is
//! stored in the model, so concurrent sessions on one model just use separate
//! states.

use candle_core::Tensor;

use crate::models::kv_cache::LayerCache;

pub struct StreamingState {
    /// One cache per backbone layer.
    pub backbone: Vec<LayerCache>,
    /// Positions already consumed by the backbone, including any prepended
    /// conditioning prefix.
    pub backbone_offset: usize,
    /// One cache per depth-decoder layer; live only inside a burst.
    pub depth: Vec<LayerCache>,
    /// Backbone latent the current burst is decoding from.
    pub latent: Option<Tensor>,
    /// Codebook the next burst call will decode, when a burst is open.
    pub active_codebook: Option<usize>,
    /// Per-token EMA counts for the repetition penalty, `[batch,
    /// cardinality]`. Lazily created on the first penalized step and kept
    /// across bursts.
    pub repetition_counts: Option<Tensor>,
}

impl StreamingState {
    pub fn new(num_backbone_layers: usize, num_depth_layers: usize) -> Self {
        Self {
            backbone: (0..num_backbone_layers).map(|_| LayerCache::new()).collect(),
            backbone_offset: 0,
            depth: (0..num_depth_layers).map(|_| LayerCache::new()).collect(),
            latent: None,
            active_codebook: None,
            repetition_counts: None,
        }
    }

    /// True between a backbone call that opened a burst and the call that
    /// decodes its last codebook.
    pub fn mid_burst(&self) -> bool {
        self.active_codebook.is_some()
    }

    /// Close the current burst: the latent and the depth caches are only
    /// meaningful within one step. Repetition statistics span steps and
    /// survive.
    pub fn end_burst(&mut self) {
        self.latent = None;
        self.active_codebook = None;
        for cache in &mut self.depth {
            cache.reset();
        }
    }

    /// Forget the whole session.
    pub fn reset(&mut self) {
        for cache in &mut self.backbone {
            cache.reset();
        }
        self.backbone_offset = 0;
        self.end_burst();
        self.repetition_counts = None;
    }
}
