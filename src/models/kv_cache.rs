//! KV caches for incremental evaluation.
//!
//! [`KVCache`] is a concatenation-based cache that works on every backend.
//! [`LayerCache`] pairs one self-attention cache with one cross-attention
//! cache per transformer layer; the cross cache is filled once per streaming
//! session since the conditioning source never changes mid-session.

use anyhow::Result;
use candle_core::Tensor;

/// Concatenation-based KV cache for one attention block.
#[derive(Default)]
pub struct KVCache {
    pub(crate) k: Option<Tensor>,
    pub(crate) v: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self { k: None, v: None }
    }

    pub fn update_k(&mut self, k: &Tensor) -> Result<Tensor> {
        let k = if let Some(prev_k) = &self.k {
            Tensor::cat(&[prev_k, k], 2)?
        } else {
            k.clone()
        };
        self.k = Some(k.clone());
        Ok(k)
    }

    pub fn update_v(&mut self, v: &Tensor) -> Result<Tensor> {
        let v = if let Some(prev_v) = &self.v {
            Tensor::cat(&[prev_v, v], 2)?
        } else {
            v.clone()
        };
        self.v = Some(v.clone());
        Ok(v)
    }

    /// Append K/V and return the full sequences so far.
    pub fn update(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = self.update_k(k)?;
        let v = self.update_v(v)?;
        Ok((k, v))
    }

    /// The cached K/V pair, if any has been written.
    pub fn kv(&self) -> Option<(&Tensor, &Tensor)> {
        self.k.as_ref().zip(self.v.as_ref())
    }

    /// Number of cached sequence positions.
    pub fn len(&self) -> usize {
        self.k
            .as_ref()
            .and_then(|k| k.dims().get(2).copied())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_none()
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Incremental caches of a single transformer layer.
#[derive(Default)]
pub struct LayerCache {
    pub self_kv: KVCache,
    pub cross_kv: KVCache,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.self_kv.reset();
        self.cross_kv.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_kv_cache_new() {
        let cache = KVCache::new();
        assert!(cache.k.is_none());
        assert!(cache.v.is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_kv_cache_update() {
        let device = Device::Cpu;
        let mut cache = KVCache::new();

        let k1 = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 16), &device).unwrap();
        let k_out = cache.update_k(&k1).unwrap();
        assert_eq!(k_out.dims(), &[1, 2, 4, 16]);

        let k2 = Tensor::randn(0.0f32, 1.0, (1, 2, 3, 16), &device).unwrap();
        let k_out = cache.update_k(&k2).unwrap();
        assert_eq!(k_out.dims(), &[1, 2, 7, 16]); // 4 + 3 = 7
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn test_kv_cache_reset() {
        let device = Device::Cpu;
        let mut cache = KVCache::new();

        let k = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 16), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 16), &device).unwrap();
        cache.update(&k, &v).unwrap();
        assert!(cache.kv().is_some());

        cache.reset();
        assert!(cache.k.is_none());
        assert!(cache.v.is_none());
    }

    #[test]
    fn test_layer_cache_reset_clears_both() {
        let device = Device::Cpu;
        let mut cache = LayerCache::new();
        let k = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 8), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 8), &device).unwrap();
        cache.self_kv.update(&k, &v).unwrap();
        cache.cross_kv.update(&k, &v).unwrap();

        cache.reset();
        assert!(cache.self_kv.is_empty());
        assert!(cache.cross_kv.is_empty());
    }
}
