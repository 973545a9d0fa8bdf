//! Causal attention masks
//!
//! Masks are cached by `(seq_len, device, dtype)`; the cache hands out
//! shallow clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Assumes a single device per backend type
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// `0.0` where key `j <= i` may be attended, `-inf` elsewhere:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Ok(cache) = CAUSAL_MASK_CACHE.lock() {
        if let Some(mask) = cache.get(&cache_key) {
            return Ok(mask.clone());
        }
    }

    let values: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(values, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    // A poisoned lock only costs the cache entry
    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.insert(cache_key, mask.clone());
    }
    Ok(mask)
}
