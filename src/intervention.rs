//! Interchange intervention on a rotated subspace
//!
//! Given hidden states from a base run and a source run at the same site,
//! both are rotated into the learned basis, the masked coordinates are taken
//! from the source and the rest from the base, and the mix is rotated back:
//!
//! ```text
//! mixed = mask * rotate(source) + (1 - mask) * rotate(base)
//! out   = unrotate(mixed)
//! ```
//!
//! With a soft mask this is differentiable with respect to the rotation and
//! the boundaries that produced the mask.

use std::ops::Range;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::rotation::{rotate_with, unrotate_with, BoundaryMaskedRotation};

/// Stateless interchange operation
pub struct Intervention;

impl Intervention {
    /// Swap the masked rotated subspace of `base` with that of `source`.
    ///
    /// `base` and `source` are `[batch, span, D]` (or any matching shape
    /// ending in `D`). `mask` is `[D]` or `[batch, D]` and is broadcast over
    /// positions. The result has the shape and dtype of `base`.
    pub fn apply(
        base: &Tensor,
        source: &Tensor,
        rotation: &BoundaryMaskedRotation,
        mask: &Tensor,
    ) -> Result<Tensor> {
        if base.dims() != source.dims() {
            anyhow::bail!(
                "Base and source hidden states differ in shape: {:?} vs {:?}",
                base.dims(),
                source.dims()
            );
        }
        let d = rotation.hidden_size();
        let width = base.dims().last().copied().unwrap_or(0);
        if width != d {
            anyhow::bail!("Hidden width {width} does not match rotation size {d}");
        }
        let mask = Self::broadcastable_mask(mask, base, d)?;

        let q = rotation.rotation_matrix()?;
        let base_rot = rotate_with(&q, base)?;
        let source_rot = rotate_with(&q, source)?;

        let keep = mask.affine(-1.0, 1.0)?;
        let mixed = (source_rot.broadcast_mul(&mask)? + base_rot.broadcast_mul(&keep)?)?;

        Ok(unrotate_with(&q, &mixed)?.to_dtype(base.dtype())?)
    }

    /// Shape a `[D]` or `[batch, D]` mask so it broadcasts against `hidden`
    fn broadcastable_mask(mask: &Tensor, hidden: &Tensor, d: usize) -> Result<Tensor> {
        let mask = mask.to_dtype(DType::F32)?;
        match mask.dims() {
            [w] if *w == d => Ok(mask),
            [b, w] if *w == d => {
                let batch = hidden.dims().first().copied().unwrap_or(0);
                if *b != batch {
                    anyhow::bail!("Mask batch {b} does not match hidden batch {batch}");
                }
                // [b, D] -> [b, 1, ..., D] so it spans every position
                let mut shape = vec![*b];
                shape.extend(std::iter::repeat(1).take(hidden.rank().saturating_sub(2)));
                shape.push(d);
                Ok(mask.reshape(shape)?)
            }
            other => anyhow::bail!("Mask shape {other:?} incompatible with hidden size {d}"),
        }
    }
}

/// Replace positions `span` of `hidden` (`[batch, seq, D]`) with `replacement`.
///
/// Builds a new tensor from prefix, replacement and suffix; `hidden` itself
/// is untouched.
pub fn splice_positions(hidden: &Tensor, span: Range<usize>, replacement: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, d) = hidden.dims3()?;
    if span.start >= span.end || span.end > seq_len {
        anyhow::bail!(
            "Splice span {}..{} invalid for sequence length {seq_len}",
            span.start,
            span.end
        );
    }
    let expected = [batch, span.end - span.start, d];
    if replacement.dims() != expected {
        anyhow::bail!(
            "Replacement shape {:?} does not match site shape {:?}",
            replacement.dims(),
            expected
        );
    }
    let replacement = replacement.to_dtype(hidden.dtype())?;

    let mut parts = Vec::with_capacity(3);
    if span.start > 0 {
        parts.push(hidden.narrow(1, 0, span.start)?);
    }
    parts.push(replacement);
    if span.end < seq_len {
        parts.push(hidden.narrow(1, span.end, seq_len - span.end)?);
    }
    Ok(Tensor::cat(&parts, 1)?)
}

/// 0/1 copy of a soft mask (`>= 0.5`), for inspection only
pub fn binarize_mask(mask: &Tensor) -> Result<Tensor> {
    Ok(mask.to_dtype(DType::F32)?.ge(0.5)?.to_dtype(DType::F32)?)
}

/// Exact 0/1 mask of width `hidden_size` selecting `dims`
pub fn fixed_mask(hidden_size: usize, dims: Range<usize>, device: &Device) -> Result<Tensor> {
    if dims.end > hidden_size {
        anyhow::bail!(
            "Mask range {}..{} exceeds hidden size {hidden_size}",
            dims.start,
            dims.end
        );
    }
    let values: Vec<f32> = (0..hidden_size)
        .map(|i| if dims.contains(&i) { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(values, hidden_size, device)?)
}
