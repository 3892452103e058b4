//! Fitting frames to the consumer's requested stream size.

use crate::error::{ClientError, Result};
use crate::state::TargetSize;

/// Output size for a `width`x`height` frame under `hint`.
///
/// Keeps the aspect ratio and never upscales. Each hinted dimension is a
/// maximum; a missing dimension does not constrain.
pub fn target_stream_size(width: u32, height: u32, hint: TargetSize) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let mut scale = 1.0_f64;
    if let Some(limit) = hint.width {
        scale = scale.min(f64::from(limit) / f64::from(width));
    }
    if let Some(limit) = hint.height {
        scale = scale.min(f64::from(limit) / f64::from(height));
    }
    if scale >= 1.0 {
        return (width, height);
    }
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).clamp(1, v);
    (scaled(width), scaled(height))
}

/// Nearest-neighbour resample of tightly packed or strided RGBA.
///
/// `pixels` must hold at least `stride * height` bytes.
pub fn downscale_rgba(
    pixels: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    out_width: u32,
    out_height: u32,
) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let required = stride
        .checked_mul(h)
        .ok_or_else(|| ClientError::InvalidArgument("frame size overflows".to_string()))?;
    if pixels.len() < required {
        return Err(ClientError::InvalidArgument(format!(
            "pixel buffer too short: {} < {required}",
            pixels.len()
        )));
    }

    let (ow, oh) = (out_width as usize, out_height as usize);
    let mut out = vec![0u8; ow * oh * 4];
    if ow == 0 || oh == 0 || w == 0 || h == 0 {
        return Ok(out);
    }

    for y in 0..oh {
        let src_y = (y * h / oh).min(h - 1);
        let src_row = src_y * stride;
        let dst_row = y * ow * 4;
        for x in 0..ow {
            let src = src_row + (x * w / ow).min(w - 1) * 4;
            let dst = dst_row + x * 4;
            if let Some(px) = pixels.get(src..src + 4) {
                out[dst..dst + 4].copy_from_slice(px);
            }
        }
    }
    Ok(out)
}
